//! Candidate selection and disruption cost
//!
//! For a given disruption reason, filter the fleet down to nodes the engine
//! may touch, price how much each disruption would hurt, and order the
//! survivors cheapest-first. Candidate ordering is a pure function of the
//! mirror snapshot, the reason, and the pool configs: identical inputs yield
//! identical order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::crd::{CapacityType, ConsolidationPolicy, DisruptionReason, NodePool};
use crate::provider::InstanceType;
use crate::state::StateNode;

/// A node eligible for disruption, with everything ordering needs
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The node snapshot
    pub node: StateNode,
    /// Owning pool name
    pub pool_name: String,
    /// Why the node is a candidate
    pub reason: DisruptionReason,
    /// Ordinal score; lower means cheaper to disrupt
    pub disruption_cost: f64,
    /// Current offering price of the node, when the catalog knows it
    pub price: Option<f64>,
    /// Capacity type the node runs on
    pub capacity_type: CapacityType,
}

/// Catalog of instance types per pool, keyed by type name
pub type PoolCatalogs = HashMap<String, HashMap<String, InstanceType>>;

/// Weight added to the base pod cost per unit of scheduling priority
///
/// Priorities run to ~1e9 for system-critical pods; normalizing by that
/// keeps a single priority-2e9 pod from dwarfing a node of fifty defaults.
const PRIORITY_SCALE: f64 = 1e9;

/// Cost of evicting one reschedulable pod
fn pod_cost(priority: i32) -> f64 {
    1.0 + f64::from(priority.max(0)) / PRIORITY_SCALE
}

/// Fraction of node lifetime remaining in [0.0, 1.0]
///
/// When the pool sets `expireAfter`, disruption cost is scaled down as the
/// node ages toward expiration: highest just after creation, approaching
/// zero near the deadline. Nodes about to expire anyway are cheap to move.
fn lifetime_remaining(pool: &NodePool, node: &StateNode, now: DateTime<Utc>) -> f64 {
    let Ok(Some(ttl)) = pool.spec.expire_after() else {
        return 1.0;
    };
    let ttl = ttl.as_secs_f64();
    if ttl <= 0.0 {
        return 1.0;
    }
    let age = (now - node.created_at).num_seconds() as f64;
    ((ttl - age) / ttl).clamp(0.0, 1.0)
}

/// Disruption cost of removing a node: priority-weighted pod count scaled by
/// the lifetime-remaining fraction
pub fn disruption_cost(pool: &NodePool, node: &StateNode, now: DateTime<Utc>) -> f64 {
    let base: f64 = node
        .reschedulable_pods()
        .map(|p| pod_cost(p.priority))
        .sum();
    base * lifetime_remaining(pool, node, now)
}

// A pod-level do-not-disrupt annotation blocks voluntary disruption, except
// that drift may proceed when the owning pool bounds the drain with a
// terminationGracePeriod (the pod still gets its own grace, force-applied).
fn blocked_by_pod_opt_out(
    node: &StateNode,
    pool: &NodePool,
    reason: DisruptionReason,
) -> bool {
    let has_opt_out = node.pods.iter().any(|p| {
        p.do_not_disrupt && !p.terminating && !p.phase.is_terminal() && !p.owned_by_node
    });
    if !has_opt_out {
        return false;
    }
    let grace_configured = matches!(pool.spec.termination_grace_period(), Ok(Some(_)));
    !(grace_configured && reason == DisruptionReason::Drifted)
}

fn consolidate_after_elapsed(pool: &NodePool, node: &StateNode, now: DateTime<Utc>) -> bool {
    let Ok(wait) = pool.spec.consolidate_after() else {
        return false;
    };
    let Ok(wait) = chrono::Duration::from_std(wait) else {
        return false;
    };
    now - node.last_pod_event >= wait
}

fn reason_applies(
    reason: DisruptionReason,
    pool: &NodePool,
    node: &StateNode,
    now: DateTime<Utc>,
) -> bool {
    match reason {
        DisruptionReason::Empty => {
            node.is_empty_of_workload() && consolidate_after_elapsed(pool, node, now)
        }
        DisruptionReason::Underutilized => {
            !node.is_empty_of_workload()
                && pool.spec.disruption.consolidation_policy
                    == ConsolidationPolicy::WhenEmptyOrUnderutilized
                && consolidate_after_elapsed(pool, node, now)
        }
        DisruptionReason::Drifted => node.drifted.is_some(),
    }
}

/// Select and order candidates for one disruption reason
///
/// `is_nominated` reads the mirror's nomination table; nominated nodes are
/// about to receive scheduler binds and are off limits.
pub fn select_candidates(
    reason: DisruptionReason,
    nodes: &[StateNode],
    pools: &HashMap<String, NodePool>,
    catalogs: &PoolCatalogs,
    is_nominated: impl Fn(&str) -> bool,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for node in nodes {
        // owned, initialized, alive, not already chosen
        let Some(pool_name) = &node.pool_name else { continue };
        let Some(pool) = pools.get(pool_name) else { continue };
        if !node.initialized || node.deleting() || is_nominated(&node.name) {
            continue;
        }

        // the instance type must resolve in the pool's catalog
        let instance_type = node
            .instance_type
            .as_deref()
            .and_then(|name| catalogs.get(pool_name).and_then(|c| c.get(name)));
        let Some(instance_type) = instance_type else {
            trace!(node = %node.name, "skipping candidate with unrecognized instance type");
            continue;
        };

        if node.do_not_disrupt {
            continue;
        }
        if blocked_by_pod_opt_out(node, pool, reason) {
            continue;
        }
        if !reason_applies(reason, pool, node, now) {
            continue;
        }

        let price = node
            .zone
            .as_deref()
            .and_then(|zone| instance_type.offering(zone, node.capacity_type))
            .map(|o| o.price)
            .or(node.launch_price);

        candidates.push(Candidate {
            pool_name: pool_name.clone(),
            reason,
            disruption_cost: disruption_cost(pool, node, now),
            price,
            capacity_type: node.capacity_type,
            node: node.clone(),
        });
    }

    // cheapest first; break ties toward fewer pods, then the oldest node
    candidates.sort_by(|a, b| {
        a.disruption_cost
            .total_cmp(&b.disruption_cost)
            .then_with(|| a.node.pods.len().cmp(&b.node.pods.len()))
            .then_with(|| a.node.created_at.cmp(&b.node.created_at))
            .then_with(|| a.node.name.cmp(&b.node.name))
    });
    candidates
}
