//! Scheduling simulator
//!
//! Dry-runs pod placement to answer one question: if these nodes go away,
//! does their workload still fit? First every reschedulable pod is offered
//! to the surviving nodes' free capacity; whatever remains must fit onto a
//! single hypothetical node drawn from a pool template, or the disruption is
//! infeasible.
//!
//! The simulator is about scheduling feasibility, not eviction feasibility:
//! pods blocked by disruption budgets are still treated as movable here, and
//! the eviction check happens later in the termination path.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use crate::crd::{CapacityType, Requirement, RequirementOperator};
use crate::provider::{InstanceType, UnavailableOfferings};
use crate::scheduling::requirements::{
    claims_satisfy, narrow_claims, pod_fits_labels, preferences_satisfied, Claims,
};
use crate::state::{PodRecord, Resources, SpreadPolicy, StateNode};

/// A pod the simulator must find a home for
#[derive(Clone, Debug)]
pub struct PlacePod {
    /// The pod's scheduling-relevant snapshot
    pub record: PodRecord,
    /// Whether its soft preferences were satisfied where it ran before;
    /// satisfied preferences are not given up just to make simulation succeed
    pub preferred_ok: bool,
}

impl PlacePod {
    /// Capture a pod from the node it currently runs on
    pub fn from_origin(record: &PodRecord, origin_labels: &BTreeMap<String, String>) -> Self {
        Self {
            preferred_ok: preferences_satisfied(record, origin_labels),
            record: record.clone(),
        }
    }
}

/// A pool template the simulator may draw one hypothetical node from
#[derive(Clone, Debug)]
pub struct PoolTemplate {
    /// Pool name
    pub pool_name: String,
    /// Current template hash of the pool
    pub pool_hash: String,
    /// Pool template requirements
    pub requirements: Vec<Requirement>,
    /// Instance types launchable for the pool
    pub instance_types: Vec<InstanceType>,
}

/// One launchable configuration for the hypothetical replacement
#[derive(Clone, Debug, PartialEq)]
pub struct ReplacementOption {
    /// Instance type name
    pub instance_type: String,
    /// Cheapest workable zone for that type
    pub zone: String,
    /// Capacity type of the priced offering
    pub capacity_type: CapacityType,
    /// Offering price
    pub price: f64,
}

/// The replacement the simulator found workable
#[derive(Clone, Debug)]
pub struct ReplacementPlan {
    /// Pool to launch from
    pub pool_name: String,
    /// Template hash to stamp on the node
    pub pool_hash: String,
    /// Requirements the launch must satisfy
    pub requirements: Vec<Requirement>,
    /// Workable options, cheapest first; one per (instance type, capacity type)
    pub options: Vec<ReplacementOption>,
}

impl ReplacementPlan {
    /// Keep only options strictly cheaper than `price`
    pub fn filter_by_price(&mut self, price: f64) {
        self.options.retain(|o| o.price < price);
    }

    /// Cheapest remaining option
    pub fn cheapest(&self) -> Option<&ReplacementOption> {
        self.options
            .iter()
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// Count of distinct instance types among remaining options
    pub fn instance_type_count(&self) -> usize {
        self.options
            .iter()
            .map(|o| o.instance_type.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Outcome of one simulation run
#[derive(Clone, Debug)]
pub enum SimulationOutcome {
    /// Every pod fits on the surviving nodes; plain deletion is possible
    FitsExisting,
    /// One hypothetical node hosts the residual pods; replacement is possible
    FitsWithReplacement(ReplacementPlan),
    /// The workload cannot be rehomed
    Infeasible,
}

// Free capacity, labels, and taints of one survivor during a simulation run
struct Survivor {
    labels: BTreeMap<String, String>,
    taints: Vec<crate::state::NodeTaint>,
    free: Resources,
}

// Every blocking taint on the node must be covered by some toleration.
fn taints_tolerated(pod: &PodRecord, taints: &[crate::state::NodeTaint]) -> bool {
    taints
        .iter()
        .all(|taint| pod.tolerations.iter().any(|t| t.tolerates(taint)))
}

/// Spread bookkeeping across topology domains
///
/// Counts pods per (owning controller, topology key, domain value). The
/// domains considered are the ones present on surviving nodes.
struct SpreadState {
    counts: HashMap<(String, String, String), i64>,
    domains: HashMap<String, HashSet<String>>,
}

impl SpreadState {
    fn from_survivors(survivors: &[&StateNode]) -> Self {
        let mut counts = HashMap::new();
        let mut domains: HashMap<String, HashSet<String>> = HashMap::new();
        for node in survivors {
            for (key, value) in &node.labels {
                domains
                    .entry(key.clone())
                    .or_default()
                    .insert(value.clone());
            }
            for pod in &node.pods {
                let Some(owner) = &pod.owner_id else { continue };
                for constraint in &pod.topology_spread {
                    if let Some(value) = node.labels.get(&constraint.topology_key) {
                        *counts
                            .entry((
                                owner.clone(),
                                constraint.topology_key.clone(),
                                value.clone(),
                            ))
                            .or_insert(0) += 1;
                    }
                }
            }
        }
        Self { counts, domains }
    }

    fn placement_allowed(&self, pod: &PlacePod, labels: &BTreeMap<String, String>) -> bool {
        let Some(owner) = &pod.record.owner_id else {
            return true;
        };
        for constraint in &pod.record.topology_spread {
            let enforce = match constraint.policy {
                SpreadPolicy::DoNotSchedule => true,
                // soft constraints are only kept if the pod had them satisfied
                SpreadPolicy::ScheduleAnyway => pod.preferred_ok,
            };
            if !enforce {
                continue;
            }
            let Some(target) = labels.get(&constraint.topology_key) else {
                continue;
            };
            let Some(domain_values) = self.domains.get(&constraint.topology_key) else {
                continue;
            };
            let count_in = |value: &str| {
                self.counts
                    .get(&(
                        owner.clone(),
                        constraint.topology_key.clone(),
                        value.to_string(),
                    ))
                    .copied()
                    .unwrap_or(0)
            };
            let min = domain_values.iter().map(|v| count_in(v)).min().unwrap_or(0);
            if count_in(target) + 1 - min > i64::from(constraint.max_skew) {
                return false;
            }
        }
        true
    }

    fn record_placement(&mut self, pod: &PlacePod, labels: &BTreeMap<String, String>) {
        let Some(owner) = &pod.record.owner_id else {
            return;
        };
        for constraint in &pod.record.topology_spread {
            if let Some(value) = labels.get(&constraint.topology_key) {
                *self
                    .counts
                    .entry((
                        owner.clone(),
                        constraint.topology_key.clone(),
                        value.clone(),
                    ))
                    .or_insert(0) += 1;
            }
        }
    }
}

/// Simulate rehoming `pods` onto `survivors`, then onto at most one
/// hypothetical node from `templates`.
///
/// `daemon_overhead` is the daemon footprint that would re-appear on the
/// replacement; it never competes for survivor capacity. Offerings cached as
/// unavailable are excluded from the replacement options.
pub fn simulate(
    pods: &[PlacePod],
    survivors: &[StateNode],
    templates: &[PoolTemplate],
    daemon_overhead: &Resources,
    unavailable: &UnavailableOfferings,
    max_options: usize,
) -> SimulationOutcome {
    // marked nodes receive nothing; nominated capacity is reserved for the
    // scheduler's imminent binds
    let eligible: Vec<&StateNode> = survivors
        .iter()
        .filter(|n| !n.marked_for_deletion && n.deletion_timestamp.is_none() && n.initialized)
        .collect();

    let mut spread = SpreadState::from_survivors(&eligible);
    let mut free: Vec<Survivor> = eligible
        .iter()
        .map(|n| Survivor {
            labels: n.labels.clone(),
            taints: n.taints.clone(),
            free: n.free_capacity(),
        })
        .collect();

    // first-fit decreasing by cpu keeps big pods from stranding
    let mut ordered: Vec<&PlacePod> = pods.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.record.requests.get("cpu")));

    let mut residual: Vec<&PlacePod> = Vec::new();
    'pods: for pod in ordered {
        for survivor in free.iter_mut() {
            if !pod_fits_labels(&pod.record, &survivor.labels) {
                continue;
            }
            if !taints_tolerated(&pod.record, &survivor.taints) {
                continue;
            }
            if pod.preferred_ok && !preferences_satisfied(&pod.record, &survivor.labels) {
                continue;
            }
            if !survivor.free.fits(&pod.record.requests) {
                continue;
            }
            if !spread.placement_allowed(pod, &survivor.labels) {
                continue;
            }
            survivor.free.saturating_sub(&pod.record.requests);
            spread.record_placement(pod, &survivor.labels);
            continue 'pods;
        }
        residual.push(pod);
    }

    if residual.is_empty() {
        return SimulationOutcome::FitsExisting;
    }

    // the residual must fit a single hypothetical node
    let mut needed = daemon_overhead.clone();
    for pod in &residual {
        needed.add(&pod.record.requests);
    }

    for template in templates {
        let mut options = Vec::new();
        for instance_type in &template.instance_types {
            if !instance_type.capacity.fits(&needed) {
                continue;
            }
            if let Some(option) =
                workable_offering(instance_type, template, &residual, unavailable)
            {
                options.push(option);
            }
        }
        if !options.is_empty() {
            options.sort_by(|a, b| a.price.total_cmp(&b.price));
            options.truncate(max_options);
            trace!(
                pool = %template.pool_name,
                options = options.len(),
                residual = residual.len(),
                "replacement found in simulation"
            );
            return SimulationOutcome::FitsWithReplacement(ReplacementPlan {
                pool_name: template.pool_name.clone(),
                pool_hash: template.pool_hash.clone(),
                requirements: template.requirements.clone(),
                options,
            });
        }
    }

    SimulationOutcome::Infeasible
}

// The cheapest offering of `instance_type` that satisfies the pool template
// and every residual pod's hard constraints, if any.
fn workable_offering(
    instance_type: &InstanceType,
    template: &PoolTemplate,
    residual: &[&PlacePod],
    unavailable: &UnavailableOfferings,
) -> Option<ReplacementOption> {
    let mut best: Option<ReplacementOption> = None;
    for offering in &instance_type.offerings {
        if !offering.available
            || unavailable.is_unavailable(&instance_type.name, &offering.zone, offering.capacity_type)
        {
            continue;
        }

        let claims = offering_claims(instance_type, template, offering);
        if !claims.values().all(|values| !values.is_empty()) {
            continue;
        }

        let all_fit = residual.iter().all(|pod| {
            let selector_reqs = selector_as_requirements(&pod.record.node_selector);
            if !claims_satisfy(&selector_reqs, &claims) {
                return false;
            }
            pod.record.required_affinity.is_empty()
                || pod
                    .record
                    .required_affinity
                    .iter()
                    .any(|term| claims_satisfy(term, &claims))
        });
        if !all_fit {
            continue;
        }

        let candidate = ReplacementOption {
            instance_type: instance_type.name.clone(),
            zone: offering.zone.clone(),
            capacity_type: offering.capacity_type,
            price: offering.price,
        };
        best = match best {
            Some(existing) if existing.price <= candidate.price => Some(existing),
            _ => Some(candidate),
        };
    }
    best
}

// Claims map for a hypothetical node: the concrete offering pins zone,
// capacity type, and instance type; the template and the catalog pin the rest.
fn offering_claims(
    instance_type: &InstanceType,
    template: &PoolTemplate,
    offering: &crate::provider::Offering,
) -> Claims {
    let mut claims: Claims = BTreeMap::new();
    for req in instance_type
        .requirements
        .iter()
        .chain(template.requirements.iter())
    {
        if req.operator == RequirementOperator::In {
            claims
                .entry(req.key.clone())
                .or_insert_with(|| req.values.clone());
        }
    }
    claims.insert(
        crate::INSTANCE_TYPE_LABEL.to_string(),
        vec![instance_type.name.clone()],
    );
    claims.insert(crate::ZONE_LABEL.to_string(), vec![offering.zone.clone()]);
    claims.insert(
        crate::CAPACITY_TYPE_LABEL.to_string(),
        vec![offering.capacity_type.to_string()],
    );
    claims.insert(
        crate::NODEPOOL_LABEL.to_string(),
        vec![template.pool_name.clone()],
    );
    // template requirements narrow whatever the catalog claimed
    narrow_claims(&claims, &template.requirements)
}

fn selector_as_requirements(selector: &BTreeMap<String, String>) -> Vec<Requirement> {
    selector
        .iter()
        .map(|(k, v)| Requirement {
            key: k.clone(),
            operator: RequirementOperator::In,
            values: vec![v.clone()],
        })
        .collect()
}
