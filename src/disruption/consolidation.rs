//! Consolidation and drift planning
//!
//! Three consolidation phases run in order per tick:
//!
//! 1. **Empty-node phase** - every empty candidate that passes budgets is
//!    deleted together, no simulation needed.
//! 2. **Multi-node phase** - shrink N nodes into one replacement when the
//!    removed prices strictly exceed the replacement price. Groups are built
//!    from the cheapest candidates; the best savings wins.
//! 3. **Single-node phase** - cheapest candidate first: plain delete if the
//!    pods re-fit, otherwise a replacement restricted to strictly cheaper
//!    instance types.
//!
//! Spot-to-spot single-node replacement additionally demands a minimum
//! number of cheaper spot instance types to choose from; replacing one spot
//! node with one specific cheaper spot type trades a reclaim risk we cannot
//! price. N-to-1 replacements are exempt.
//!
//! Drift planning reuses the same machinery without the price filter: a
//! drifted node is replaced because its spec is wrong, not to save money.

use tracing::{debug, info};

use crate::crd::{CapacityType, DisruptionReason};
use crate::provider::UnavailableOfferings;
use crate::scheduling::{simulate, PlacePod, PoolTemplate, SimulationOutcome};
use crate::state::{Resources, StateNode};

use super::budgets::BudgetSnapshot;
use super::candidate::Candidate;
use super::DisruptionAction;

/// Upper bound on how many nodes one multi-node group may fold together
const MAX_GROUP_SIZE: usize = 10;

/// Everything the planner needs for one tick
pub struct PlanContext<'a> {
    /// Full fleet snapshot from the mirror
    pub snapshot: &'a [StateNode],
    /// Pool templates the simulator may draw a replacement from
    pub templates: &'a [PoolTemplate],
    /// Offerings recently seen failing to launch
    pub unavailable: &'a UnavailableOfferings,
    /// Headroom per pool and reason, consumed as nodes are chosen
    pub budgets: &'a mut BudgetSnapshot,
    /// Whether spot nodes may be replaced by spot nodes at all
    pub spot_to_spot_enabled: bool,
    /// Minimum distinct cheaper spot types for a spot-to-spot replacement
    pub spot_flex_min: usize,
    /// Cap on options handed to the adapter
    pub max_instance_types: usize,
}

impl PlanContext<'_> {
    // Pods that must be rehomed if `group` is removed: the group's own
    // reschedulable pods plus pods still sitting on nodes another decision is
    // already draining.
    fn pods_to_place(&self, group: &[&Candidate]) -> Vec<PlacePod> {
        let mut pods = Vec::new();
        for candidate in group {
            for pod in candidate.node.reschedulable_pods() {
                pods.push(PlacePod::from_origin(pod, &candidate.node.labels));
            }
        }
        for node in self.snapshot {
            if node.marked_for_deletion && !group.iter().any(|c| c.node.name == node.name) {
                for pod in node.reschedulable_pods() {
                    pods.push(PlacePod::from_origin(pod, &node.labels));
                }
            }
        }
        pods
    }

    fn simulate_group(&self, group: &[&Candidate], with_templates: bool) -> SimulationOutcome {
        let survivors: Vec<StateNode> = self
            .snapshot
            .iter()
            .filter(|n| !group.iter().any(|c| c.node.name == n.name))
            .cloned()
            .collect();

        let mut overhead = Resources::new();
        for candidate in group {
            overhead.max_with(&candidate.node.daemon_overhead());
        }

        let templates: &[PoolTemplate] = if with_templates { self.templates } else { &[] };
        simulate(
            &self.pods_to_place(group),
            &survivors,
            templates,
            &overhead,
            self.unavailable,
            self.max_instance_types,
        )
    }
}

/// Phase 1: delete all empty candidates that fit their pools' budgets
fn plan_empty(candidates: &[Candidate], ctx: &mut PlanContext<'_>) -> Option<DisruptionAction> {
    let mut chosen = Vec::new();
    for candidate in candidates {
        if ctx.budgets.remaining(&candidate.pool_name, DisruptionReason::Empty) == 0 {
            debug!(node = %candidate.node.name, pool = %candidate.pool_name,
                "empty candidate deferred by budget");
            continue;
        }
        ctx.budgets
            .consume(&candidate.pool_name, DisruptionReason::Empty, 1);
        chosen.push(candidate.clone());
    }
    if chosen.is_empty() {
        return None;
    }
    info!(count = chosen.len(), "empty-node consolidation planned");
    Some(DisruptionAction::DeleteEmpty { nodes: chosen })
}

// Take the cheapest candidates whose pools still have headroom, up to `n`.
// Budgets are only consumed once a group is actually chosen.
fn budgeted_group<'a>(
    candidates: &'a [Candidate],
    reason: DisruptionReason,
    budgets: &BudgetSnapshot,
    n: usize,
) -> Vec<&'a Candidate> {
    let mut taken_per_pool: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    let mut group = Vec::new();
    for candidate in candidates {
        if group.len() == n {
            break;
        }
        let taken = taken_per_pool.entry(candidate.pool_name.as_str()).or_insert(0);
        if *taken >= budgets.remaining(&candidate.pool_name, reason) {
            continue;
        }
        *taken += 1;
        group.push(candidate);
    }
    group
}

/// Phase 2: fold up to [`MAX_GROUP_SIZE`] candidates into one replacement
///
/// A group is acceptable iff the summed removed prices strictly exceed the
/// replacement price; among acceptable groups the largest savings wins.
fn plan_multi_node(
    candidates: &[Candidate],
    ctx: &mut PlanContext<'_>,
) -> Option<DisruptionAction> {
    // nodes without a priced offering cannot be judged on savings
    let priced: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.price.is_some())
        .cloned()
        .collect();
    if priced.len() < 2 {
        return None;
    }

    let mut best: Option<(f64, Vec<Candidate>, crate::scheduling::ReplacementPlan)> = None;
    let max_n = priced.len().min(MAX_GROUP_SIZE);

    for n in 2..=max_n {
        let group = budgeted_group(&priced, DisruptionReason::Underutilized, ctx.budgets, n);
        if group.len() < n {
            break;
        }
        let removed_price: f64 = group.iter().filter_map(|c| c.price).sum();

        let SimulationOutcome::FitsWithReplacement(mut plan) =
            ctx.simulate_group(&group, true)
        else {
            continue;
        };
        plan.filter_by_price(removed_price);
        let Some(cheapest_price) = plan.cheapest().map(|o| o.price) else {
            continue;
        };

        let savings = removed_price - cheapest_price;
        if best.as_ref().map_or(true, |(s, _, _)| savings > *s) {
            best = Some((savings, group.into_iter().cloned().collect(), plan));
        }
    }

    let (savings, nodes, replacement) = best?;
    for candidate in &nodes {
        ctx.budgets
            .consume(&candidate.pool_name, DisruptionReason::Underutilized, 1);
    }
    info!(
        nodes = nodes.len(),
        savings = format!("{savings:.4}"),
        "multi-node consolidation planned"
    );
    Some(DisruptionAction::Replace { nodes, replacement })
}

// Apply capacity-type rules to a single-node replacement. Returns false when
// the replacement must not proceed.
fn apply_spot_rules(
    candidate: &Candidate,
    plan: &mut crate::scheduling::ReplacementPlan,
    ctx: &PlanContext<'_>,
) -> bool {
    if candidate.capacity_type != CapacityType::Spot {
        return !plan.options.is_empty();
    }

    let spot_types = plan
        .options
        .iter()
        .filter(|o| o.capacity_type == CapacityType::Spot)
        .map(|o| o.instance_type.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len();

    let spot_allowed = ctx.spot_to_spot_enabled && spot_types >= ctx.spot_flex_min;
    if !spot_allowed {
        plan.options
            .retain(|o| o.capacity_type != CapacityType::Spot);
    }
    !plan.options.is_empty()
}

/// Phase 3: cheapest candidate first, delete if possible, else replace
fn plan_single_node(
    candidates: &[Candidate],
    ctx: &mut PlanContext<'_>,
) -> Option<DisruptionAction> {
    for candidate in candidates {
        if ctx
            .budgets
            .remaining(&candidate.pool_name, candidate.reason)
            == 0
        {
            continue;
        }
        let group = [candidate];

        // delete against existing capacity only
        if matches!(
            ctx.simulate_group(&group, false),
            SimulationOutcome::FitsExisting
        ) {
            ctx.budgets
                .consume(&candidate.pool_name, candidate.reason, 1);
            info!(node = %candidate.node.name, "single-node delete planned");
            return Some(DisruptionAction::Delete {
                node: candidate.clone(),
            });
        }

        // replacement restricted to strictly cheaper instance types
        let SimulationOutcome::FitsWithReplacement(mut plan) =
            ctx.simulate_group(&group, true)
        else {
            continue;
        };
        let Some(price) = candidate.price else { continue };
        plan.filter_by_price(price);
        if !apply_spot_rules(candidate, &mut plan, ctx) {
            debug!(node = %candidate.node.name, "replacement rejected by price/spot rules");
            continue;
        }

        ctx.budgets
            .consume(&candidate.pool_name, candidate.reason, 1);
        info!(node = %candidate.node.name, "single-node replace planned");
        return Some(DisruptionAction::Replace {
            nodes: vec![candidate.clone()],
            replacement: plan,
        });
    }
    None
}

/// Plan one consolidation action from the current candidates
///
/// `empty` and `underutilized` come pre-sorted from candidate selection.
/// Returns the first action found, phases in order, or `None` when the
/// cluster cannot be improved this tick.
pub fn plan_consolidation(
    empty: &[Candidate],
    underutilized: &[Candidate],
    ctx: &mut PlanContext<'_>,
) -> Option<DisruptionAction> {
    if let Some(action) = plan_empty(empty, ctx) {
        return Some(action);
    }
    if let Some(action) = plan_multi_node(underutilized, ctx) {
        return Some(action);
    }
    plan_single_node(underutilized, ctx)
}

/// Plan one drift action: delete when the pods re-fit, otherwise replace
///
/// No price filter applies; a drifted node is moved because its spec is
/// wrong. Budgets still gate how many drifted nodes go at once.
pub fn plan_drift(
    drifted: &[Candidate],
    ctx: &mut PlanContext<'_>,
) -> Option<DisruptionAction> {
    for candidate in drifted {
        if ctx
            .budgets
            .remaining(&candidate.pool_name, DisruptionReason::Drifted)
            == 0
        {
            continue;
        }
        let group = [candidate];

        if matches!(
            ctx.simulate_group(&group, false),
            SimulationOutcome::FitsExisting
        ) {
            ctx.budgets
                .consume(&candidate.pool_name, DisruptionReason::Drifted, 1);
            return Some(DisruptionAction::Delete {
                node: candidate.clone(),
            });
        }

        if let SimulationOutcome::FitsWithReplacement(plan) = ctx.simulate_group(&group, true) {
            ctx.budgets
                .consume(&candidate.pool_name, DisruptionReason::Drifted, 1);
            return Some(DisruptionAction::Replace {
                nodes: vec![candidate.clone()],
                replacement: plan,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Budget, DisruptionSpec, NodePool, NodePoolSpec, NodeTemplate};
    use crate::provider::{InstanceType, Offering};
    use crate::state::node::fixtures::{node, pod};
    use crate::state::PoolCounts;
    use chrono::Utc;

    fn pool_named(name: &str, budgets: Vec<Budget>) -> NodePool {
        let mut p = NodePool::new(
            name,
            NodePoolSpec {
                template: NodeTemplate::default(),
                disruption: DisruptionSpec {
                    budgets,
                    ..Default::default()
                },
                weight: None,
                limits: None,
            },
        );
        p.metadata.name = Some(name.into());
        p
    }

    fn snapshot_budgets(pools: &[NodePool], total: u32) -> BudgetSnapshot {
        let counts = std::collections::BTreeMap::from([(
            pools[0].metadata.name.clone().unwrap(),
            PoolCounts {
                total,
                deleting: 0,
                not_ready: 0,
            },
        )]);
        BudgetSnapshot::compute(pools, &counts, Utc::now()).unwrap()
    }

    fn candidate(
        name: &str,
        reason: DisruptionReason,
        price: f64,
        capacity_type: CapacityType,
        pods: Vec<crate::state::PodRecord>,
    ) -> Candidate {
        let mut n = node(name, "default", "4", "8Gi");
        n.capacity_type = capacity_type;
        n.pods = pods;
        Candidate {
            pool_name: "default".into(),
            reason,
            disruption_cost: n.pods.len() as f64,
            price: Some(price),
            capacity_type,
            node: n,
        }
    }

    fn instance_type(name: &str, price: f64, capacity_type: CapacityType) -> InstanceType {
        InstanceType {
            name: name.into(),
            requirements: vec![],
            offerings: vec![Offering {
                zone: "us-east-1a".into(),
                capacity_type,
                price,
                available: true,
            }],
            capacity: Resources::from_pairs([("cpu", "4"), ("memory", "8Gi"), ("pods", "50")])
                .unwrap(),
        }
    }

    fn template(types: Vec<InstanceType>) -> PoolTemplate {
        PoolTemplate {
            pool_name: "default".into(),
            pool_hash: "hash-v1".into(),
            requirements: vec![],
            instance_types: types,
        }
    }

    struct Fixture {
        snapshot: Vec<StateNode>,
        templates: Vec<PoolTemplate>,
        unavailable: UnavailableOfferings,
        budgets: BudgetSnapshot,
    }

    impl Fixture {
        fn new(snapshot: Vec<StateNode>, templates: Vec<PoolTemplate>) -> Self {
            // a roomy budget so tests exercise the planner, not the limiter
            let pools = vec![pool_named(
                "default",
                vec![Budget {
                    nodes: "100".into(),
                    reasons: vec![],
                    schedule: None,
                    duration: None,
                }],
            )];
            Self {
                snapshot,
                templates,
                unavailable: UnavailableOfferings::default(),
                budgets: snapshot_budgets(&pools, 10),
            }
        }

        fn ctx(&mut self) -> PlanContext<'_> {
            PlanContext {
                snapshot: &self.snapshot,
                templates: &self.templates,
                unavailable: &self.unavailable,
                budgets: &mut self.budgets,
                spot_to_spot_enabled: false,
                spot_flex_min: crate::DEFAULT_SPOT_FLEX_MIN,
                max_instance_types: crate::DEFAULT_MAX_INSTANCE_TYPES,
            }
        }
    }

    #[test]
    fn test_empty_phase_takes_all_within_budget() {
        let empty: Vec<Candidate> = (0..3)
            .map(|i| {
                candidate(
                    &format!("e{i}"),
                    DisruptionReason::Empty,
                    0.096,
                    CapacityType::OnDemand,
                    vec![],
                )
            })
            .collect();
        let mut fixture = Fixture::new(vec![], vec![]);

        let action = plan_consolidation(&empty, &[], &mut fixture.ctx()).unwrap();
        match action {
            DisruptionAction::DeleteEmpty { nodes } => assert_eq!(nodes.len(), 3),
            other => panic!("expected DeleteEmpty, got {other}"),
        }
    }

    #[test]
    fn test_empty_phase_respects_budget_cap() {
        let empty: Vec<Candidate> = (0..5)
            .map(|i| {
                candidate(
                    &format!("e{i}"),
                    DisruptionReason::Empty,
                    0.096,
                    CapacityType::OnDemand,
                    vec![],
                )
            })
            .collect();

        let pools = vec![pool_named(
            "default",
            vec![Budget {
                nodes: "2".into(),
                reasons: vec![],
                schedule: None,
                duration: None,
            }],
        )];
        let mut fixture = Fixture::new(vec![], vec![]);
        fixture.budgets = snapshot_budgets(&pools, 10);

        let action = plan_consolidation(&empty, &[], &mut fixture.ctx()).unwrap();
        match action {
            DisruptionAction::DeleteEmpty { nodes } => assert_eq!(nodes.len(), 2),
            other => panic!("expected DeleteEmpty, got {other}"),
        }
    }

    #[test]
    fn test_single_node_delete_when_pods_refit() {
        // a roomy survivor absorbs the candidate's pod
        let survivor = node("s1", "default", "4", "8Gi");
        let candidate = candidate(
            "c1",
            DisruptionReason::Underutilized,
            0.096,
            CapacityType::OnDemand,
            vec![pod("default", "web-1", "500m", "1Gi")],
        );
        let mut fixture = Fixture::new(vec![survivor, candidate.node.clone()], vec![]);

        let action = plan_consolidation(&[], &[candidate], &mut fixture.ctx()).unwrap();
        assert!(matches!(action, DisruptionAction::Delete { .. }));
    }

    #[test]
    fn test_single_node_replace_needs_cheaper_type() {
        // nowhere to re-fit: the only survivor is full
        let mut full = node("s1", "default", "2", "4Gi");
        full.pods.push(pod("default", "filler", "1800m", "3Gi"));
        let cand = candidate(
            "c1",
            DisruptionReason::Underutilized,
            0.096,
            CapacityType::OnDemand,
            vec![pod("default", "web-1", "1", "1Gi")],
        );

        // cheaper replacement exists
        let mut fixture = Fixture::new(
            vec![full.clone(), cand.node.clone()],
            vec![template(vec![instance_type(
                "m5a.large",
                0.086,
                CapacityType::OnDemand,
            )])],
        );
        let action = plan_consolidation(&[], &[cand.clone()], &mut fixture.ctx()).unwrap();
        match &action {
            DisruptionAction::Replace { nodes, replacement } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(replacement.cheapest().unwrap().price, 0.086);
            }
            other => panic!("expected Replace, got {other}"),
        }

        // only pricier types: nothing to do
        let mut fixture = Fixture::new(
            vec![full, cand.node.clone()],
            vec![template(vec![instance_type(
                "m5.xlarge",
                0.192,
                CapacityType::OnDemand,
            )])],
        );
        assert!(plan_consolidation(&[], &[cand], &mut fixture.ctx()).is_none());
    }

    /// Spot-to-spot replacement needs the flexibility floor: fourteen cheaper
    /// spot types is one short, so Replace is not chosen.
    #[test]
    fn test_spot_flexibility_floor() {
        let mut full = node("s1", "default", "2", "4Gi");
        full.pods.push(pod("default", "filler", "1800m", "3Gi"));
        let cand = candidate(
            "c1",
            DisruptionReason::Underutilized,
            0.040,
            CapacityType::Spot,
            vec![pod("default", "web-1", "1", "1Gi")],
        );

        let fourteen: Vec<InstanceType> = (0..14)
            .map(|i| instance_type(&format!("spot-{i}"), 0.020 + i as f64 * 0.001, CapacityType::Spot))
            .collect();

        let mut fixture = Fixture::new(
            vec![full.clone(), cand.node.clone()],
            vec![template(fourteen.clone())],
        );
        let mut ctx = fixture.ctx();
        ctx.spot_to_spot_enabled = true;
        assert!(plan_consolidation(&[], &[cand.clone()], &mut ctx).is_none());

        // a fifteenth cheaper spot type unlocks the replacement
        let mut fifteen = fourteen;
        fifteen.push(instance_type("spot-14", 0.034, CapacityType::Spot));
        let mut fixture = Fixture::new(
            vec![full.clone(), cand.node.clone()],
            vec![template(fifteen.clone())],
        );
        let mut ctx = fixture.ctx();
        ctx.spot_to_spot_enabled = true;
        let action = plan_consolidation(&[], &[cand.clone()], &mut ctx).unwrap();
        assert!(matches!(action, DisruptionAction::Replace { .. }));

        // with the feature gate off, spot-to-spot never happens
        let mut fixture = Fixture::new(vec![full, cand.node.clone()], vec![template(fifteen)]);
        let mut ctx = fixture.ctx();
        ctx.spot_to_spot_enabled = false;
        assert!(plan_consolidation(&[], &[cand], &mut ctx).is_none());
    }

    #[test]
    fn test_multi_node_requires_price_improvement() {
        // two half-empty nodes fold into one cheaper node
        let c1 = candidate(
            "c1",
            DisruptionReason::Underutilized,
            0.096,
            CapacityType::OnDemand,
            vec![pod("default", "web-1", "500m", "1Gi")],
        );
        let c2 = candidate(
            "c2",
            DisruptionReason::Underutilized,
            0.096,
            CapacityType::OnDemand,
            vec![pod("default", "web-2", "500m", "1Gi")],
        );

        let mut fixture = Fixture::new(
            vec![c1.node.clone(), c2.node.clone()],
            vec![template(vec![instance_type(
                "m5.large",
                0.096,
                CapacityType::OnDemand,
            )])],
        );
        let action = plan_consolidation(&[], &[c1.clone(), c2.clone()], &mut fixture.ctx());
        // one m5.large (0.096) replacing two (0.192) strictly improves price
        match action {
            Some(DisruptionAction::Replace { nodes, .. }) => assert_eq!(nodes.len(), 2),
            other => panic!("expected multi-node Replace, got {other:?}"),
        }
    }

    #[test]
    fn test_drift_replace_ignores_price() {
        let mut full = node("s1", "default", "2", "4Gi");
        full.pods.push(pod("default", "filler", "1800m", "3Gi"));
        let cand = candidate(
            "c1",
            DisruptionReason::Drifted,
            0.096,
            CapacityType::OnDemand,
            vec![pod("default", "web-1", "1", "1Gi")],
        );

        // the only replacement costs more; drift still proceeds
        let mut fixture = Fixture::new(
            vec![full, cand.node.clone()],
            vec![template(vec![instance_type(
                "m5.xlarge",
                0.192,
                CapacityType::OnDemand,
            )])],
        );
        let action = plan_drift(&[cand], &mut fixture.ctx()).unwrap();
        assert!(matches!(action, DisruptionAction::Replace { .. }));
    }

    #[test]
    fn test_drift_deferred_by_exhausted_budget() {
        let cand = candidate(
            "c1",
            DisruptionReason::Drifted,
            0.096,
            CapacityType::OnDemand,
            vec![],
        );
        let pools = vec![pool_named(
            "default",
            vec![Budget {
                nodes: "0".into(),
                reasons: vec![DisruptionReason::Drifted],
                schedule: None,
                duration: None,
            }],
        )];
        let mut fixture = Fixture::new(vec![cand.node.clone()], vec![]);
        fixture.budgets = snapshot_budgets(&pools, 10);

        assert!(plan_drift(&[cand], &mut fixture.ctx()).is_none());
    }
}
