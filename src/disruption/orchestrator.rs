//! The disruption orchestrator
//!
//! One logical loop drives all voluntary disruption. Per tick it short-
//! circuits when nothing decision-relevant changed, waits out a
//! stabilization window after scale events, then tries each method in order
//! (drift first, then consolidation) and executes at most one action:
//! taint, optionally launch-and-wait for a replacement, delete, wait for the
//! old nodes to disappear.
//!
//! The commit order is launch-then-delete, never the reverse: a failed
//! launch unwinds to the pre-tick state (untaint, unmark) and no workload
//! is left without capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::Settings;
use crate::crd::{DisruptionReason, NodePool};
use crate::disruption::budgets::BudgetSnapshot;
use crate::disruption::candidate::{select_candidates, PoolCatalogs};
use crate::disruption::consolidation::{plan_consolidation, plan_drift, PlanContext};
use crate::disruption::{DisruptionAction, DisruptionMethod, PoolSource};
use crate::events::{DisruptionEvent, SharedRecorder};
use crate::provider::{CloudProvider, InstanceRequest, UnavailableOfferings};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scheduling::{PoolTemplate, ReplacementPlan};
use crate::state::Cluster;
use crate::{Error, Result};

/// Node-level Kubernetes operations the orchestrator needs
///
/// A thin seam over the API server so tests can assert the exact sequence
/// of taints and deletes without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOps: Send + Sync {
    /// Add the disrupted NoSchedule taint
    async fn taint_disrupted(&self, node: &str) -> Result<()>;
    /// Remove the disrupted taint
    async fn untaint_disrupted(&self, node: &str) -> Result<()>;
    /// Delete the node object; NotFound is success
    async fn delete_node(&self, node: &str) -> Result<()>;
    /// Whether the node object still exists
    async fn node_exists(&self, node: &str) -> Result<bool>;
    /// Whether controller-managed workloads all report ready replicas
    async fn workloads_ready(&self) -> Result<bool>;
}

/// What a tick did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing changed since a do-nothing tick; skipped entirely
    Skipped,
    /// A recent scale event deferred consolidation
    Deferred,
    /// An action was executed
    Acted,
    /// Candidates were evaluated but no action was possible
    Nothing,
}

/// The single-flight disruption orchestrator
pub struct Orchestrator {
    cluster: Arc<Cluster>,
    node_ops: Arc<dyn NodeOps>,
    pool_source: Arc<dyn PoolSource>,
    provider: Arc<dyn CloudProvider>,
    recorder: SharedRecorder,
    unavailable: Arc<UnavailableOfferings>,
    settings: Settings,
    cancel: CancellationToken,
    // only one disruption decision may execute at a time
    in_flight: Mutex<()>,
    last_seen_version: u64,
    last_tick_acted: bool,
}

impl Orchestrator {
    /// Wire up an orchestrator; `run` starts the loop
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<Cluster>,
        node_ops: Arc<dyn NodeOps>,
        pool_source: Arc<dyn PoolSource>,
        provider: Arc<dyn CloudProvider>,
        recorder: SharedRecorder,
        unavailable: Arc<UnavailableOfferings>,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            node_ops,
            pool_source,
            provider,
            recorder,
            unavailable,
            settings,
            cancel,
            in_flight: Mutex::new(()),
            last_seen_version: u64::MAX,
            last_tick_acted: false,
        }
    }

    /// Run ticks until cancelled
    pub async fn run(mut self) {
        info!("disruption orchestrator started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.polling_period) => {}
            }
            match self.tick().await {
                Ok(outcome) => debug!(?outcome, "tick finished"),
                Err(e) => warn!(error = %e, "tick failed"),
            }
        }
        info!("disruption orchestrator stopped");
    }

    /// Evaluate the cluster once and execute at most one action
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let _slot = self.in_flight.lock().await;

        // nothing relevant changed and the last evaluation found nothing
        let version = self.cluster.state_version();
        if version == self.last_seen_version && !self.last_tick_acted {
            return Ok(TickOutcome::Skipped);
        }
        self.last_seen_version = version;
        self.last_tick_acted = false;

        if !self.stabilized().await? {
            debug!("deferring consolidation inside stabilization window");
            return Ok(TickOutcome::Deferred);
        }

        let pools = self.pool_source.pools().await?;
        let (pool_map, catalogs, templates) = self.build_catalogs(&pools).await?;

        let counts = self.cluster.pool_counts();
        let mut budgets = BudgetSnapshot::compute(&pools, &counts, Utc::now())?;
        let snapshot = self.cluster.snapshot();
        let now = Utc::now();

        for method in [DisruptionMethod::Drift, DisruptionMethod::Consolidation] {
            let mut ctx = PlanContext {
                snapshot: &snapshot,
                templates: &templates,
                unavailable: &self.unavailable,
                budgets: &mut budgets,
                spot_to_spot_enabled: self.settings.feature_gates.spot_to_spot_consolidation,
                spot_flex_min: self.settings.spot_flex_min,
                max_instance_types: self.settings.max_instance_types,
            };
            let nominated = |name: &str| self.cluster.is_nominated(name);

            let action = match method {
                DisruptionMethod::Drift => {
                    let drifted = select_candidates(
                        DisruptionReason::Drifted,
                        &snapshot,
                        &pool_map,
                        &catalogs,
                        nominated,
                        now,
                    );
                    plan_drift(&drifted, &mut ctx)
                }
                DisruptionMethod::Consolidation => {
                    let empty = select_candidates(
                        DisruptionReason::Empty,
                        &snapshot,
                        &pool_map,
                        &catalogs,
                        nominated,
                        now,
                    );
                    let underutilized = select_candidates(
                        DisruptionReason::Underutilized,
                        &snapshot,
                        &pool_map,
                        &catalogs,
                        nominated,
                        now,
                    );
                    plan_consolidation(&empty, &underutilized, &mut ctx)
                }
            };

            let Some(action) = action else { continue };
            info!(%action, ?method, "executing disruption action");
            self.execute(&action).await?;
            self.last_tick_acted = true;
            return Ok(TickOutcome::Acted);
        }

        Ok(TickOutcome::Nothing)
    }

    // Pool lookup map, per-pool instance-type catalogs, and the templates
    // the simulator may draw replacements from.
    async fn build_catalogs(
        &self,
        pools: &[NodePool],
    ) -> Result<(HashMap<String, NodePool>, PoolCatalogs, Vec<PoolTemplate>)> {
        let mut pool_map = HashMap::new();
        let mut catalogs: PoolCatalogs = HashMap::new();
        let mut templates = Vec::new();
        for pool in pools {
            let Some(name) = pool.metadata.name.clone() else { continue };
            let types = self.provider.instance_types(pool).await?;
            templates.push(PoolTemplate {
                pool_name: name.clone(),
                pool_hash: pool.spec.template_hash()?,
                requirements: pool.spec.template.requirements.clone(),
                instance_types: types.clone(),
            });
            catalogs.insert(
                name.clone(),
                types.into_iter().map(|t| (t.name.clone(), t)).collect(),
            );
            pool_map.insert(name, pool.clone());
        }
        Ok((pool_map, catalogs, templates))
    }

    // A recent scale event, a pending pod, or a non-ready workload defers
    // consolidation by the stabilization window; a quiet cluster
    // consolidates immediately.
    async fn stabilized(&self) -> Result<bool> {
        let busy =
            self.cluster.has_pending_pods() || !self.node_ops.workloads_ready().await?;
        let window = if busy {
            chrono::Duration::from_std(self.settings.stabilization_window)
                .unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            chrono::Duration::zero()
        };
        let threshold = Utc::now() - window;
        let created_ok = self
            .cluster
            .last_creation_time()
            .map_or(true, |t| t < threshold);
        let deleted_ok = self
            .cluster
            .last_deletion_time()
            .map_or(true, |t| t < threshold);
        Ok(created_ok && deleted_ok)
    }

    async fn untaint_all(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.node_ops.untaint_disrupted(name).await {
                warn!(node = %name, error = %e, "failed to untaint node during revert");
            }
        }
    }

    /// Execute one action: taint, launch if replacing, delete, wait
    async fn execute(&self, action: &DisruptionAction) -> Result<()> {
        let names = action.node_names();

        // the mirror may have moved under the decision
        for name in &names {
            match self.cluster.node(name) {
                Some(node) if !node.deleting() => {}
                _ => {
                    return Err(Error::precondition(format!(
                        "node {name} changed while the decision was being made"
                    )))
                }
            }
        }

        let mut tainted: Vec<String> = Vec::new();
        for name in &names {
            match self.node_ops.taint_disrupted(name).await {
                Ok(()) => tainted.push(name.clone()),
                Err(e) => {
                    self.untaint_all(&tainted).await;
                    return Err(e);
                }
            }
        }

        for name in &names {
            self.cluster.mark_for_deletion(name);
        }

        if let DisruptionAction::Replace { replacement, .. } = action {
            if let Err(e) = self.launch_and_wait(&names, replacement, action).await {
                // revert: the originals keep running, the tick restarts later
                for name in &names {
                    if let Err(unmark_err) = self.cluster.unmark_for_deletion(name) {
                        warn!(node = %name, error = %unmark_err, "failed to unmark during revert");
                    }
                }
                self.untaint_all(&names).await;
                return Err(e);
            }
        }

        for name in &names {
            self.recorder.record(
                name,
                DisruptionEvent::TerminatingForConsolidation {
                    action: action.to_string(),
                },
            );
            match self.node_ops.delete_node(name).await {
                Ok(()) => self.cluster.record_delete_issued(name),
                Err(e) if e.is_not_found() => self.cluster.record_delete_issued(name),
                Err(e) => warn!(node = %name, error = %e, "failed to delete node"),
            }
        }

        // wait out the drains so the next tick starts from reality
        for name in &names {
            self.wait_for_disappearance(name).await;
        }
        Ok(())
    }

    // Launch exactly one replacement and block until it is initialized.
    // Failure leaves no orphan: the instance either initializes and the old
    // nodes are deleted, or the caller unwinds while the instance registers
    // and is collected as an orphan if it never does.
    async fn launch_and_wait(
        &self,
        old: &[String],
        replacement: &ReplacementPlan,
        action: &DisruptionAction,
    ) -> Result<()> {
        for name in old {
            self.recorder.record(
                name,
                DisruptionEvent::LaunchingForConsolidation {
                    action: action.to_string(),
                },
            );
        }

        // idempotent per decision: replaying after a crash returns the
        // original instance instead of launching a second one
        let request_key = format!("replace:{}", old.join("+"));
        let mut instance_types: Vec<String> = Vec::new();
        let mut capacity_types = Vec::new();
        for option in &replacement.options {
            if !instance_types.contains(&option.instance_type) {
                instance_types.push(option.instance_type.clone());
            }
            if !capacity_types.contains(&option.capacity_type) {
                capacity_types.push(option.capacity_type);
            }
        }
        let request = InstanceRequest {
            pool_name: replacement.pool_name.clone(),
            pool_hash: replacement.pool_hash.clone(),
            instance_types,
            capacity_types,
            requirements: replacement.requirements.clone(),
        };

        let mut attempt = 0u32;
        let instance = loop {
            attempt += 1;
            match self.provider.create_instance(&request_key, &request).await {
                Ok(instance) => break instance,
                Err(Error::Capacity { kind, message }) => {
                    // cache the failed offering; do not retry in-tick
                    if let Some(option) = replacement.cheapest() {
                        self.unavailable.mark(
                            &option.instance_type,
                            &option.zone,
                            option.capacity_type,
                            kind,
                        );
                    }
                    return Err(Error::Capacity { kind, message });
                }
                Err(e) if e.is_retryable() && attempt < 3 => {
                    warn!(attempt, error = %e, "replacement launch failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        };
        info!(instance = %instance.id, price = instance.price, "replacement launched");

        self.wait_replacement_ready(old, &instance.id).await
    }

    async fn wait_replacement_ready(&self, old: &[String], instance_id: &str) -> Result<()> {
        let config = RetryConfig::node_wait();
        let mut delay = config.initial_delay;
        let mut reported = false;

        for _ in 0..config.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(Error::precondition("shutdown during readiness wait"));
            }
            // a forceful path claiming one of the old nodes outranks us
            for name in old {
                let forced = match self.cluster.node(name) {
                    Some(node) => node.deletion_timestamp.is_some() || node.delete_issued,
                    None => true,
                };
                if forced {
                    return Err(Error::precondition(format!(
                        "node {name} was taken over by a forceful path"
                    )));
                }
            }
            if let Some(node) = self.cluster.node_by_instance(instance_id) {
                if node.initialized {
                    return Ok(());
                }
            }
            if !reported {
                for name in old {
                    self.recorder.record(name, DisruptionEvent::WaitingOnReadiness);
                }
                reported = true;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(config.max_delay);
        }
        Err(Error::transient(format!(
            "replacement {instance_id} never reported initialized"
        )))
    }

    // Deletion can take a while under restrictive PDBs; the wait keeps the
    // orchestrator from starting another round against a half-drained
    // cluster. Timing out here is logged, not fatal.
    async fn wait_for_disappearance(&self, name: &str) {
        let result = retry_with_backoff(
            &RetryConfig::node_wait(),
            "wait_node_deleted",
            || async {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                match self.node_ops.node_exists(name).await {
                    Ok(false) => Ok(()),
                    Ok(true) => {
                        self.recorder.record(name, DisruptionEvent::WaitingOnDeletion);
                        Err(Error::transient("node object still present"))
                    }
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await;
        if let Err(e) = result {
            warn!(node = %name, error = %e, "gave up waiting for node deletion");
        }
    }

}

/// Terminate instances that never registered a node object
///
/// Run periodically; instances younger than the registration grace are left
/// alone so freshly launched capacity is not collected mid-boot.
pub async fn collect_orphans(
    cluster: &Cluster,
    pool_source: &dyn PoolSource,
    provider: &dyn CloudProvider,
) -> Result<()> {
    let grace = chrono::Duration::minutes(10);
    let pools = pool_source.pools().await?;
    for pool in pools {
        let Some(name) = pool.metadata.name else { continue };
        for instance in provider.list_instances(&name).await? {
            if Utc::now() - instance.launch_time < grace {
                continue;
            }
            if cluster.has_instance(&instance.id) {
                continue;
            }
            info!(instance = %instance.id, pool = %name, "terminating orphaned instance");
            provider.terminate_instance(&instance.id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DisruptionSpec, NodePoolSpec, NodeTemplate};
    use crate::disruption::MockPoolSource;
    use crate::events::MemoryEventRecorder;
    use crate::provider::{FakeCloudProvider, InstanceType, LaunchFailure, Offering};
    use crate::state::Resources;
    use k8s_openapi::api::core::v1::Node;
    use std::collections::BTreeMap;

    fn pool() -> NodePool {
        let mut p = NodePool::new(
            "default",
            NodePoolSpec {
                template: NodeTemplate::default(),
                disruption: DisruptionSpec::default(),
                weight: None,
                limits: None,
            },
        );
        p.metadata.name = Some("default".into());
        p
    }

    fn catalog() -> Vec<InstanceType> {
        vec![InstanceType {
            name: "m5.large".into(),
            requirements: vec![],
            offerings: vec![Offering {
                zone: "us-east-1a".into(),
                capacity_type: crate::crd::CapacityType::OnDemand,
                price: 0.096,
                available: true,
            }],
            capacity: Resources::from_pairs([("cpu", "2"), ("memory", "8Gi"), ("pods", "29")])
                .unwrap(),
        }]
    }

    // An owned, initialized, ready node as the watch stream would deliver it
    fn api_node(name: &str, pool: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.into());
        node.metadata.labels = Some(BTreeMap::from([
            (crate::NODEPOOL_LABEL.to_string(), pool.to_string()),
            (crate::INITIALIZED_LABEL.to_string(), "true".to_string()),
            (crate::ZONE_LABEL.to_string(), "us-east-1a".to_string()),
            (crate::INSTANCE_TYPE_LABEL.to_string(), "m5.large".to_string()),
            (crate::CAPACITY_TYPE_LABEL.to_string(), "on-demand".to_string()),
        ]));
        node.metadata.annotations = Some(BTreeMap::from([(
            crate::NODEPOOL_HASH_ANNOTATION.to_string(),
            pool_hash(),
        )]));
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            provider_id: Some(format!("aws:///{name}")),
            ..Default::default()
        });
        node.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            allocatable: Some(BTreeMap::from([
                (
                    "cpu".to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity("2".into()),
                ),
                (
                    "memory".to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity("8Gi".into()),
                ),
                (
                    "pods".to_string(),
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity("29".into()),
                ),
            ])),
            conditions: Some(vec![k8s_openapi::api::core::v1::NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    fn pool_hash() -> String {
        pool().spec.template_hash().unwrap()
    }

    struct Harness {
        cluster: Arc<Cluster>,
        provider: Arc<FakeCloudProvider>,
        recorder: Arc<MemoryEventRecorder>,
        unavailable: Arc<UnavailableOfferings>,
    }

    fn orchestrator_with(node_ops: MockNodeOps, nodes: Vec<Node>) -> (Orchestrator, Harness) {
        let cluster = Arc::new(Cluster::new());
        for node in &nodes {
            cluster.apply_node(node);
        }
        let provider = Arc::new(FakeCloudProvider::new());
        provider.set_catalog(catalog());
        let recorder = Arc::new(MemoryEventRecorder::new());
        let unavailable = Arc::new(UnavailableOfferings::default());

        let mut pool_source = MockPoolSource::new();
        pool_source.expect_pools().returning(|| Ok(vec![pool()]));

        let settings = Settings {
            cluster_name: "test".into(),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            cluster.clone(),
            Arc::new(node_ops),
            Arc::new(pool_source),
            provider.clone(),
            recorder.clone(),
            unavailable.clone(),
            settings,
            CancellationToken::new(),
        );
        (
            orchestrator,
            Harness {
                cluster,
                provider,
                recorder,
                unavailable,
            },
        )
    }

    /// An idle empty node is tainted, deleted, and gone within one tick; the
    /// daemon-only neighbor is untouched.
    #[tokio::test]
    async fn test_empty_node_removed_in_one_tick() {
        let mut node_ops = MockNodeOps::new();
        node_ops.expect_workloads_ready().returning(|| Ok(true));
        node_ops
            .expect_taint_disrupted()
            .withf(|n| n == "n2")
            .times(1)
            .returning(|_| Ok(()));
        node_ops
            .expect_delete_node()
            .withf(|n| n == "n2")
            .times(1)
            .returning(|_| Ok(()));
        node_ops
            .expect_node_exists()
            .withf(|n| n == "n2")
            .returning(|_| Ok(false));

        let (mut orchestrator, harness) =
            orchestrator_with(node_ops, vec![api_node("n1", "default"), api_node("n2", "default")]);

        // n1 carries a daemon pod; n2 is bare
        let mut daemon = k8s_openapi::api::core::v1::Pod::default();
        daemon.metadata.name = Some("kube-proxy-abc".into());
        daemon.metadata.namespace = Some("kube-system".into());
        daemon.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "apps/v1".into(),
                kind: "DaemonSet".into(),
                name: "kube-proxy".into(),
                uid: "ds-1".into(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        daemon.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some("n1".into()),
            containers: vec![],
            ..Default::default()
        });
        harness.cluster.apply_pod(&daemon);

        let outcome = orchestrator.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Acted);
        assert!(harness.cluster.node("n2").unwrap().marked_for_deletion);
        assert!(!harness.cluster.node("n1").unwrap().marked_for_deletion);
        assert!(!harness
            .recorder
            .for_node("n2")
            .is_empty());
    }

    #[tokio::test]
    async fn test_quiet_cluster_skips_after_empty_tick() {
        let mut node_ops = MockNodeOps::new();
        node_ops.expect_workloads_ready().returning(|| Ok(true));

        let (mut orchestrator, harness) = orchestrator_with(node_ops, vec![]);

        // first tick evaluates and finds nothing
        assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Nothing);
        // second tick with an unchanged mirror is skipped outright
        assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Skipped);

        // any mirror change re-arms evaluation; the new node is not yet
        // initialized, so it is still not a candidate
        let mut n9 = api_node("n9", "default");
        n9.metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(crate::INITIALIZED_LABEL);
        harness.cluster.apply_node(&n9);
        assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Nothing);
    }

    #[tokio::test]
    async fn test_pending_pods_defer_consolidation() {
        let mut node_ops = MockNodeOps::new();
        node_ops.expect_workloads_ready().returning(|| Ok(true));

        let (mut orchestrator, harness) =
            orchestrator_with(node_ops, vec![api_node("n1", "default")]);

        // an unschedulable pod appears; the node just joined the mirror, so
        // the five-minute window holds
        let mut pending = k8s_openapi::api::core::v1::Pod::default();
        pending.metadata.name = Some("web-pending".into());
        pending.metadata.namespace = Some("default".into());
        pending.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: None,
            containers: vec![],
            ..Default::default()
        });
        harness.cluster.apply_pod(&pending);

        assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Deferred);
    }

    /// A capacity failure during the replacement launch unwinds the whole
    /// action: untaint, unmark, offering cached as unavailable.
    #[tokio::test]
    async fn test_failed_launch_reverts_the_action() {
        let mut node_ops = MockNodeOps::new();
        node_ops
            .expect_taint_disrupted()
            .times(1)
            .returning(|_| Ok(()));
        node_ops
            .expect_untaint_disrupted()
            .withf(|n| n == "n1")
            .times(1)
            .returning(|_| Ok(()));

        let (orchestrator, harness) =
            orchestrator_with(node_ops, vec![api_node("n1", "default")]);
        harness
            .provider
            .fail_next_launch(LaunchFailure::Capacity(
                crate::error::CapacityErrorKind::InsufficientCapacity,
            ));

        let candidate = crate::disruption::Candidate {
            node: harness.cluster.node("n1").unwrap(),
            pool_name: "default".into(),
            reason: DisruptionReason::Underutilized,
            disruption_cost: 1.0,
            price: Some(0.096),
            capacity_type: crate::crd::CapacityType::OnDemand,
        };
        let action = DisruptionAction::Replace {
            nodes: vec![candidate],
            replacement: ReplacementPlan {
                pool_name: "default".into(),
                pool_hash: pool_hash(),
                requirements: vec![],
                options: vec![crate::scheduling::ReplacementOption {
                    instance_type: "m5.large".into(),
                    zone: "us-east-1a".into(),
                    capacity_type: crate::crd::CapacityType::OnDemand,
                    price: 0.096,
                }],
            },
        };

        let err = orchestrator.execute(&action).await.unwrap_err();
        assert!(matches!(err, Error::Capacity { .. }));
        // the node is available again
        assert!(!harness.cluster.node("n1").unwrap().marked_for_deletion);
        // and the offering is blocked for the TTL
        assert!(harness.unavailable.is_unavailable(
            "m5.large",
            "us-east-1a",
            crate::crd::CapacityType::OnDemand
        ));
    }

    #[tokio::test]
    async fn test_orphan_collection_spares_registered_and_young() {
        let node_ops = MockNodeOps::new();
        let (_orchestrator, harness) =
            orchestrator_with(node_ops, vec![api_node("n1", "default")]);

        // a freshly launched orphan and a registered instance; both are
        // inside the registration grace, so neither is collected
        harness.provider.add_live_instance("i-orphan", "default");
        harness.provider.add_live_instance("aws:///n1", "default");

        let mut pool_source = MockPoolSource::new();
        pool_source.expect_pools().returning(|| Ok(vec![pool()]));
        collect_orphans(&harness.cluster, &pool_source, harness.provider.as_ref())
            .await
            .unwrap();
        assert!(harness.provider.terminated().is_empty());
    }
}
