//! Interruption ingestion: the forceful termination path
//!
//! Consumes an external event queue (spot warnings, scheduled hardware
//! events, instance state changes) and feeds affected nodes straight to the
//! termination machine. No budgets are consulted and no replacement is
//! pre-spun; once the drained pods go pending, normal provisioning backfills
//! capacity.
//!
//! Processing is idempotent: deliveries are acknowledged only after
//! handling, and replaying an event against an already-terminating node is
//! a no-op.

pub mod queue;

pub use queue::{InMemoryQueue, MessageQueue, QueuedMessage};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::disruption::NodeOps;
use crate::events::{DisruptionEvent, SharedRecorder};
use crate::state::Cluster;
use crate::{Result, REPAIR_UNHEALTHY_CAP};

/// Kinds of interruption events the queue delivers
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InterruptionKind {
    /// The cloud will reclaim a spot instance shortly
    SpotWarning,
    /// Scheduled maintenance or a failing health check
    ScheduledHealth,
    /// The instance is shutting down
    Terminating,
    /// The instance is stopping
    Stopping,
    /// Advisory only; never acted on
    RebalanceRecommendation,
}

impl std::fmt::Display for InterruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpotWarning => write!(f, "spotWarning"),
            Self::ScheduledHealth => write!(f, "scheduledHealth"),
            Self::Terminating => write!(f, "terminating"),
            Self::Stopping => write!(f, "stopping"),
            Self::RebalanceRecommendation => write!(f, "rebalanceRecommendation"),
        }
    }
}

/// A decoded interruption event
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionMessage {
    /// What happened
    pub kind: InterruptionKind,
    /// Instances affected
    pub instance_ids: Vec<String>,
}

/// The interruption ingestor worker
pub struct Ingestor {
    cluster: Arc<Cluster>,
    queue: Arc<dyn MessageQueue>,
    node_ops: Arc<dyn NodeOps>,
    recorder: SharedRecorder,
    cancel: CancellationToken,
}

impl Ingestor {
    /// Wire up an ingestor over the given queue
    pub fn new(
        cluster: Arc<Cluster>,
        queue: Arc<dyn MessageQueue>,
        node_ops: Arc<dyn NodeOps>,
        recorder: SharedRecorder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            queue,
            node_ops,
            recorder,
            cancel,
        }
    }

    /// Consume the queue until cancelled
    pub async fn run(self) {
        info!("interruption ingestor started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.poll_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "interruption poll failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        info!("interruption ingestor stopped");
    }

    /// Receive one batch; returns how many messages were handled
    ///
    /// Messages are acknowledged only after successful handling, so a crash
    /// mid-batch redelivers the remainder.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.queue.receive().await?;
        let mut handled = 0;
        for message in &batch {
            match self.handle(&message.body).await {
                Ok(()) => {
                    self.queue.acknowledge(&message.receipt).await?;
                    handled += 1;
                }
                Err(e) => {
                    // unacked: the queue redelivers and we try again
                    warn!(error = %e, "failed to handle interruption message");
                }
            }
        }
        Ok(handled)
    }

    async fn handle(&self, body: &str) -> Result<()> {
        let message: InterruptionMessage = serde_json::from_str(body)
            .map_err(|e| crate::Error::serialization(format!("undecodable message: {e}")))?;

        if message.kind == InterruptionKind::RebalanceRecommendation {
            debug!(instances = ?message.instance_ids, "rebalance recommendation ignored");
            return Ok(());
        }

        for instance_id in &message.instance_ids {
            let Some(node) = self.cluster.find_by_instance(instance_id) else {
                debug!(instance = %instance_id, "interruption for an unowned instance");
                continue;
            };

            if message.kind == InterruptionKind::ScheduledHealth
                && !self.repair_allowed(&node.name, node.pool_name.as_deref())
            {
                warn!(
                    node = %node.name,
                    "refusing repair: too much of the pool is already unhealthy"
                );
                continue;
            }

            info!(node = %node.name, kind = %message.kind, "forceful termination from interruption");
            self.recorder.record(
                &node.name,
                DisruptionEvent::Interrupted {
                    kind: message.kind.to_string(),
                },
            );

            // straight to the termination machine: no budget, no pre-spin
            self.cluster.mark_for_deletion(&node.name);
            match self.node_ops.delete_node(&node.name).await {
                Ok(()) => self.cluster.record_delete_issued(&node.name),
                Err(e) if e.is_not_found() => self.cluster.record_delete_issued(&node.name),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // Marks the node unhealthy and checks the repair safety cap: act only
    // while at most 20% of the pool (or of the whole fleet, for standalone
    // nodes) is unhealthy.
    fn repair_allowed(&self, node_name: &str, pool: Option<&str>) -> bool {
        self.cluster.set_unhealthy(node_name, true);

        let mut total = 0u32;
        let mut unhealthy = 0u32;
        self.cluster.for_each_node(|node| {
            let in_scope = match pool {
                Some(pool) => node.pool_name.as_deref() == Some(pool),
                None => true,
            };
            if in_scope {
                total += 1;
                if node.unhealthy {
                    unhealthy += 1;
                }
            }
        });
        total == 0 || f64::from(unhealthy) / f64::from(total) <= REPAIR_UNHEALTHY_CAP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruption::orchestrator::MockNodeOps;
    use crate::events::MemoryEventRecorder;
    use k8s_openapi::api::core::v1::Node;
    use std::collections::BTreeMap;

    fn api_node(name: &str, pool: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.into());
        node.metadata.labels = Some(BTreeMap::from([(
            crate::NODEPOOL_LABEL.to_string(),
            pool.to_string(),
        )]));
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            provider_id: Some(format!("aws:///i-{name}")),
            ..Default::default()
        });
        node
    }

    struct Rig {
        ingestor: Ingestor,
        cluster: Arc<Cluster>,
        queue: Arc<InMemoryQueue>,
        recorder: Arc<MemoryEventRecorder>,
    }

    fn rig(node_ops: MockNodeOps, nodes: Vec<Node>) -> Rig {
        let cluster = Arc::new(Cluster::new());
        for node in &nodes {
            cluster.apply_node(node);
        }
        let queue = Arc::new(InMemoryQueue::new());
        let recorder = Arc::new(MemoryEventRecorder::new());
        Rig {
            ingestor: Ingestor::new(
                cluster.clone(),
                queue.clone(),
                Arc::new(node_ops),
                recorder.clone(),
                CancellationToken::new(),
            ),
            cluster,
            queue,
            recorder,
        }
    }

    /// A spot warning terminates the owned node immediately: no budget is
    /// consulted, no replacement is pre-spun, the event is recorded.
    #[tokio::test]
    async fn test_spot_warning_feeds_termination_directly() {
        let mut node_ops = MockNodeOps::new();
        node_ops
            .expect_delete_node()
            .withf(|n| n == "n1")
            .times(1)
            .returning(|_| Ok(()));

        let rig = rig(node_ops, vec![api_node("n1", "default")]);
        rig.queue
            .push(r#"{"kind":"spotWarning","instanceIds":["i-n1"]}"#);

        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);
        assert!(rig.cluster.node("n1").unwrap().marked_for_deletion);
        assert_eq!(
            rig.recorder.for_node("n1"),
            vec![DisruptionEvent::Interrupted {
                kind: "spotWarning".into()
            }]
        );
        // acknowledged: nothing comes back on redelivery
        rig.queue.redeliver_unacked();
        assert_eq!(rig.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_unowned_instance_is_acked_and_ignored() {
        let node_ops = MockNodeOps::new();
        let rig = rig(node_ops, vec![api_node("n1", "default")]);
        rig.queue
            .push(r#"{"kind":"terminating","instanceIds":["i-unknown"]}"#);

        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);
        rig.queue.redeliver_unacked();
        assert_eq!(rig.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_rebalance_recommendation_is_log_only() {
        let mut node_ops = MockNodeOps::new();
        node_ops.expect_delete_node().times(0);

        let rig = rig(node_ops, vec![api_node("n1", "default")]);
        rig.queue
            .push(r#"{"kind":"rebalanceRecommendation","instanceIds":["i-n1"]}"#);

        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);
        assert!(!rig.cluster.node("n1").unwrap().marked_for_deletion);
    }

    /// Replaying the same interruption is a no-op: the node is already
    /// marked and the delete is answered with NotFound.
    #[tokio::test]
    async fn test_replayed_event_is_idempotent() {
        let mut node_ops = MockNodeOps::new();
        let mut calls = 0;
        node_ops.expect_delete_node().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(crate::Error::not_found("node already deleting"))
            }
        });

        let rig = rig(node_ops, vec![api_node("n1", "default")]);
        let body = r#"{"kind":"stopping","instanceIds":["i-n1"]}"#;
        rig.queue.push(body);
        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);

        rig.queue.push(body);
        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);
        assert!(rig.cluster.node("n1").unwrap().marked_for_deletion);
    }

    /// Health-driven repair stops once more than 20% of the pool is
    /// unhealthy; the message is still acknowledged.
    #[tokio::test]
    async fn test_repair_cap_refuses_widespread_failure() {
        let mut node_ops = MockNodeOps::new();
        // n1 at 20% of five nodes is allowed; n2 pushes past the cap
        node_ops
            .expect_delete_node()
            .withf(|n| n == "n1")
            .times(1)
            .returning(|_| Ok(()));

        let nodes: Vec<Node> = (1..=5).map(|i| api_node(&format!("n{i}"), "default")).collect();
        let rig = rig(node_ops, nodes);

        rig.queue
            .push(r#"{"kind":"scheduledHealth","instanceIds":["i-n1"]}"#);
        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);

        rig.queue
            .push(r#"{"kind":"scheduledHealth","instanceIds":["i-n2"]}"#);
        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 1);
        assert!(!rig.cluster.node("n2").unwrap().marked_for_deletion);
    }

    #[tokio::test]
    async fn test_undecodable_message_stays_queued() {
        let node_ops = MockNodeOps::new();
        let rig = rig(node_ops, vec![]);
        rig.queue.push("not json");

        assert_eq!(rig.ingestor.poll_once().await.unwrap(), 0);
        rig.queue.redeliver_unacked();
        assert_eq!(rig.queue.depth(), 1);
    }
}
