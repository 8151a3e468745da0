//! Termination state machine
//!
//! One instance runs per node being terminated: taint, drain with the pod
//! policy from [`super::drain`], terminate the cloud instance, remove the
//! finalizer. A per-node lock makes two concurrent terminations of the same
//! node impossible; the machine is re-entrant across reconciles because
//! every step is idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::disruption::PoolSource;
use crate::provider::CloudProvider;
use crate::state::{Cluster, StateNode};
use crate::termination::drain::{
    drain_complete, force_delete_time, graceful_evictees, is_evictable, truncated_grace,
};
use crate::{Error, Result};

/// Node- and pod-level operations the termination machine performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TerminationOps: Send + Sync {
    /// Add the disrupted NoSchedule taint to the node
    async fn taint_disrupted(&self, node: &str) -> Result<()>;
    /// Evict a pod through the eviction API; PDB refusal is WorkloadBlocked
    async fn evict_pod(&self, namespace: &str, name: &str, grace_seconds: i64) -> Result<()>;
    /// Delete a pod directly with the given grace, bypassing PDBs
    async fn force_delete_pod(&self, namespace: &str, name: &str, grace_seconds: i64)
        -> Result<()>;
    /// Remove the termination finalizer so the node object can go away
    async fn remove_finalizer(&self, node: &str) -> Result<()>;
}

/// Where a node is in its termination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationStage {
    /// Taint applied, drain about to begin
    Tainted,
    /// Evictions in flight
    Draining,
    /// Instance termination requested from the cloud
    CloudTerminating,
    /// Finalizer removed; the node object is free to disappear
    Finalized,
}

/// The per-node termination driver
pub struct Terminator {
    cluster: Arc<Cluster>,
    ops: Arc<dyn TerminationOps>,
    provider: Arc<dyn CloudProvider>,
    pool_source: Arc<dyn PoolSource>,
    drain_starts: DashMap<String, DateTime<Utc>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Terminator {
    /// Wire up a terminator over the given seams
    pub fn new(
        cluster: Arc<Cluster>,
        ops: Arc<dyn TerminationOps>,
        provider: Arc<dyn CloudProvider>,
        pool_source: Arc<dyn PoolSource>,
    ) -> Self {
        Self {
            cluster,
            ops,
            provider,
            pool_source,
            drain_starts: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Advance the termination of one node by one step
    pub async fn reconcile(&self, node_name: &str) -> Result<TerminationStage> {
        self.reconcile_at(node_name, Utc::now()).await
    }

    /// Advance the machine against an explicit clock
    pub async fn reconcile_at(
        &self,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<TerminationStage> {
        let lock = self
            .locks
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Some(node) = self.cluster.node(node_name) else {
            // the object is gone; nothing left to do
            self.forget(node_name);
            return Ok(TerminationStage::Finalized);
        };

        if !node.tainted_disrupted {
            self.ops.taint_disrupted(node_name).await?;
            self.drain_starts.entry(node_name.to_string()).or_insert(now);
            debug!(node = %node_name, "node tainted, drain starting");
            return Ok(TerminationStage::Tainted);
        }
        let drain_start = *self
            .drain_starts
            .entry(node_name.to_string())
            .or_insert(now);

        // fast path: the instance already vanished cloud-side
        if !node.provider_id.is_empty() && self.instance_gone(&node).await? {
            info!(node = %node_name, "instance already gone, finalizing");
            return self.finalize(node_name).await;
        }

        let node_grace = self.node_grace(&node).await?;
        let deadline = node_grace.map(|g| drain_start + g);

        if drain_complete(&node.pods) || deadline.is_some_and(|d| now >= d) {
            return self.cloud_terminate(&node, node_name).await;
        }

        self.drain(&node, drain_start, node_grace, now).await?;
        Ok(TerminationStage::Draining)
    }

    // The owning pool's terminationGracePeriod, if configured
    async fn node_grace(&self, node: &StateNode) -> Result<Option<Duration>> {
        let Some(pool_name) = &node.pool_name else {
            return Ok(None);
        };
        let pools = self.pool_source.pools().await?;
        for pool in pools {
            if pool.metadata.name.as_deref() == Some(pool_name.as_str()) {
                let grace = pool.spec.termination_grace_period()?;
                return Ok(grace.and_then(|g| Duration::from_std(g).ok()));
            }
        }
        Ok(None)
    }

    async fn instance_gone(&self, node: &StateNode) -> Result<bool> {
        let Some(pool) = &node.pool_name else {
            return Ok(false);
        };
        let instances = self.provider.list_instances(pool).await?;
        Ok(!instances
            .iter()
            .any(|i| node.provider_id.ends_with(&i.id) || i.id == node.provider_id))
    }

    // One drain round: force-delete pods past their deadline, gracefully
    // evict the rest. PDB refusals leave the pod in place; it is retried
    // next round and force-deleted once the node deadline demands it.
    async fn drain(
        &self,
        node: &StateNode,
        drain_start: DateTime<Utc>,
        node_grace: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut forced: HashMap<String, ()> = HashMap::new();

        if let Some(grace) = node_grace {
            let deadline = drain_start + grace;
            for pod in node.pods.iter().filter(|p| is_evictable(p)) {
                if now >= force_delete_time(drain_start, grace, pod) {
                    let seconds = truncated_grace(now, deadline, pod);
                    info!(
                        pod = %pod.id(),
                        grace_seconds = seconds,
                        "force deleting pod to honor node grace period"
                    );
                    match self.ops.force_delete_pod(&pod.namespace, &pod.name, seconds).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                    forced.insert(pod.id(), ());
                }
            }
        }

        for pod in graceful_evictees(&node.pods) {
            if forced.contains_key(&pod.id()) {
                continue;
            }
            let result = self
                .ops
                .evict_pod(
                    &pod.namespace,
                    &pod.name,
                    pod.termination_grace_period_seconds,
                )
                .await;
            match result {
                Ok(()) => {}
                Err(Error::WorkloadBlocked(reason)) => {
                    debug!(pod = %pod.id(), %reason, "eviction blocked by disruption budget");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn cloud_terminate(
        &self,
        node: &StateNode,
        node_name: &str,
    ) -> Result<TerminationStage> {
        if node.provider_id.is_empty() {
            return self.finalize(node_name).await;
        }
        // NotFound is success: the instance is gone, possibly from a replay
        // of this same termination, and the finalizer can be released
        match self.provider.terminate_instance(&node.provider_id).await {
            Ok(crate::provider::TerminateOutcome::Terminated) => {
                debug!(node = %node_name, "instance termination requested");
                Ok(TerminationStage::CloudTerminating)
            }
            Ok(crate::provider::TerminateOutcome::NotFound) => self.finalize(node_name).await,
            Err(e) if e.is_not_found() => self.finalize(node_name).await,
            Err(e) => {
                warn!(node = %node_name, error = %e, "instance termination failed");
                Err(e)
            }
        }
    }

    async fn finalize(&self, node_name: &str) -> Result<TerminationStage> {
        match self.ops.remove_finalizer(node_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.forget(node_name);
        Ok(TerminationStage::Finalized)
    }

    fn forget(&self, node_name: &str) {
        self.drain_starts.remove(node_name);
        self.locks.remove(node_name);
    }
}
