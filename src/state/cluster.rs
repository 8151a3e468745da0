//! In-memory cluster state mirror
//!
//! The single authoritative view of owned nodes, their pods, and pool
//! membership. Watch streams write into it; every other component reads
//! through it. The mirror is the single writer for node flags
//! (marked-for-deletion, nomination, drift), which keeps the invariants
//! checkable in one place.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Pod};
use parking_lot::RwLock;
use tracing::debug;

use crate::state::node::{DriftKind, PodRecord, StateNode};

/// Node counts a budget computation needs for one pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// All owned nodes in the pool
    pub total: u32,
    /// Nodes whose deletion is in progress, by any actor
    pub deleting: u32,
    /// Nodes not currently Ready
    pub not_ready: u32,
}

/// The cluster state mirror
///
/// Thread-safe; watch workers write, the orchestrator and planners read.
/// `state_version` is bumped on every change that could affect a
/// consolidation decision, letting the orchestrator skip ticks when nothing
/// relevant happened.
pub struct Cluster {
    nodes: RwLock<HashMap<String, StateNode>>,
    // provider id -> node name, for interruption lookups
    instance_index: RwLock<HashMap<String, String>>,
    // pod id -> node name, so pod deletions find their node
    pod_index: RwLock<HashMap<String, String>>,
    // pods with no node assignment yet; drives the stabilization check
    pending_pods: DashMap<String, ()>,
    nominations: DashMap<String, DateTime<Utc>>,
    state_version: AtomicU64,
    last_creation: RwLock<Option<DateTime<Utc>>>,
    last_deletion: RwLock<Option<DateTime<Utc>>>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    /// Create an empty mirror
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            instance_index: RwLock::new(HashMap::new()),
            pod_index: RwLock::new(HashMap::new()),
            pending_pods: DashMap::new(),
            nominations: DashMap::new(),
            state_version: AtomicU64::new(0),
            last_creation: RwLock::new(None),
            last_deletion: RwLock::new(None),
        }
    }

    fn bump(&self) {
        self.state_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Monotone counter bumped on any decision-relevant change
    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Watch ingestion
    // =========================================================================

    /// Apply a node create/update from the watch stream
    ///
    /// Engine-owned flags (mark-for-deletion, delete-issued, drift, pod
    /// bookkeeping) survive re-parses of the API object.
    pub fn apply_node(&self, node: &Node) {
        let now = Utc::now();
        let parsed = StateNode::from_node(node, now);
        if parsed.name.is_empty() {
            return;
        }

        let mut nodes = self.nodes.write();
        if !parsed.provider_id.is_empty() {
            self.instance_index
                .write()
                .insert(parsed.provider_id.clone(), parsed.name.clone());
        }
        match nodes.get_mut(&parsed.name) {
            Some(existing) => {
                let pods = std::mem::take(&mut existing.pods);
                let flags = (
                    existing.marked_for_deletion,
                    existing.delete_issued,
                    existing.drifted,
                    existing.unhealthy,
                    existing.last_pod_event,
                );
                *existing = parsed;
                existing.pods = pods;
                (
                    existing.marked_for_deletion,
                    existing.delete_issued,
                    existing.drifted,
                    existing.unhealthy,
                    existing.last_pod_event,
                ) = flags;
            }
            None => {
                *self.last_creation.write() = Some(now);
                debug!(node = %parsed.name, "node joined the mirror");
                nodes.insert(parsed.name.clone(), parsed);
            }
        }
        drop(nodes);
        self.bump();
    }

    /// Remove a node after the API object is gone
    pub fn delete_node(&self, name: &str) {
        let removed = self.nodes.write().remove(name);
        if let Some(node) = removed {
            self.instance_index.write().remove(&node.provider_id);
            let mut pod_index = self.pod_index.write();
            for pod in &node.pods {
                pod_index.remove(&pod.id());
            }
            drop(pod_index);
            *self.last_deletion.write() = Some(Utc::now());
            debug!(node = %name, "node left the mirror");
        }
        self.nominations.remove(name);
        self.bump();
    }

    /// Apply a pod create/update from the watch stream
    pub fn apply_pod(&self, pod: &Pod) {
        let record = PodRecord::from_pod(pod);
        if record.name.is_empty() {
            return;
        }
        let id = record.id();
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());

        match node_name {
            None => {
                self.pending_pods.insert(id, ());
            }
            Some(node_name) => {
                self.pending_pods.remove(&id);
                // the pod may have moved since we last saw it; pod_index is
                // always locked before nodes to keep lock order consistent
                let previous = self.pod_index.write().insert(id.clone(), node_name.clone());
                let mut nodes = self.nodes.write();
                if let Some(prev) = previous.filter(|p| *p != node_name) {
                    if let Some(old_node) = nodes.get_mut(&prev) {
                        old_node.pods.retain(|p| p.id() != id);
                        old_node.last_pod_event = Utc::now();
                    }
                }
                if let Some(node) = nodes.get_mut(&node_name) {
                    match node.pods.iter_mut().find(|p| p.id() == id) {
                        Some(existing) => *existing = record,
                        None => {
                            node.pods.push(record);
                            node.last_pod_event = Utc::now();
                        }
                    }
                }
            }
        }
        self.bump();
    }

    /// Remove a pod after the API object is gone
    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let id = format!("{namespace}/{name}");
        self.pending_pods.remove(&id);
        if let Some(node_name) = self.pod_index.write().remove(&id) {
            let mut nodes = self.nodes.write();
            if let Some(node) = nodes.get_mut(&node_name) {
                node.pods.retain(|p| p.id() != id);
                node.last_pod_event = Utc::now();
            }
        }
        self.bump();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Visit every node; the visitor sees a consistent snapshot per node
    pub fn for_each_node(&self, mut visit: impl FnMut(&StateNode)) {
        let nodes = self.nodes.read();
        for node in nodes.values() {
            visit(node);
        }
    }

    /// Cloned snapshot of all nodes, for planners that hold it across awaits
    pub fn snapshot(&self) -> Vec<StateNode> {
        self.nodes.read().values().cloned().collect()
    }

    /// Look up one node by cluster-local name
    pub fn node(&self, name: &str) -> Option<StateNode> {
        self.nodes.read().get(name).cloned()
    }

    /// Look up one node by provider instance id
    pub fn node_by_instance(&self, provider_id: &str) -> Option<StateNode> {
        let name = self.instance_index.read().get(provider_id).cloned()?;
        self.node(&name)
    }

    /// Look up a node from a bare instance id
    ///
    /// Provider ids carry a scheme prefix (`aws:///i-0abc`); a bare instance
    /// id matches by suffix so garbage collection and interruption lookups
    /// work from either form.
    pub fn find_by_instance(&self, instance_id: &str) -> Option<StateNode> {
        let name = {
            let index = self.instance_index.read();
            match index.get(instance_id) {
                Some(name) => Some(name.clone()),
                None => index
                    .iter()
                    .find(|(provider_id, _)| provider_id.ends_with(instance_id))
                    .map(|(_, name)| name.clone()),
            }
        };
        name.and_then(|n| self.node(&n))
    }

    /// Whether any node registered with this instance id
    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.find_by_instance(instance_id).is_some()
    }

    /// Whether the node has registered and passed startup checks
    pub fn is_initialized(&self, name: &str) -> bool {
        self.nodes
            .read()
            .get(name)
            .map(|n| n.initialized)
            .unwrap_or(false)
    }

    /// Per-pool node counts for budget computations
    pub fn pool_counts(&self) -> BTreeMap<String, PoolCounts> {
        let mut counts: BTreeMap<String, PoolCounts> = BTreeMap::new();
        for node in self.nodes.read().values() {
            let Some(pool) = &node.pool_name else { continue };
            let entry = counts.entry(pool.clone()).or_default();
            entry.total += 1;
            if node.deleting() {
                entry.deleting += 1;
            }
            if !node.ready {
                entry.not_ready += 1;
            }
        }
        counts
    }

    /// Most recent node join, if any
    pub fn last_creation_time(&self) -> Option<DateTime<Utc>> {
        *self.last_creation.read()
    }

    /// Most recent node removal, if any
    pub fn last_deletion_time(&self) -> Option<DateTime<Utc>> {
        *self.last_deletion.read()
    }

    /// Whether any pod is waiting for a node
    pub fn has_pending_pods(&self) -> bool {
        !self.pending_pods.is_empty()
    }

    // =========================================================================
    // Engine-owned flags
    // =========================================================================

    /// Reserve a node for imminent scheduler binds; not a candidate until TTL
    pub fn nominate(&self, name: &str, ttl: Duration) {
        self.nominations.insert(name.to_string(), Utc::now() + ttl);
        self.bump();
    }

    /// Whether the node currently holds a live nomination
    pub fn is_nominated(&self, name: &str) -> bool {
        let until = self.nominations.get(name).map(|entry| *entry);
        match until {
            Some(until) if until > Utc::now() => true,
            Some(_) => {
                self.nominations.remove(name);
                false
            }
            None => false,
        }
    }

    /// Mark a node as chosen for deletion; idempotent
    ///
    /// A marked node is never re-evaluated as a candidate and the simulator
    /// places no new pods onto it.
    pub fn mark_for_deletion(&self, name: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(name) {
            if !node.marked_for_deletion {
                node.marked_for_deletion = true;
                drop(nodes);
                self.bump();
            }
        }
    }

    /// Revert a mark; only permitted before the delete request went out
    pub fn unmark_for_deletion(&self, name: &str) -> Result<(), crate::Error> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(name) {
            Some(node) if node.delete_issued => Err(crate::Error::precondition(format!(
                "delete already issued for node {name}"
            ))),
            Some(node) => {
                node.marked_for_deletion = false;
                drop(nodes);
                self.bump();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Record that the delete request was sent; unmark is refused afterwards
    pub fn record_delete_issued(&self, name: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(name) {
            node.delete_issued = true;
        }
    }

    /// Publish a drift verdict; `None` clears it
    pub fn set_drifted(&self, name: &str, kind: Option<DriftKind>) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(name) {
            if node.drifted != kind {
                node.drifted = kind;
                drop(nodes);
                self.bump();
            }
        }
    }

    /// Publish a health verdict for the repair path
    pub fn set_unhealthy(&self, name: &str, unhealthy: bool) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(name) {
            if node.unhealthy != unhealthy {
                node.unhealthy = unhealthy;
                drop(nodes);
                self.bump();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::node::fixtures;

    fn mirror_with(nodes: Vec<StateNode>) -> Cluster {
        let cluster = Cluster::new();
        {
            let mut map = cluster.nodes.write();
            let mut instances = cluster.instance_index.write();
            for node in nodes {
                instances.insert(node.provider_id.clone(), node.name.clone());
                map.insert(node.name.clone(), node);
            }
        }
        cluster
    }

    #[test]
    fn test_mark_for_deletion_is_idempotent_and_sticky() {
        let cluster = mirror_with(vec![fixtures::node("n1", "default", "4", "8Gi")]);

        cluster.mark_for_deletion("n1");
        let v1 = cluster.state_version();
        cluster.mark_for_deletion("n1");
        // second mark is a no-op, version unchanged
        assert_eq!(cluster.state_version(), v1);
        assert!(cluster.node("n1").unwrap().marked_for_deletion);
    }

    #[test]
    fn test_unmark_refused_after_delete_issued() {
        let cluster = mirror_with(vec![fixtures::node("n1", "default", "4", "8Gi")]);

        cluster.mark_for_deletion("n1");
        assert!(cluster.unmark_for_deletion("n1").is_ok());

        cluster.mark_for_deletion("n1");
        cluster.record_delete_issued("n1");
        let err = cluster.unmark_for_deletion("n1").unwrap_err();
        assert!(err.to_string().contains("precondition violated"));
    }

    #[test]
    fn test_nomination_expires() {
        let cluster = mirror_with(vec![fixtures::node("n1", "default", "4", "8Gi")]);

        cluster.nominate("n1", Duration::seconds(60));
        assert!(cluster.is_nominated("n1"));

        cluster.nominate("n1", Duration::seconds(-1));
        assert!(!cluster.is_nominated("n1"));
    }

    #[test]
    fn test_pool_counts_track_deleting_and_not_ready() {
        let mut deleting = fixtures::node("n2", "default", "4", "8Gi");
        deleting.marked_for_deletion = true;
        let mut not_ready = fixtures::node("n3", "default", "4", "8Gi");
        not_ready.ready = false;
        let other_pool = fixtures::node("m1", "gpu", "8", "32Gi");

        let cluster = mirror_with(vec![
            fixtures::node("n1", "default", "4", "8Gi"),
            deleting,
            not_ready,
            other_pool,
        ]);

        let counts = cluster.pool_counts();
        assert_eq!(
            counts["default"],
            PoolCounts {
                total: 3,
                deleting: 1,
                not_ready: 1
            }
        );
        assert_eq!(counts["gpu"].total, 1);
    }

    #[test]
    fn test_instance_lookup() {
        let cluster = mirror_with(vec![fixtures::node("n1", "default", "4", "8Gi")]);
        let found = cluster.node_by_instance("fake:///n1").unwrap();
        assert_eq!(found.name, "n1");
        assert!(cluster.node_by_instance("fake:///missing").is_none());
    }

    #[test]
    fn test_version_bumps_on_flag_changes() {
        let cluster = mirror_with(vec![fixtures::node("n1", "default", "4", "8Gi")]);
        let v0 = cluster.state_version();

        cluster.set_drifted("n1", Some(DriftKind::SpecDrift));
        assert!(cluster.state_version() > v0);

        let v1 = cluster.state_version();
        // same verdict again is a no-op
        cluster.set_drifted("n1", Some(DriftKind::SpecDrift));
        assert_eq!(cluster.state_version(), v1);
    }
}
