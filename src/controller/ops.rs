//! Kubernetes-backed implementations of the engine's trait seams
//!
//! The engine core only knows [`NodeOps`], [`TerminationOps`], and
//! [`PoolSource`]; these types carry a real `kube::Client` behind them.
//! Tests use the mockall doubles instead.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::crd::NodePool;
use crate::disruption::{NodeOps, PoolSource};
use crate::termination::TerminationOps;
use crate::{Error, Result};

/// Field manager name used for every patch the engine issues
const FIELD_MANAGER: &str = "baler";

/// Real node operations over the API server
pub struct KubeNodeOps {
    client: Client,
}

impl KubeNodeOps {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn patch_taints(&self, name: &str, taints: Vec<Taint>) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "taints": taints } });
        self.nodes()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeOps for KubeNodeOps {
    async fn taint_disrupted(&self, node: &str) -> Result<()> {
        let current = self.nodes().get(node).await?;
        let mut taints = current
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default();
        if taints.iter().any(|t| t.key == crate::DISRUPTED_TAINT_KEY) {
            return Ok(());
        }
        taints.push(Taint {
            key: crate::DISRUPTED_TAINT_KEY.to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        });
        debug!(node, "applying disrupted taint");
        self.patch_taints(node, taints).await
    }

    async fn untaint_disrupted(&self, node: &str) -> Result<()> {
        let current = match self.nodes().get_opt(node).await? {
            Some(node) => node,
            // already gone: nothing to revert
            None => return Ok(()),
        };
        let mut taints = current.spec.and_then(|s| s.taints).unwrap_or_default();
        let before = taints.len();
        taints.retain(|t| t.key != crate::DISRUPTED_TAINT_KEY);
        if taints.len() == before {
            return Ok(());
        }
        self.patch_taints(node, taints).await
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.nodes()
            .delete(node, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        Ok(self.nodes().get_opt(node).await?.is_some())
    }

    async fn workloads_ready(&self) -> Result<bool> {
        let deployments: Api<Deployment> = Api::all(self.client.clone());
        for d in deployments.list(&ListParams::default()).await? {
            let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
            let updated = d.status.as_ref().and_then(|s| s.updated_replicas).unwrap_or(0);
            if ready < desired || updated < desired {
                return Ok(false);
            }
        }

        let replica_sets: Api<ReplicaSet> = Api::all(self.client.clone());
        for rs in replica_sets.list(&ListParams::default()).await? {
            let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
            if ready < desired {
                return Ok(false);
            }
        }

        let stateful_sets: Api<StatefulSet> = Api::all(self.client.clone());
        for ss in stateful_sets.list(&ListParams::default()).await? {
            let desired = ss.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = ss.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
            let updated = ss.status.as_ref().and_then(|s| s.updated_replicas).unwrap_or(0);
            if ready < desired || updated < desired {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl TerminationOps for KubeNodeOps {
    async fn taint_disrupted(&self, node: &str) -> Result<()> {
        NodeOps::taint_disrupted(self, node).await
    }

    async fn evict_pod(&self, namespace: &str, name: &str, grace_seconds: i64) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_seconds.clamp(0, u32::MAX as i64) as u32),
                ..Default::default()
            }),
            ..Default::default()
        };
        match pods.evict(name, &params).await {
            Ok(_) => Ok(()),
            // the eviction API answers 429 when a PDB refuses
            Err(kube::Error::Api(resp)) if resp.code == 429 => Err(Error::workload_blocked(
                format!("eviction of {namespace}/{name} refused: {}", resp.message),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn force_delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: i64,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(
            name,
            &DeleteParams {
                grace_period_seconds: Some(grace_seconds.clamp(0, u32::MAX as i64) as u32),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    async fn remove_finalizer(&self, node: &str) -> Result<()> {
        let current = match self.nodes().get_opt(node).await? {
            Some(node) => node,
            None => return Ok(()),
        };
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        let before = finalizers.len();
        finalizers.retain(|f| f != crate::TERMINATION_FINALIZER);
        if finalizers.len() == before {
            return Ok(());
        }
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.nodes()
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Pool listing over the API server
pub struct KubePoolSource {
    client: Client,
}

impl KubePoolSource {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PoolSource for KubePoolSource {
    async fn pools(&self) -> Result<Vec<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Ensure the termination finalizer is present on an owned node
///
/// Called from the node watcher on every add/update; a node already
/// terminating is left alone.
pub async fn ensure_finalizer(client: &Client, node: &Node) -> Result<()> {
    let Some(name) = node.metadata.name.as_deref() else {
        return Ok(());
    };
    if node.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    let finalizers = node.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == crate::TERMINATION_FINALIZER) {
        return Ok(());
    }
    let mut finalizers = finalizers;
    finalizers.push(crate::TERMINATION_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    let api: Api<Node> = Api::all(client.clone());
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
