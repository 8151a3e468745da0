//! Watch-stream plumbing that keeps the cluster mirror current
//!
//! Three long-lived workers: a node watcher (owned nodes only, by label), a
//! pod watcher, and a termination scanner that steps the state machine for
//! every node carrying a deletion timestamp. The mirror is reconstructable
//! from the initial list alone; no state survives restarts.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::Cluster;
use crate::termination::Terminator;

use super::ops::ensure_finalizer;

/// Watch owned nodes and mirror them; also stamps the finalizer
pub async fn run_node_watcher(client: Client, cluster: Arc<Cluster>, cancel: CancellationToken) {
    let api: Api<Node> = Api::all(client.clone());
    let config = watcher::Config::default().labels(crate::NODEPOOL_LABEL);
    let mut stream = watcher(api, config).boxed();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Applied(node))) => {
                    cluster.apply_node(&node);
                    if let Err(e) = ensure_finalizer(&client, &node).await {
                        warn!(error = %e, "failed to ensure node finalizer");
                    }
                }
                Some(Ok(watcher::Event::Deleted(node))) => {
                    if let Some(name) = node.metadata.name.as_deref() {
                        cluster.delete_node(name);
                    }
                }
                Some(Ok(watcher::Event::Restarted(nodes))) => {
                    debug!(count = nodes.len(), "node watch restarted");
                    for node in &nodes {
                        cluster.apply_node(node);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "node watch error"),
                None => break,
            }
        }
    }
}

/// Watch all pods and mirror their node bindings
pub async fn run_pod_watcher(client: Client, cluster: Arc<Cluster>, cancel: CancellationToken) {
    let api: Api<Pod> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Applied(pod))) => cluster.apply_pod(&pod),
                Some(Ok(watcher::Event::Deleted(pod))) => {
                    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
                    if let Some(name) = pod.metadata.name.as_deref() {
                        cluster.delete_pod(namespace, name);
                    }
                }
                Some(Ok(watcher::Event::Restarted(pods))) => {
                    for pod in &pods {
                        cluster.apply_pod(pod);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "pod watch error"),
                None => break,
            }
        }
    }
}

/// Step the termination machine for every node being deleted
///
/// Each node advances under its own per-node lock inside the terminator, so
/// slow drains never block each other.
pub async fn run_termination_scanner(
    cluster: Arc<Cluster>,
    terminator: Arc<Terminator>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        let terminating: Vec<String> = {
            let mut names = Vec::new();
            cluster.for_each_node(|node| {
                if node.deletion_timestamp.is_some() {
                    names.push(node.name.clone());
                }
            });
            names
        };

        for name in terminating {
            let terminator = terminator.clone();
            tokio::spawn(async move {
                if let Err(e) = terminator.reconcile(&name).await {
                    warn!(node = %name, error = %e, "termination step failed");
                }
            });
        }
    }
}
