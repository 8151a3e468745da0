//! Drift detection
//!
//! Periodically recomputes each pool's template hash and compares it to the
//! hash stamped on every owned node at creation. Also checks that node
//! labels still satisfy the pool's requirements, and that the pool's image
//! selector still resolves to the image the node booted from.
//!
//! Behavioral fields (`weight`, `limits`, `disruption.*`) are excluded from
//! the hash by construction, so changing them never drifts a node. Verdicts
//! are cleared when the condition resolves, when detection is disabled, or
//! when the node disappears from the mirror.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crd::NodePool;
use crate::provider::CloudProvider;
use crate::scheduling::requirements::labels_satisfy;
use crate::state::{Cluster, DriftKind};
use crate::Result;

/// The drift detector worker
pub struct DriftDetector {
    cluster: Arc<Cluster>,
    provider: Arc<dyn CloudProvider>,
    enabled: bool,
}

impl DriftDetector {
    /// Create a detector publishing verdicts into the mirror
    pub fn new(cluster: Arc<Cluster>, provider: Arc<dyn CloudProvider>, enabled: bool) -> Self {
        Self {
            cluster,
            provider,
            enabled,
        }
    }

    /// Run one detection pass over the current pools
    pub async fn detect(&self, pools: &[NodePool]) -> Result<()> {
        if !self.enabled {
            // disabling the feature clears every verdict
            for node in self.cluster.snapshot() {
                self.cluster.set_drifted(&node.name, None);
            }
            return Ok(());
        }

        let mut hashes = HashMap::new();
        let mut images = HashMap::new();
        let mut by_name = HashMap::new();
        for pool in pools {
            let Some(name) = pool.metadata.name.clone() else { continue };
            match pool.spec.template_hash() {
                Ok(hash) => {
                    hashes.insert(name.clone(), hash);
                }
                Err(e) => {
                    warn!(pool = %name, error = %e, "skipping unhashable pool template");
                    continue;
                }
            }
            if let Some(selector) = &pool.spec.template.image_selector {
                match self.provider.resolve_image(selector).await {
                    Ok(image) => {
                        images.insert(name.clone(), image);
                    }
                    Err(e) => {
                        // resolution failures must not flip drift either way
                        warn!(pool = %name, error = %e, "image selector resolution failed");
                    }
                }
            }
            by_name.insert(name, pool);
        }

        for node in self.cluster.snapshot() {
            let Some(pool_name) = &node.pool_name else { continue };
            let Some(pool) = by_name.get(pool_name) else {
                // pool deleted; nothing to compare against
                continue;
            };

            let verdict = if !labels_satisfy(&pool.spec.template.requirements, &node.labels) {
                Some(DriftKind::ResolvedDrift)
            } else if hashes.get(pool_name) != node.pool_hash.as_ref() {
                Some(DriftKind::SpecDrift)
            } else if let (Some(resolved), Some(booted)) =
                (images.get(pool_name), &node.image_id)
            {
                (resolved != booted).then_some(DriftKind::ImageDrift)
            } else {
                None
            };

            if verdict != node.drifted {
                debug!(node = %node.name, ?verdict, "drift verdict changed");
            }
            self.cluster.set_drifted(&node.name, verdict);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DisruptionSpec, NodePoolSpec, NodeTemplate, Requirement, RequirementOperator,
    };
    use crate::provider::FakeCloudProvider;
    use crate::state::node::fixtures;

    fn pool(name: &str, template: NodeTemplate) -> NodePool {
        let mut p = NodePool::new(
            name,
            NodePoolSpec {
                template,
                disruption: DisruptionSpec::default(),
                weight: None,
                limits: None,
            },
        );
        p.metadata.name = Some(name.into());
        p
    }

    fn cluster_with(nodes: Vec<crate::state::StateNode>) -> Arc<Cluster> {
        let cluster = Arc::new(Cluster::new());
        // route through the public surface the watch workers use
        for node in nodes {
            let mut api_node = k8s_openapi::api::core::v1::Node::default();
            api_node.metadata.name = Some(node.name.clone());
            api_node.metadata.labels = Some(node.labels.clone().into_iter().collect());
            let mut annotations = std::collections::BTreeMap::new();
            if let Some(hash) = &node.pool_hash {
                annotations.insert(crate::NODEPOOL_HASH_ANNOTATION.to_string(), hash.clone());
            }
            if let Some(image) = &node.image_id {
                annotations.insert("baler.dev/image-id".to_string(), image.clone());
            }
            api_node.metadata.annotations = Some(annotations);
            cluster.apply_node(&api_node);
        }
        cluster
    }

    fn stamped_node(name: &str, pool: &NodePool) -> crate::state::StateNode {
        let mut node = fixtures::node(name, "default", "4", "8Gi");
        node.pool_hash = Some(pool.spec.template_hash().unwrap());
        node
    }

    #[tokio::test]
    async fn test_hash_mismatch_drifts_node() {
        let original = pool("default", NodeTemplate::default());
        let cluster = cluster_with(vec![stamped_node("n1", &original)]);
        let provider = Arc::new(FakeCloudProvider::new());
        let detector = DriftDetector::new(cluster.clone(), provider, true);

        // same template: no drift
        detector.detect(&[original]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, None);

        // edited template: spec drift
        let edited = pool(
            "default",
            NodeTemplate {
                expire_after: Some("24h".into()),
                ..Default::default()
            },
        );
        detector.detect(&[edited]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, Some(DriftKind::SpecDrift));
    }

    /// Changing behavioral fields never drifts a node.
    #[tokio::test]
    async fn test_behavioral_changes_do_not_drift() {
        let original = pool("default", NodeTemplate::default());
        let cluster = cluster_with(vec![stamped_node("n1", &original)]);
        let provider = Arc::new(FakeCloudProvider::new());
        let detector = DriftDetector::new(cluster.clone(), provider, true);

        let mut behavioral = pool("default", NodeTemplate::default());
        behavioral.spec.weight = Some(99);
        behavioral.spec.disruption.consolidate_after = "4h".into();

        detector.detect(&[behavioral]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, None);
    }

    #[tokio::test]
    async fn test_incompatible_labels_resolve_drift() {
        let constrained = pool(
            "default",
            NodeTemplate {
                requirements: vec![Requirement {
                    key: crate::ZONE_LABEL.into(),
                    operator: RequirementOperator::In,
                    values: vec!["eu-west-1a".into()],
                }],
                ..Default::default()
            },
        );
        // fixture nodes sit in us-east-1a and were stamped with this hash
        let cluster = cluster_with(vec![stamped_node("n1", &constrained)]);
        let provider = Arc::new(FakeCloudProvider::new());
        let detector = DriftDetector::new(cluster.clone(), provider, true);

        detector.detect(&[constrained]).await.unwrap();
        assert_eq!(
            cluster.node("n1").unwrap().drifted,
            Some(DriftKind::ResolvedDrift)
        );
    }

    #[tokio::test]
    async fn test_image_resolution_change_drifts() {
        let with_image = pool(
            "default",
            NodeTemplate {
                image_selector: Some("al2@latest".into()),
                ..Default::default()
            },
        );
        let cluster = cluster_with(vec![stamped_node("n1", &with_image)]);
        let provider = Arc::new(FakeCloudProvider::new());
        let detector = DriftDetector::new(cluster.clone(), provider.clone(), true);

        // selector resolves to what the node booted from
        provider.set_image("al2@latest", "ami-001");
        detector.detect(&[with_image.clone()]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, None);

        // a new image is published
        provider.set_image("al2@latest", "ami-002");
        detector.detect(&[with_image.clone()]).await.unwrap();
        assert_eq!(
            cluster.node("n1").unwrap().drifted,
            Some(DriftKind::ImageDrift)
        );

        // and rolled back
        provider.set_image("al2@latest", "ami-001");
        detector.detect(&[with_image]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, None);
    }

    #[tokio::test]
    async fn test_disabling_detection_clears_verdicts() {
        let original = pool("default", NodeTemplate::default());
        let cluster = cluster_with(vec![stamped_node("n1", &original)]);
        cluster.set_drifted("n1", Some(DriftKind::SpecDrift));

        let provider = Arc::new(FakeCloudProvider::new());
        let detector = DriftDetector::new(cluster.clone(), provider, false);
        detector.detect(&[original]).await.unwrap();
        assert_eq!(cluster.node("n1").unwrap().drifted, None);
    }
}
