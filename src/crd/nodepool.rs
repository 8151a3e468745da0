//! NodePool Custom Resource Definition
//!
//! A NodePool is the declarative template that produces worker nodes. It owns
//! the disruption configuration (consolidation policy, budgets) and the node
//! template (requirements, lifecycle durations) that drift detection hashes.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kube::CustomResource;
use ring::digest::{digest, SHA256};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    parse_duration, parse_lifecycle_duration, Budget, ConsolidationPolicy, Requirement,
};

/// Specification for a NodePool
///
/// The `template` block is hashed for drift detection; `weight`, `limits`,
/// and the whole `disruption` block are behavioral and never affect the hash.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "baler.dev",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    shortname = "np",
    status = "NodePoolStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.nodeCount"}"#,
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.disruption.consolidationPolicy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Node template: requirements and lifecycle fields, hashed for drift
    pub template: NodeTemplate,

    /// Disruption configuration; behavioral, excluded from the hash
    #[serde(default)]
    pub disruption: DisruptionSpec,

    /// Relative priority among pools during provisioning; behavioral
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    /// Resource ceilings for the pool as a whole; behavioral
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
}

/// The node template a pool stamps onto every node it produces
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    /// Label requirements nodes of this pool must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,

    /// Image selector resolved by the cloud adapter (e.g. an alias or query)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_selector: Option<String>,

    /// Node lifetime, Go duration or "Never"; nodes past it are expired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,

    /// Upper bound on drain time once termination starts, Go duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period: Option<String>,
}

/// Disruption configuration for a pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    /// Which nodes consolidation may touch
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,

    /// How long a node must hold its eligibility before consolidation acts
    #[serde(default = "default_consolidate_after")]
    pub consolidate_after: String,

    /// Rate limits on concurrent voluntary disruptions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub budgets: Vec<Budget>,
}

fn default_consolidate_after() -> String {
    "0s".to_string()
}

impl Default for DisruptionSpec {
    fn default() -> Self {
        Self {
            consolidation_policy: ConsolidationPolicy::default(),
            consolidate_after: default_consolidate_after(),
            budgets: Vec::new(),
        }
    }
}

// Only the non-behavioral template fields participate in the drift hash.
// Two pools serializing to the same inputs produce indistinguishable nodes.
#[derive(Serialize)]
struct HashInputs<'a> {
    requirements: &'a [Requirement],
    image_selector: &'a Option<String>,
    expire_after: &'a Option<String>,
    termination_grace_period: &'a Option<String>,
}

impl NodePoolSpec {
    /// Stable digest of the non-behavioral template fields
    ///
    /// Stamped onto nodes at creation as [`crate::NODEPOOL_HASH_ANNOTATION`]
    /// and recomputed by drift detection.
    pub fn template_hash(&self) -> Result<String, crate::Error> {
        let inputs = HashInputs {
            requirements: &self.template.requirements,
            image_selector: &self.template.image_selector,
            expire_after: &self.template.expire_after,
            termination_grace_period: &self.template.termination_grace_period,
        };
        let bytes = serde_json::to_vec(&inputs)
            .map_err(|e| crate::Error::serialization(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(digest(&SHA256, &bytes).as_ref()))
    }

    /// Parsed `consolidateAfter` duration
    pub fn consolidate_after(&self) -> Result<Duration, crate::Error> {
        parse_duration(&self.disruption.consolidate_after)
    }

    /// Parsed `expireAfter`, `None` when unset or "Never"
    pub fn expire_after(&self) -> Result<Option<Duration>, crate::Error> {
        match &self.template.expire_after {
            Some(s) => parse_lifecycle_duration(s),
            None => Ok(None),
        }
    }

    /// Parsed `terminationGracePeriod`, `None` when unset or "Never"
    pub fn termination_grace_period(&self) -> Result<Option<Duration>, crate::Error> {
        match &self.template.termination_grace_period {
            Some(s) => parse_lifecycle_duration(s),
            None => Ok(None),
        }
    }

    /// Validate the pool specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        for req in &self.template.requirements {
            req.validate()?;
        }
        self.consolidate_after()?;
        self.expire_after()?;
        self.termination_grace_period()?;
        for budget in &self.disruption.budgets {
            budget.validate()?;
        }
        Ok(())
    }
}

/// Status for a NodePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Number of owned nodes currently in the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,

    /// Most recently computed template hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
}
