//! Mirror records for owned nodes and their pods
//!
//! These are plain-data snapshots parsed out of the watch streams. All
//! engine decisions read these records instead of raw API objects, so the
//! parsing rules here (which labels matter, what counts as reschedulable)
//! are load-bearing for every component downstream.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::crd::{CapacityType, Requirement, RequirementOperator};
use crate::state::resources::Resources;

/// How far a pod is through its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PodPhase {
    /// Scheduled and running
    Running,
    /// Not yet scheduled or starting
    #[default]
    Pending,
    /// Completed successfully
    Succeeded,
    /// Completed with failure
    Failed,
    /// Phase not reported
    Unknown,
}

impl PodPhase {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Running") => Self::Running,
            Some("Pending") => Self::Pending,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Whether the pod has finished and will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// What a topology spread constraint does when violated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpreadPolicy {
    /// Placement violating the skew is forbidden
    DoNotSchedule,
    /// Skew is a preference only
    ScheduleAnyway,
}

/// A pod's topology spread constraint, reduced to what the simulator needs
#[derive(Clone, Debug, PartialEq)]
pub struct TopologySpread {
    /// Node label key defining the topology domains
    pub topology_key: String,
    /// Maximum allowed difference between domain counts
    pub max_skew: i32,
    /// Hard or soft constraint
    pub policy: SpreadPolicy,
}

/// A scheduling-relevant taint on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTaint {
    /// Taint key
    pub key: String,
    /// Taint value, empty when unset
    pub value: String,
    /// `NoSchedule` or `NoExecute`; `PreferNoSchedule` is dropped at parse
    pub effect: String,
}

/// A pod toleration, reduced to the matching rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodToleration {
    /// Key the toleration matches; `None` matches every key
    pub key: Option<String>,
    /// Effect the toleration matches; `None` matches every effect
    pub effect: Option<String>,
    /// Value for `Equal`-operator tolerations; `None` means `Exists`
    pub value: Option<String>,
}

impl PodToleration {
    /// Whether this toleration covers the given taint
    pub fn tolerates(&self, taint: &NodeTaint) -> bool {
        let key_ok = self.key.as_deref().map_or(true, |k| k == taint.key);
        let effect_ok = self.effect.as_deref().map_or(true, |e| e == taint.effect);
        let value_ok = self.value.as_deref().map_or(true, |v| v == taint.value);
        key_ok && effect_ok && value_ok
    }
}

/// Snapshot of a pod bound to an owned node
#[derive(Clone, Debug, Default)]
pub struct PodRecord {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Controller owner kind ("ReplicaSet", "DaemonSet", "StatefulSet", ...)
    pub owner_kind: Option<String>,
    /// Identity of the owning controller, used to group pods for spreading
    pub owner_id: Option<String>,
    /// Whether the pod is a static pod owned by the node object itself
    pub owned_by_node: bool,
    /// Lifecycle phase
    pub phase: PodPhase,
    /// Whether deletion has started
    pub terminating: bool,
    /// Sum of container resource requests
    pub requests: Resources,
    /// Scheduling priority, zero when unset
    pub priority: i32,
    /// Pod-level opt-out from voluntary disruption
    pub do_not_disrupt: bool,
    /// Pod's own grace period in seconds (Kubernetes default 30)
    pub termination_grace_period_seconds: i64,
    /// Whether the pod tolerates the disrupted taint
    pub tolerates_disrupted: bool,
    /// All tolerations, consulted by the simulator against node taints
    pub tolerations: Vec<PodToleration>,
    /// Plain nodeSelector labels
    pub node_selector: BTreeMap<String, String>,
    /// Required node affinity: OR over terms, AND within a term
    pub required_affinity: Vec<Vec<Requirement>>,
    /// Preferred node affinity terms, weights dropped
    pub preferred_affinity: Vec<Vec<Requirement>>,
    /// Topology spread constraints
    pub topology_spread: Vec<TopologySpread>,
}

impl PodRecord {
    /// Parse the scheduler-relevant subset of a pod object
    pub fn from_pod(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();

        let mut owner_kind = None;
        let mut owner_id = None;
        let mut owned_by_node = false;
        for owner in meta.owner_references.iter().flatten() {
            if owner.controller == Some(true) {
                owned_by_node = owner.kind == "Node";
                owner_id = Some(owner.uid.clone());
                owner_kind = Some(owner.kind.clone());
                break;
            }
        }

        let mut requests = Resources::new();
        for container in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
            if let Some(r) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            {
                requests.add(&Resources::from_resource_list(r));
            }
        }
        // every pod occupies a pod slot
        requests.set("pods", 1000);

        let tolerations: Vec<PodToleration> = spec
            .and_then(|s| s.tolerations.as_ref())
            .map(|list| {
                list.iter()
                    .map(|t| PodToleration {
                        key: t.key.clone(),
                        effect: t.effect.clone(),
                        // Exists-operator tolerations match any value
                        value: if t.operator.as_deref() == Some("Exists") {
                            None
                        } else {
                            t.value.clone()
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tolerates_disrupted = tolerations.iter().any(|t| {
            t.tolerates(&NodeTaint {
                key: crate::DISRUPTED_TAINT_KEY.to_string(),
                value: String::new(),
                effect: "NoSchedule".to_string(),
            })
        });

        let node_affinity = spec
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref());

        let required_affinity = node_affinity
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|selector| {
                selector
                    .node_selector_terms
                    .iter()
                    .map(convert_term_expressions)
                    .collect()
            })
            .unwrap_or_default();

        let preferred_affinity = node_affinity
            .and_then(|na| {
                na.preferred_during_scheduling_ignored_during_execution
                    .as_ref()
            })
            .map(|terms| {
                terms
                    .iter()
                    .map(|t| convert_term_expressions(&t.preference))
                    .collect()
            })
            .unwrap_or_default();

        let topology_spread = spec
            .and_then(|s| s.topology_spread_constraints.as_ref())
            .map(|constraints| {
                constraints
                    .iter()
                    .map(|c| TopologySpread {
                        topology_key: c.topology_key.clone(),
                        max_skew: c.max_skew,
                        policy: if c.when_unsatisfiable == "DoNotSchedule" {
                            SpreadPolicy::DoNotSchedule
                        } else {
                            SpreadPolicy::ScheduleAnyway
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            owner_kind,
            owner_id,
            owned_by_node,
            phase: PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
            terminating: meta.deletion_timestamp.is_some(),
            requests,
            priority: spec.and_then(|s| s.priority).unwrap_or(0),
            do_not_disrupt: meta
                .annotations
                .as_ref()
                .and_then(|a| a.get(crate::DO_NOT_DISRUPT_ANNOTATION))
                .map(|v| v == "true")
                .unwrap_or(false),
            termination_grace_period_seconds: spec
                .and_then(|s| s.termination_grace_period_seconds)
                .unwrap_or(30),
            tolerates_disrupted,
            tolerations,
            node_selector: spec
                .and_then(|s| s.node_selector.clone())
                .unwrap_or_default(),
            required_affinity,
            preferred_affinity,
            topology_spread,
        }
    }

    /// `namespace/name`, the identity used across the mirror
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether the pod is managed by a DaemonSet
    pub fn is_daemon(&self) -> bool {
        self.owner_kind.as_deref() == Some("DaemonSet")
    }

    /// Whether the pod would need a new home if its node went away
    ///
    /// Static pods die with the node, terminal and terminating pods are
    /// already gone, and daemon pods re-appear wherever a replacement lands.
    pub fn is_reschedulable(&self) -> bool {
        !self.owned_by_node && !self.terminating && !self.phase.is_terminal() && !self.is_daemon()
    }

    /// Whether the pod blocks a node from counting as empty
    pub fn blocks_emptiness(&self) -> bool {
        self.is_reschedulable()
    }
}

fn convert_term_expressions(
    term: &k8s_openapi::api::core::v1::NodeSelectorTerm,
) -> Vec<Requirement> {
    term.match_expressions
        .iter()
        .flatten()
        .filter_map(|expr| {
            let operator = match expr.operator.as_str() {
                "In" => RequirementOperator::In,
                "NotIn" => RequirementOperator::NotIn,
                "Exists" => RequirementOperator::Exists,
                "DoesNotExist" => RequirementOperator::DoesNotExist,
                "Gt" => RequirementOperator::Gt,
                "Lt" => RequirementOperator::Lt,
                _ => return None,
            };
            Some(Requirement {
                key: expr.key.clone(),
                operator,
                values: expr.values.clone().unwrap_or_default(),
            })
        })
        .collect()
}

/// Why the engine considers a node drifted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftKind {
    /// The stamped template hash no longer matches the pool template
    SpecDrift,
    /// The node's labels no longer satisfy the pool requirements
    ResolvedDrift,
    /// The image selector now resolves to a different image id
    ImageDrift,
}

/// Snapshot of an owned node, the unit of every disruption decision
#[derive(Clone, Debug)]
pub struct StateNode {
    /// Cluster-local node name
    pub name: String,
    /// Provider-assigned instance id
    pub provider_id: String,
    /// Owning pool name, from the pool label
    pub pool_name: Option<String>,
    /// Template hash stamped at creation
    pub pool_hash: Option<String>,
    /// Image id the node booted from, stamped at creation
    pub image_id: Option<String>,
    /// All node labels
    pub labels: BTreeMap<String, String>,
    /// Zone label value
    pub zone: Option<String>,
    /// Instance type label value
    pub instance_type: Option<String>,
    /// Capacity type label value
    pub capacity_type: CapacityType,
    /// Offering price recorded at launch, when stamped
    pub launch_price: Option<f64>,
    /// Allocatable capacity reported by the kubelet
    pub allocatable: Resources,
    /// Whether the node registered and passed startup checks
    pub initialized: bool,
    /// Whether the node's Ready condition is True
    pub ready: bool,
    /// Whether the API object carries a deletion timestamp
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Node-level opt-out from voluntary disruption
    pub do_not_disrupt: bool,
    /// Whether the disrupted NoSchedule taint is present
    pub tainted_disrupted: bool,
    /// All NoSchedule/NoExecute taints on the node
    pub taints: Vec<NodeTaint>,
    /// Creation time of the node object
    pub created_at: DateTime<Utc>,
    /// Pods currently bound to the node
    pub pods: Vec<PodRecord>,
    /// Latest pod schedule or removal seen on this node
    pub last_pod_event: DateTime<Utc>,
    /// Engine flag: node chosen for deletion, never a candidate again
    pub marked_for_deletion: bool,
    /// Engine flag: delete request already sent to the API server
    pub delete_issued: bool,
    /// Drift verdict published by the drift detector
    pub drifted: Option<DriftKind>,
    /// Health verdict consumed by the repair path
    pub unhealthy: bool,
}

impl StateNode {
    /// Parse the mirror-relevant subset of a node object
    pub fn from_node(node: &Node, now: DateTime<Utc>) -> Self {
        let meta = &node.metadata;
        let labels = meta.labels.clone().unwrap_or_default();
        let annotations = meta.annotations.clone().unwrap_or_default();

        let capacity_type = labels
            .get(crate::CAPACITY_TYPE_LABEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        let taints: Vec<NodeTaint> = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .map(|taints| {
                taints
                    .iter()
                    // PreferNoSchedule never blocks placement
                    .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
                    .map(|t| NodeTaint {
                        key: t.key.clone(),
                        value: t.value.clone().unwrap_or_default(),
                        effect: t.effect.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let tainted_disrupted = taints.iter().any(|t| t.key == crate::DISRUPTED_TAINT_KEY);

        Self {
            name: meta.name.clone().unwrap_or_default(),
            provider_id: node
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.clone())
                .unwrap_or_default(),
            pool_name: labels.get(crate::NODEPOOL_LABEL).cloned(),
            pool_hash: annotations.get(crate::NODEPOOL_HASH_ANNOTATION).cloned(),
            image_id: annotations.get("baler.dev/image-id").cloned(),
            zone: labels.get(crate::ZONE_LABEL).cloned(),
            instance_type: labels.get(crate::INSTANCE_TYPE_LABEL).cloned(),
            capacity_type,
            launch_price: annotations
                .get("baler.dev/launch-price")
                .and_then(|v| v.parse().ok()),
            allocatable: node
                .status
                .as_ref()
                .and_then(|s| s.allocatable.as_ref())
                .map(Resources::from_resource_list)
                .unwrap_or_default(),
            initialized: labels
                .get(crate::INITIALIZED_LABEL)
                .map(|v| v == "true")
                .unwrap_or(false),
            ready,
            deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
            do_not_disrupt: annotations
                .get(crate::DO_NOT_DISRUPT_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false),
            tainted_disrupted,
            taints,
            created_at: meta.creation_timestamp.as_ref().map(|t| t.0).unwrap_or(now),
            labels,
            pods: Vec::new(),
            last_pod_event: now,
            marked_for_deletion: false,
            delete_issued: false,
            drifted: None,
            unhealthy: false,
        }
    }

    /// Pods that must find a new home if this node is removed
    pub fn reschedulable_pods(&self) -> impl Iterator<Item = &PodRecord> {
        self.pods.iter().filter(|p| p.is_reschedulable())
    }

    /// Sum of requests from daemon pods; they re-appear on any replacement
    pub fn daemon_overhead(&self) -> Resources {
        let mut total = Resources::new();
        for pod in self.pods.iter().filter(|p| p.is_daemon() && !p.terminating) {
            total.add(&pod.requests);
        }
        total
    }

    /// Allocatable capacity minus all current pod requests
    pub fn free_capacity(&self) -> Resources {
        let mut free = self.allocatable.clone();
        for pod in &self.pods {
            if !pod.terminating && !pod.phase.is_terminal() {
                free.saturating_sub(&pod.requests);
            }
        }
        free
    }

    /// Whether the node carries no reschedulable workload
    pub fn is_empty_of_workload(&self) -> bool {
        !self.pods.iter().any(|p| p.blocks_emptiness())
    }

    /// Whether deletion is already in progress by any actor
    pub fn deleting(&self) -> bool {
        self.marked_for_deletion || self.deletion_timestamp.is_some()
    }
}
