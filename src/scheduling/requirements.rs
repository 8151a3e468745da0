//! Requirement and label compatibility algebra
//!
//! Three questions come up everywhere in the simulator:
//! - does a concrete node (a label map) satisfy a requirement list?
//! - does a pod's scheduling config allow a concrete node?
//! - could an instance type, which only *claims* possible label values,
//!   still satisfy a requirement list once launched?
//!
//! The third is answered against a claims map: key -> possible values. A key
//! absent from the claims map is unconstrained for the adapter, so only
//! `DoesNotExist`-style wants can fail against it.

use std::collections::BTreeMap;

use crate::crd::{Requirement, RequirementOperator};
use crate::state::PodRecord;

/// Whether every requirement matches the concrete label map
pub fn labels_satisfy(requirements: &[Requirement], labels: &BTreeMap<String, String>) -> bool {
    requirements
        .iter()
        .all(|r| r.matches(labels.get(&r.key).map(String::as_str)))
}

/// Whether one OR-of-AND-terms affinity allows the label map
///
/// An empty term list is vacuously satisfied, matching Kubernetes semantics
/// where absent affinity constrains nothing.
pub fn affinity_satisfied(terms: &[Vec<Requirement>], labels: &BTreeMap<String, String>) -> bool {
    terms.is_empty() || terms.iter().any(|term| labels_satisfy(term, labels))
}

/// Whether a pod's hard scheduling constraints allow a node with `labels`
pub fn pod_fits_labels(pod: &PodRecord, labels: &BTreeMap<String, String>) -> bool {
    let selector_ok = pod
        .node_selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v));
    selector_ok && affinity_satisfied(&pod.required_affinity, labels)
}

/// Whether a pod's preferred affinity terms are satisfied by `labels`
///
/// Used to record, before simulation, which preferences a pod currently
/// enjoys; the simulator then refuses to take those away.
pub fn preferences_satisfied(pod: &PodRecord, labels: &BTreeMap<String, String>) -> bool {
    affinity_satisfied(&pod.preferred_affinity, labels)
}

/// Possible label values an instance type could launch with
pub type Claims = BTreeMap<String, Vec<String>>;

/// Whether a requirement list could be satisfied by some launch drawn from
/// the claims map
pub fn claims_satisfy(requirements: &[Requirement], claims: &Claims) -> bool {
    requirements.iter().all(|req| match claims.get(&req.key) {
        Some(values) => match req.operator {
            RequirementOperator::In | RequirementOperator::NotIn => {
                values.iter().any(|v| req.matches(Some(v)))
            }
            RequirementOperator::Exists => !values.is_empty(),
            RequirementOperator::DoesNotExist => false,
            RequirementOperator::Gt | RequirementOperator::Lt => {
                values.iter().any(|v| req.matches(Some(v)))
            }
        },
        // unclaimed keys are free for the adapter to set, except the pod
        // explicitly requiring absence keeps them absent
        None => !matches!(req.operator, RequirementOperator::In),
    })
}

/// Restrict a claims map to the values allowed by a requirement list
pub fn narrow_claims(claims: &Claims, requirements: &[Requirement]) -> Claims {
    let mut narrowed = claims.clone();
    for req in requirements {
        if let Some(values) = narrowed.get_mut(&req.key) {
            values.retain(|v| req.matches(Some(v)));
        }
    }
    narrowed
}
