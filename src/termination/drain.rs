//! Drain policy: who gets evicted, when, and with how much grace
//!
//! Pure functions over pod snapshots so the grace-period arithmetic is
//! testable without a cluster. The state machine in [`super::machine`]
//! applies these decisions through the API.

use chrono::{DateTime, Duration, Utc};

use crate::state::PodRecord;

/// Whether the drain must move this pod off the node
///
/// Static pods die with the node, pods tolerating the disrupted taint chose
/// to stay, and finished or already-terminating pods need no help.
pub fn is_evictable(pod: &PodRecord) -> bool {
    !pod.owned_by_node
        && !pod.tolerates_disrupted
        && !pod.phase.is_terminal()
        && !pod.terminating
}

/// Evictable pods that may be asked politely via the eviction API
///
/// `do-not-disrupt` pods are excluded from graceful eviction; they are only
/// ever removed by the force-delete deadline below.
pub fn graceful_evictees(pods: &[PodRecord]) -> Vec<&PodRecord> {
    pods.iter()
        .filter(|p| is_evictable(p) && !p.do_not_disrupt)
        .collect()
}

/// When a pod must be force-deleted so its own grace still fits the node's
///
/// With a node grace of 1h and a pod asking 300s, the force delete lands at
/// `drainStart + 55min`: the pod gets its full five minutes inside the hour.
/// Pods whose requested grace exceeds the node's get force-deleted
/// immediately and truncated.
pub fn force_delete_time(
    drain_start: DateTime<Utc>,
    node_grace: Duration,
    pod: &PodRecord,
) -> DateTime<Utc> {
    let pod_grace = Duration::seconds(pod.termination_grace_period_seconds.max(0));
    let offset = (node_grace - pod_grace).max(Duration::zero());
    drain_start + offset
}

/// Grace seconds granted to a force-deleted pod, truncated to what remains
/// before the node deadline
pub fn truncated_grace(now: DateTime<Utc>, deadline: DateTime<Utc>, pod: &PodRecord) -> i64 {
    let remaining = (deadline - now).num_seconds().max(0);
    pod.termination_grace_period_seconds.clamp(0, remaining)
}

/// Whether nothing evictable remains on the node
pub fn drain_complete(pods: &[PodRecord]) -> bool {
    !pods.iter().any(is_evictable)
}
