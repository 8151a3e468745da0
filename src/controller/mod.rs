//! Kubernetes-facing glue: trait implementations and watch plumbing
//!
//! Everything that holds a `kube::Client` lives here; the engine modules
//! stay I/O-free behind their trait seams.

mod ops;
mod sync;

pub use ops::{ensure_finalizer, KubeNodeOps, KubePoolSource};
pub use sync::{run_node_watcher, run_pod_watcher, run_termination_scanner};
