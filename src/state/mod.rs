//! Cluster state mirror
//!
//! An in-memory, watch-fed view of the owned fleet. See [`Cluster`] for the
//! mirror itself and [`node`] for the per-node and per-pod records.

pub mod cluster;
pub mod node;
pub mod resources;

pub use cluster::{Cluster, PoolCounts};
pub use node::{
    DriftKind, NodeTaint, PodPhase, PodRecord, PodToleration, SpreadPolicy, StateNode,
    TopologySpread,
};
pub use resources::{parse_quantity, Resources};
