//! Requirements algebra and the placement simulator
//!
//! Pure logic, no I/O: the planner feeds in snapshots from the cluster
//! mirror and catalogs from the provider, and gets back whether a disruption
//! leaves the workload schedulable.

pub mod requirements;
pub mod simulator;

pub use simulator::{
    simulate, PlacePod, PoolTemplate, ReplacementOption, ReplacementPlan, SimulationOutcome,
};
