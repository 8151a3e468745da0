//! Custom Resource Definitions for Baler
//!
//! The engine owns a single CRD, `NodePool`, plus the supporting value types
//! shared with the disruption and scheduling layers.

mod nodepool;
mod types;

pub use nodepool::{DisruptionSpec, NodePool, NodePoolSpec, NodePoolStatus, NodeTemplate};
pub use types::{
    parse_duration, parse_lifecycle_duration, Budget, BudgetValue, CapacityType,
    ConsolidationPolicy, DisruptionReason, Requirement, RequirementOperator,
};
