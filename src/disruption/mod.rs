//! The disruption engine
//!
//! Everything that decides *whether* and *which* nodes to disrupt:
//! - [`candidate`] - per-reason filtering and cost ordering (who may go)
//! - [`budgets`] - per-pool rate limits with cron windows (how many at once)
//! - [`drift`] - template-hash and resolved-value divergence (why)
//! - [`consolidation`] - the cost/benefit planner (what exactly to do)
//! - [`orchestrator`] - the single-flight loop that executes decisions
//!
//! Execution ordering inside a tick is strict: taint precedes replacement
//! launch, replacement readiness precedes deletion of the old nodes, and
//! deletion acknowledgement precedes the next method. The engine commits to
//! launch-then-delete, never delete-then-launch.

pub mod budgets;
pub mod candidate;
pub mod consolidation;
pub mod drift;
pub mod orchestrator;

pub use budgets::BudgetSnapshot;
pub use candidate::{select_candidates, Candidate, PoolCatalogs};
pub use consolidation::{plan_consolidation, plan_drift, PlanContext};
pub use drift::DriftDetector;
pub use orchestrator::{collect_orphans, NodeOps, Orchestrator, TickOutcome};

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::NodePool;
use crate::scheduling::ReplacementPlan;
use crate::Result;

/// The two voluntary disruption methods, tried in rotation per tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisruptionMethod {
    /// Replace or remove nodes whose spec diverged from their pool
    Drift,
    /// Remove or replace nodes whose workload can run elsewhere cheaper
    Consolidation,
}

/// What the planner decided to do with the chosen candidates
#[derive(Clone, Debug)]
pub enum DisruptionAction {
    /// One or more empty nodes removed together, no replacement
    DeleteEmpty {
        /// The empty nodes, across all pools, within budget
        nodes: Vec<Candidate>,
    },
    /// A single node whose pods re-fit onto existing free capacity
    Delete {
        /// The node to remove
        node: Candidate,
    },
    /// Nodes removed in favor of exactly one new node
    Replace {
        /// The nodes to remove; one for single-node, several for N-to-1
        nodes: Vec<Candidate>,
        /// The launch the simulator found workable
        replacement: ReplacementPlan,
    },
}

impl DisruptionAction {
    /// Names of every node the action removes
    pub fn node_names(&self) -> Vec<String> {
        match self {
            Self::DeleteEmpty { nodes } | Self::Replace { nodes, .. } => {
                nodes.iter().map(|c| c.node.name.clone()).collect()
            }
            Self::Delete { node } => vec![node.node.name.clone()],
        }
    }

    /// Whether the action launches a replacement before deleting
    pub fn has_replacement(&self) -> bool {
        matches!(self, Self::Replace { .. })
    }
}

impl std::fmt::Display for DisruptionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteEmpty { nodes } => write!(f, "delete {} empty node(s)", nodes.len()),
            Self::Delete { node } => write!(f, "delete {}", node.node.name),
            Self::Replace { nodes, replacement } => write!(
                f,
                "replace {} node(s) with one {} node",
                nodes.len(),
                replacement
                    .cheapest()
                    .map(|o| o.instance_type.as_str())
                    .unwrap_or("unknown")
            ),
        }
    }
}

/// Source of the current NodePool list
///
/// The orchestrator and the drift worker both read pools through this seam
/// so tests can feed fixtures instead of an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolSource: Send + Sync {
    /// The current set of pools
    async fn pools(&self) -> Result<Vec<NodePool>>;
}
