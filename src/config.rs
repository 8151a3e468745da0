//! Runtime settings and feature gates
//!
//! Settings are assembled once at startup from CLI flags and environment
//! variables, then shared immutably across workers. Feature gates follow the
//! Kubernetes `name=bool` list convention.

use std::time::Duration;

use crate::{
    DEFAULT_MAX_INSTANCE_TYPES, DEFAULT_POLLING_PERIOD_SECS, DEFAULT_SPOT_FLEX_MIN,
    DEFAULT_STABILIZATION_WINDOW_SECS,
};

/// Feature gates controlling optional engine behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureGates {
    /// Enables forceful termination of nodes failing health checks
    pub node_repair: bool,
    /// Allows single-node consolidation to replace spot with cheaper spot
    pub spot_to_spot_consolidation: bool,
    /// Enables reserved-capacity-aware pricing (consumed by the adapter)
    pub reserved_capacity: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            node_repair: false,
            spot_to_spot_consolidation: false,
            reserved_capacity: false,
        }
    }
}

impl FeatureGates {
    /// Parse a `name=bool,name=bool` gate list, e.g.
    /// `spotToSpotConsolidation=true,nodeRepair=false`.
    ///
    /// Unknown gate names are rejected so typos fail at startup instead of
    /// silently running with defaults.
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let mut gates = Self::default();
        if s.trim().is_empty() {
            return Ok(gates);
        }
        for part in s.split(',') {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                crate::Error::configuration(format!(
                    "feature gate '{part}' is not of the form name=bool"
                ))
            })?;
            let value: bool = value.trim().parse().map_err(|_| {
                crate::Error::configuration(format!(
                    "feature gate '{name}' has non-boolean value '{value}'"
                ))
            })?;
            match name.trim() {
                "nodeRepair" => gates.node_repair = value,
                "spotToSpotConsolidation" => gates.spot_to_spot_consolidation = value,
                "reservedCapacity" => gates.reserved_capacity = value,
                other => {
                    return Err(crate::Error::configuration(format!(
                        "unknown feature gate '{other}'"
                    )))
                }
            }
        }
        Ok(gates)
    }
}

/// Engine-wide settings, immutable after startup
#[derive(Clone, Debug)]
pub struct Settings {
    /// Name of the cluster this engine owns nodes in
    pub cluster_name: String,
    /// Period between orchestrator ticks
    pub polling_period: Duration,
    /// Quiescence interval required after a scale event
    pub stabilization_window: Duration,
    /// Minimum cheaper-spot option count for spot-to-spot replacement
    pub spot_flex_min: usize,
    /// Cap on instance-type options sent per launch request
    pub max_instance_types: usize,
    /// Interruption queue name; the ingestor runs only when set
    pub interruption_queue: Option<String>,
    /// Maximum time the provisioning batcher holds a request open
    pub batch_max_duration: Duration,
    /// Idle time after which the provisioning batcher flushes
    pub batch_idle_duration: Duration,
    /// Feature gates
    pub feature_gates: FeatureGates,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            polling_period: Duration::from_secs(DEFAULT_POLLING_PERIOD_SECS),
            stabilization_window: Duration::from_secs(DEFAULT_STABILIZATION_WINDOW_SECS),
            spot_flex_min: DEFAULT_SPOT_FLEX_MIN,
            max_instance_types: DEFAULT_MAX_INSTANCE_TYPES,
            interruption_queue: None,
            batch_max_duration: Duration::from_secs(10),
            batch_idle_duration: Duration::from_secs(1),
            feature_gates: FeatureGates::default(),
        }
    }
}

impl Settings {
    /// Validate settings that cannot be checked by the CLI parser alone
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_name.is_empty() {
            return Err(crate::Error::configuration("cluster name must be set"));
        }
        if self.max_instance_types == 0 {
            return Err(crate::Error::configuration(
                "max instance types must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether the interruption ingestor should run
    pub fn interruption_enabled(&self) -> bool {
        self.interruption_queue.is_some()
    }
}
