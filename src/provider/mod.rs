//! Cloud provider abstraction layer
//!
//! The engine never talks to a cloud directly; it consumes this trait. Real
//! adapters (EC2 fleets, instance catalogs, image resolution) live outside
//! the engine. The in-tree [`FakeCloudProvider`] backs the test suites.
//!
//! # Contracts
//!
//! - [`CloudProvider::create_instance`] is idempotent on the caller-supplied
//!   request key: replaying a key returns the original instance.
//! - [`CloudProvider::terminate_instance`] is safe to call more than once;
//!   the second call reports [`TerminateOutcome::NotFound`].

mod fake;

pub use fake::{FakeCloudProvider, LaunchFailure};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CapacityType, NodePool, Requirement};
use crate::error::CapacityErrorKind;
use crate::state::Resources;
use crate::Result;

/// One purchasable combination advertised by the adapter
#[derive(Clone, Debug, PartialEq)]
pub struct Offering {
    /// Topology zone the offering is sold in
    pub zone: String,
    /// On-demand or spot
    pub capacity_type: CapacityType,
    /// Current price per hour in account currency
    pub price: f64,
    /// Whether the adapter currently believes capacity exists
    pub available: bool,
}

/// An instance type in the adapter's catalog
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceType {
    /// Catalog name, e.g. "m5.large"
    pub name: String,
    /// Label requirements the type satisfies (arch, family, size, ...)
    pub requirements: Vec<Requirement>,
    /// Purchasable zone/capacity-type combinations
    pub offerings: Vec<Offering>,
    /// Allocatable capacity a node of this type reports
    pub capacity: Resources,
}

impl InstanceType {
    /// The offering for a specific zone and capacity type, if sold there
    pub fn offering(&self, zone: &str, capacity_type: CapacityType) -> Option<&Offering> {
        self.offerings
            .iter()
            .find(|o| o.zone == zone && o.capacity_type == capacity_type)
    }

    /// Cheapest available offering across all zones and capacity types
    pub fn cheapest_available(&self) -> Option<&Offering> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }
}

/// Launch request handed to the adapter
///
/// Carries every instance type the scheduler found workable so the adapter
/// can pick whichever has capacity, capped at the configured maximum.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRequest {
    /// Owning pool; its label and template hash are stamped on the node
    pub pool_name: String,
    /// Template hash to stamp, for later drift comparison
    pub pool_hash: String,
    /// Acceptable instance type names, cheapest first
    pub instance_types: Vec<String>,
    /// Acceptable capacity types
    pub capacity_types: Vec<CapacityType>,
    /// Label requirements the launched node must satisfy
    pub requirements: Vec<Requirement>,
}

/// A launched instance as reported by the adapter
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    /// Provider-assigned instance id
    pub id: String,
    /// Labels the node will register with
    pub labels: BTreeMap<String, String>,
    /// Offering price at launch
    pub price: f64,
    /// Launch time
    pub launch_time: DateTime<Utc>,
}

/// A live instance listed for garbage collection
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceSummary {
    /// Provider-assigned instance id
    pub id: String,
    /// Provider tags, including the owning pool tag
    pub tags: BTreeMap<String, String>,
    /// Launch time
    pub launch_time: DateTime<Utc>,
}

/// Result of a terminate call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Termination was initiated by this call
    Terminated,
    /// The instance was already gone; success for idempotence
    NotFound,
}

/// The engine's view of a cloud
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Instance types launchable for a pool, with current offerings
    async fn instance_types(&self, pool: &NodePool) -> Result<Vec<InstanceType>>;

    /// Launch one instance; idempotent on `request_key`
    async fn create_instance(
        &self,
        request_key: &str,
        request: &InstanceRequest,
    ) -> Result<Instance>;

    /// Terminate an instance; safe to call more than once
    async fn terminate_instance(&self, id: &str) -> Result<TerminateOutcome>;

    /// All live instances tagged for this cluster, for orphan collection
    async fn list_instances(&self, pool: &str) -> Result<Vec<InstanceSummary>>;

    /// Resolve an image selector to a concrete image id
    async fn resolve_image(&self, selector: &str) -> Result<String>;
}

/// Cache of offerings that recently failed to launch
///
/// A capacity error means the offering is exhausted; retrying the same
/// launch within the TTL wastes the tick. Explicit lifecycle: construct at
/// startup, `flush` in tests or on config reload.
pub struct UnavailableOfferings {
    ttl: Duration,
    entries: RwLock<BTreeMap<(String, String, CapacityType), Instant>>,
}

/// Default time a failed offering stays blocked
pub const OFFERING_BLOCK_TTL: Duration = Duration::from_secs(180);

impl UnavailableOfferings {
    /// Create an empty cache with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record a capacity failure for an offering
    pub fn mark(
        &self,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
        kind: CapacityErrorKind,
    ) {
        tracing::debug!(
            instance_type,
            zone,
            %capacity_type,
            kind = %kind,
            "marking offering unavailable"
        );
        self.entries.write().insert(
            (instance_type.to_string(), zone.to_string(), capacity_type),
            Instant::now() + self.ttl,
        );
    }

    /// Whether an offering is currently blocked
    pub fn is_unavailable(
        &self,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
    ) -> bool {
        let key = (instance_type.to_string(), zone.to_string(), capacity_type);
        let expires = self.entries.read().get(&key).copied();
        match expires {
            Some(expires) if expires > Instant::now() => true,
            Some(_) => {
                self.entries.write().remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop every cached failure
    pub fn flush(&self) {
        self.entries.write().clear();
    }
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new(OFFERING_BLOCK_TTL)
    }
}
