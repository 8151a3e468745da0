//! In-memory cloud provider for tests
//!
//! Behaves like a small region: a fixed catalog, instances created and
//! terminated in a map, idempotent create keyed by the caller's request key,
//! and injectable launch failures for exercising the revert paths.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::crd::NodePool;
#[cfg(test)]
use crate::crd::CapacityType;
use crate::error::CapacityErrorKind;
use crate::{Error, Result};

use super::{
    CloudProvider, Instance, InstanceRequest, InstanceSummary, InstanceType, TerminateOutcome,
};

/// Which error the next `create_instance` call should fail with
#[derive(Clone, Copy, Debug)]
pub enum LaunchFailure {
    /// A retryable cloud hiccup
    Transient,
    /// Capacity exhausted for the requested offering
    Capacity(CapacityErrorKind),
}

#[derive(Default)]
struct FakeState {
    catalog: Vec<InstanceType>,
    created: BTreeMap<String, Instance>,
    live: BTreeMap<String, InstanceSummary>,
    terminated: Vec<String>,
    images: BTreeMap<String, String>,
    next_launch_failure: Option<LaunchFailure>,
    counter: u64,
}

/// A fake region backing the engine's test suites
#[derive(Default)]
pub struct FakeCloudProvider {
    state: Mutex<FakeState>,
}

impl FakeCloudProvider {
    /// Empty provider with no catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance-type catalog
    pub fn set_catalog(&self, catalog: Vec<InstanceType>) {
        self.state.lock().catalog = catalog;
    }

    /// Map an image selector to a resolved image id
    pub fn set_image(&self, selector: &str, image_id: &str) {
        self.state
            .lock()
            .images
            .insert(selector.to_string(), image_id.to_string());
    }

    /// Fail the next create call with the given error
    pub fn fail_next_launch(&self, failure: LaunchFailure) {
        self.state.lock().next_launch_failure = Some(failure);
    }

    /// Register a pre-existing live instance (e.g. an orphan for GC tests)
    pub fn add_live_instance(&self, id: &str, pool: &str) {
        let mut state = self.state.lock();
        state.live.insert(
            id.to_string(),
            InstanceSummary {
                id: id.to_string(),
                tags: BTreeMap::from([(crate::NODEPOOL_LABEL.to_string(), pool.to_string())]),
                launch_time: Utc::now(),
            },
        );
    }

    /// Ids passed to terminate so far, in call order
    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().terminated.clone()
    }

    /// Number of successful create calls
    pub fn created_count(&self) -> usize {
        self.state.lock().created.len()
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn instance_types(&self, _pool: &NodePool) -> Result<Vec<InstanceType>> {
        Ok(self.state.lock().catalog.clone())
    }

    async fn create_instance(
        &self,
        request_key: &str,
        request: &InstanceRequest,
    ) -> Result<Instance> {
        let mut state = self.state.lock();

        if let Some(failure) = state.next_launch_failure.take() {
            return Err(match failure {
                LaunchFailure::Transient => Error::transient("fake: simulated throttle"),
                LaunchFailure::Capacity(kind) => {
                    Error::capacity(kind, "fake: offering exhausted")
                }
            });
        }

        // replaying a request key returns the original launch
        if let Some(existing) = state.created.get(request_key) {
            return Ok(existing.clone());
        }

        let chosen = request
            .instance_types
            .iter()
            .find_map(|name| state.catalog.iter().find(|it| &it.name == name))
            .ok_or_else(|| {
                Error::capacity(
                    CapacityErrorKind::Unsupported,
                    format!("no requested instance type in catalog: {:?}", request.instance_types),
                )
            })?;

        let offering = chosen
            .offerings
            .iter()
            .filter(|o| o.available && request.capacity_types.contains(&o.capacity_type))
            .min_by(|a, b| a.price.total_cmp(&b.price))
            .ok_or_else(|| {
                Error::capacity(
                    CapacityErrorKind::InsufficientCapacity,
                    format!("no available offering for {}", chosen.name),
                )
            })?;

        let chosen_name = chosen.name.clone();
        let offering_zone = offering.zone.clone();
        let offering_capacity_type = offering.capacity_type;
        let offering_price = offering.price;

        state.counter += 1;
        let id = format!("i-{:08x}", state.counter);
        let instance = Instance {
            id: id.clone(),
            labels: BTreeMap::from([
                (crate::NODEPOOL_LABEL.to_string(), request.pool_name.clone()),
                (crate::INSTANCE_TYPE_LABEL.to_string(), chosen_name),
                (crate::ZONE_LABEL.to_string(), offering_zone),
                (
                    crate::CAPACITY_TYPE_LABEL.to_string(),
                    offering_capacity_type.to_string(),
                ),
            ]),
            price: offering_price,
            launch_time: Utc::now(),
        };
        state.live.insert(
            id.clone(),
            InstanceSummary {
                id: id.clone(),
                tags: BTreeMap::from([(
                    crate::NODEPOOL_LABEL.to_string(),
                    request.pool_name.clone(),
                )]),
                launch_time: instance.launch_time,
            },
        );
        state
            .created
            .insert(request_key.to_string(), instance.clone());
        Ok(instance)
    }

    async fn terminate_instance(&self, id: &str) -> Result<TerminateOutcome> {
        let mut state = self.state.lock();
        state.terminated.push(id.to_string());
        if state.live.remove(id).is_some() {
            Ok(TerminateOutcome::Terminated)
        } else {
            Ok(TerminateOutcome::NotFound)
        }
    }

    async fn list_instances(&self, pool: &str) -> Result<Vec<InstanceSummary>> {
        Ok(self
            .state
            .lock()
            .live
            .values()
            .filter(|i| i.tags.get(crate::NODEPOOL_LABEL).map(String::as_str) == Some(pool))
            .cloned()
            .collect())
    }

    async fn resolve_image(&self, selector: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .images
            .get(selector)
            .cloned()
            .unwrap_or_else(|| "ami-0default".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Offering;
    use crate::state::Resources;

    fn catalog() -> Vec<InstanceType> {
        vec![InstanceType {
            name: "m5.large".into(),
            requirements: vec![],
            offerings: vec![Offering {
                zone: "us-east-1a".into(),
                capacity_type: CapacityType::OnDemand,
                price: 0.096,
                available: true,
            }],
            capacity: Resources::from_pairs([("cpu", "2"), ("memory", "8Gi")]).unwrap(),
        }]
    }

    fn request() -> InstanceRequest {
        InstanceRequest {
            pool_name: "default".into(),
            pool_hash: "hash-v1".into(),
            instance_types: vec!["m5.large".into()],
            capacity_types: vec![CapacityType::OnDemand],
            requirements: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_request_key() {
        let provider = FakeCloudProvider::new();
        provider.set_catalog(catalog());

        let first = provider.create_instance("key-1", &request()).await.unwrap();
        let replay = provider.create_instance("key-1", &request()).await.unwrap();
        assert_eq!(first.id, replay.id);
        assert_eq!(provider.created_count(), 1);

        let second = provider.create_instance("key-2", &request()).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_terminate_twice_sees_not_found() {
        let provider = FakeCloudProvider::new();
        provider.set_catalog(catalog());

        let inst = provider.create_instance("key-1", &request()).await.unwrap();
        assert_eq!(
            provider.terminate_instance(&inst.id).await.unwrap(),
            TerminateOutcome::Terminated
        );
        assert_eq!(
            provider.terminate_instance(&inst.id).await.unwrap(),
            TerminateOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_injected_capacity_failure() {
        let provider = FakeCloudProvider::new();
        provider.set_catalog(catalog());
        provider.fail_next_launch(LaunchFailure::Capacity(
            CapacityErrorKind::InsufficientCapacity,
        ));

        let err = provider.create_instance("key-1", &request()).await.unwrap_err();
        assert!(matches!(err, Error::Capacity { .. }));

        // failure is one-shot
        assert!(provider.create_instance("key-1", &request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_pool() {
        let provider = FakeCloudProvider::new();
        provider.add_live_instance("i-orphan", "default");
        provider.add_live_instance("i-other", "gpu");

        let listed = provider.list_instances("default").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "i-orphan");
    }
}
