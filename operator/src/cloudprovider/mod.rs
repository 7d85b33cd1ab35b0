//! The single seam to vendor-specific code: a catalog of instance types and
//! the calls that create, list, and delete instances backing them.

use crate::requirements::Requirements;
use crate::resources::{self, MilliResources};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use stratus_common::labels;
use stratus_types::{NodeClaim, NodePool};

pub mod fake;

#[derive(Debug, thiserror::Error)]
pub enum CloudProviderError {
    #[error("insufficient capacity for {instance_type} in {zone} ({capacity_type})")]
    InsufficientCapacity {
        instance_type: String,
        zone: String,
        capacity_type: String,
    },

    #[error("invalid node claim: {0}")]
    Invalid(String),

    #[error("transient cloud failure: {0}")]
    Retryable(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// A (zone, capacity-type) placement option for an instance type.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub zone: String,
    pub capacity_type: String,
    pub price: f64,
    pub available: bool,
}

impl Offering {
    /// Single-valued requirements used by the topology engine to resolve
    /// zone and capacity-type once a node commits to this offering.
    pub fn requirements(&self) -> Requirements {
        use crate::requirements::Requirement;
        [
            Requirement::new_in(labels::TOPOLOGY_ZONE, [self.zone.clone()]),
            Requirement::new_in(labels::CAPACITY_TYPE, [self.capacity_type.clone()]),
        ]
        .into_iter()
        .collect()
    }

    /// True iff this offering's zone and capacity-type satisfy the node's
    /// requirements.
    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        requirements.get(labels::TOPOLOGY_ZONE).has(&self.zone)
            && requirements
                .get(labels::CAPACITY_TYPE)
                .has(&self.capacity_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overhead {
    pub system_reserved: MilliResources,
    pub kube_reserved: MilliResources,
    pub eviction_threshold: MilliResources,
}

impl Overhead {
    pub fn total(&self) -> MilliResources {
        let mut out = self.system_reserved.clone();
        resources::add_assign(&mut out, &self.kube_reserved);
        resources::add_assign(&mut out, &self.eviction_threshold);
        out
    }
}

#[derive(Debug, Clone)]
pub struct InstanceType {
    pub name: String,
    pub requirements: Requirements,
    pub offerings: Vec<Offering>,
    pub capacity: MilliResources,
    pub overhead: Overhead,
}

impl InstanceType {
    pub fn allocatable(&self) -> MilliResources {
        resources::clamp_non_negative(&resources::subtract(&self.capacity, &self.overhead.total()))
    }

    /// Offerings that are available and satisfy the node's requirements,
    /// skipping any the unavailability cache has embargoed.
    pub fn viable_offerings(
        &self,
        requirements: &Requirements,
        unavailable: &UnavailableOfferings,
    ) -> Vec<&Offering> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .filter(|o| !unavailable.contains(&self.name, &o.zone, &o.capacity_type))
            .filter(|o| o.satisfies(requirements))
            .collect()
    }

    pub fn cheapest_price(
        &self,
        requirements: &Requirements,
        unavailable: &UnavailableOfferings,
    ) -> Option<f64> {
        self.viable_offerings(requirements, unavailable)
            .iter()
            .map(|o| o.price)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Offerings the cloud recently reported as out of capacity. Entries expire
/// after a cooldown so later rounds retry them.
pub struct UnavailableOfferings {
    ttl: Duration,
    inner: RwLock<HashMap<(String, String, String), Instant>>,
}

impl UnavailableOfferings {
    pub fn new(ttl: Duration) -> Self {
        UnavailableOfferings {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn mark(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.inner.write().unwrap().insert(
            (
                instance_type.to_string(),
                zone.to_string(),
                capacity_type.to_string(),
            ),
            Instant::now() + self.ttl,
        );
    }

    pub fn contains(&self, instance_type: &str, zone: &str, capacity_type: &str) -> bool {
        let key = (
            instance_type.to_string(),
            zone.to_string(),
            capacity_type.to_string(),
        );
        let inner = self.inner.read().unwrap();
        inner.get(&key).is_some_and(|expiry| *expiry > Instant::now())
    }
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        // Cooldown before an out-of-capacity offering is retried.
        Self::new(Duration::from_secs(180))
    }
}

/// An instance the cloud created for a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub provider_id: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: MilliResources,
    pub allocatable: MilliResources,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Creates an instance satisfying the claim. The claim carries the full
    /// candidate instance-type list so the provider may substitute when the
    /// head choice is unavailable.
    async fn create(&self, claim: &NodeClaim) -> Result<Machine, CloudProviderError>;

    async fn delete(&self, provider_id: &str) -> Result<(), CloudProviderError>;

    /// Instances owned by this controller.
    async fn list(&self) -> Result<Vec<Machine>, CloudProviderError>;

    async fn get_instance_types(
        &self,
        pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError>;

    fn name(&self) -> &'static str;

    async fn liveness_probe(&self) -> Result<(), CloudProviderError>;
}
