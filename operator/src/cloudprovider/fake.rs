//! The in-tree cloud provider: a configurable instance catalog with recorded
//! create calls and injectable capacity failures. Used for local development
//! and by the scheduler tests. Real providers implement [`CloudProvider`]
//! out of tree.

use super::{
    CloudProvider, CloudProviderError, InstanceType, Machine, Offering, Overhead,
};
use crate::requirements::{Requirement, Requirements};
use crate::resources::{self, MilliResources};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use stratus_common::{CAPACITY_TYPE_ON_DEMAND, CAPACITY_TYPE_SPOT, labels};
use stratus_types::{NodeClaim, NodePool};

pub fn offering(zone: &str, capacity_type: &str, price: f64) -> Offering {
    Offering {
        zone: zone.to_string(),
        capacity_type: capacity_type.to_string(),
        price,
        available: true,
    }
}

/// Builds an instance type whose requirements are derived from its name,
/// architecture, and offerings, the way a real provider's catalog would.
pub fn instance_type(
    name: &str,
    arch: &str,
    cpu_milli: i64,
    memory_milli: i64,
    offerings: Vec<Offering>,
) -> InstanceType {
    let zones: Vec<String> = offerings.iter().map(|o| o.zone.clone()).collect();
    let capacity_types: Vec<String> = offerings.iter().map(|o| o.capacity_type.clone()).collect();
    let requirements: Requirements = [
        Requirement::new_in(labels::INSTANCE_TYPE, [name.to_string()]),
        Requirement::new_in(labels::ARCH, [arch.to_string()]),
        Requirement::new_in(labels::OS, ["linux".to_string()]),
        Requirement::new_in(labels::TOPOLOGY_ZONE, zones),
        Requirement::new_in(labels::CAPACITY_TYPE, capacity_types),
    ]
    .into_iter()
    .collect();
    InstanceType {
        name: name.to_string(),
        requirements,
        offerings,
        capacity: MilliResources::from([
            (resources::CPU.to_string(), cpu_milli),
            (resources::MEMORY.to_string(), memory_milli),
            (resources::PODS.to_string(), 110_000),
        ]),
        overhead: Overhead {
            kube_reserved: MilliResources::from([
                (resources::CPU.to_string(), 100),
                (resources::MEMORY.to_string(), 128 * 1024 * 1024 * 1000),
            ]),
            ..Default::default()
        },
    }
}

const GIB: i64 = 1024 * 1024 * 1024 * 1000;

pub struct FakeCloudProvider {
    catalog: Vec<InstanceType>,
    machines: Mutex<BTreeMap<String, Machine>>,
    create_calls: AtomicUsize,
    failed_offerings: Mutex<HashSet<(String, String, String)>>,
    counter: AtomicU64,
}

impl Default for FakeCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloudProvider {
    pub fn new() -> Self {
        Self::with_instance_types(Self::default_catalog())
    }

    pub fn with_instance_types(catalog: Vec<InstanceType>) -> Self {
        FakeCloudProvider {
            catalog,
            machines: Mutex::new(BTreeMap::new()),
            create_calls: AtomicUsize::new(0),
            failed_offerings: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn default_catalog() -> Vec<InstanceType> {
        let zones = ["z1", "z2", "z3"];
        let both = |price: f64| {
            zones
                .iter()
                .flat_map(|z| {
                    [
                        offering(z, CAPACITY_TYPE_ON_DEMAND, price),
                        offering(z, CAPACITY_TYPE_SPOT, price / 3.0),
                    ]
                })
                .collect::<Vec<_>>()
        };
        vec![
            instance_type("small", "amd64", 2_000, 2 * GIB, both(0.25)),
            instance_type("default", "amd64", 16_000, 128 * GIB, both(2.0)),
            instance_type("arm", "arm64", 16_000, 128 * GIB, both(1.8)),
            {
                let mut gpu = instance_type("gpu-a", "amd64", 8_000, 64 * GIB, both(6.0));
                gpu.capacity.insert("vendor/gpu".to_string(), 2_000);
                gpu
            },
        ]
    }

    /// Makes every subsequent create against this offering fail with
    /// insufficient capacity.
    pub fn fail_offering(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.failed_offerings.lock().unwrap().insert((
            instance_type.to_string(),
            zone.to_string(),
            capacity_type.to_string(),
        ));
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created_machines(&self) -> Vec<Machine> {
        self.machines.lock().unwrap().values().cloned().collect()
    }

    /// Removes a machine out-of-band, simulating an instance that vanished
    /// without the controller's involvement.
    pub fn forget(&self, provider_id: &str) {
        self.machines.lock().unwrap().remove(provider_id);
    }

    fn pick(
        &self,
        claim: &NodeClaim,
    ) -> Result<(InstanceType, Offering), CloudProviderError> {
        let requirements =
            Requirements::try_from_node_selector_requirements(&claim.spec.requirements)
                .map_err(|e| CloudProviderError::Invalid(e.to_string()))?;
        let failed = self.failed_offerings.lock().unwrap();
        let mut first_rejection = None;
        for name in &claim.spec.instance_types {
            let Some(it) = self.catalog.iter().find(|it| &it.name == name) else {
                continue;
            };
            let mut offerings: Vec<&Offering> = it
                .offerings
                .iter()
                .filter(|o| o.available && o.satisfies(&requirements))
                .collect();
            offerings.sort_by(|a, b| {
                a.price
                    .total_cmp(&b.price)
                    .then_with(|| a.zone.cmp(&b.zone))
                    .then_with(|| a.capacity_type.cmp(&b.capacity_type))
            });
            for o in offerings {
                let key = (it.name.clone(), o.zone.clone(), o.capacity_type.clone());
                if failed.contains(&key) {
                    first_rejection.get_or_insert(key);
                    continue;
                }
                return Ok((it.clone(), o.clone()));
            }
        }
        match first_rejection {
            Some((instance_type, zone, capacity_type)) => {
                Err(CloudProviderError::InsufficientCapacity {
                    instance_type,
                    zone,
                    capacity_type,
                })
            }
            None => Err(CloudProviderError::Invalid(format!(
                "no catalog instance type satisfies claim '{}'",
                claim.metadata.name.as_deref().unwrap_or("")
            ))),
        }
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn create(&self, claim: &NodeClaim) -> Result<Machine, CloudProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let (it, offering) = self.pick(claim)?;
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let provider_id = format!("fake:///{}/i-{:08}", offering.zone, id);
        let mut machine_labels = BTreeMap::from([
            (labels::INSTANCE_TYPE.to_string(), it.name.clone()),
            (labels::TOPOLOGY_ZONE.to_string(), offering.zone.clone()),
            (
                labels::CAPACITY_TYPE.to_string(),
                offering.capacity_type.clone(),
            ),
        ]);
        for key in [labels::ARCH, labels::OS] {
            if let Some(value) = it.requirements.get(key).any() {
                machine_labels.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(pool) = claim
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::NODE_POOL))
        {
            machine_labels.insert(labels::NODE_POOL.to_string(), pool.clone());
        }
        let machine = Machine {
            provider_id: provider_id.clone(),
            labels: machine_labels,
            capacity: it.capacity.clone(),
            allocatable: it.allocatable(),
        };
        self.machines
            .lock()
            .unwrap()
            .insert(provider_id, machine.clone());
        Ok(machine)
    }

    async fn delete(&self, provider_id: &str) -> Result<(), CloudProviderError> {
        match self.machines.lock().unwrap().remove(provider_id) {
            Some(_) => Ok(()),
            None => Err(CloudProviderError::NotFound(provider_id.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<Machine>, CloudProviderError> {
        Ok(self.created_machines())
    }

    async fn get_instance_types(
        &self,
        _pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        Ok(self.catalog.clone())
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    async fn liveness_probe(&self) -> Result<(), CloudProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(instance_types: &[&str], requirements: Requirements) -> NodeClaim {
        let mut claim = NodeClaim::default();
        claim.metadata.name = Some("test-claim".to_string());
        claim.spec.instance_types = instance_types.iter().map(|s| s.to_string()).collect();
        claim.spec.requirements = requirements.to_node_selector_requirements();
        claim
    }

    #[tokio::test]
    async fn creates_the_cheapest_viable_offering() {
        let provider = FakeCloudProvider::new();
        let machine = provider
            .create(&claim(&["small"], Requirements::new()))
            .await
            .unwrap();
        // Spot is priced below on-demand in the default catalog.
        assert_eq!(
            machine.labels[labels::CAPACITY_TYPE],
            CAPACITY_TYPE_SPOT.to_string()
        );
        assert_eq!(machine.labels[labels::INSTANCE_TYPE], "small");
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn substitutes_within_the_candidate_list_on_capacity_failure() {
        let provider = FakeCloudProvider::new();
        for zone in ["z1", "z2", "z3"] {
            for ct in [CAPACITY_TYPE_ON_DEMAND, CAPACITY_TYPE_SPOT] {
                provider.fail_offering("small", zone, ct);
            }
        }
        let machine = provider
            .create(&claim(&["small", "default"], Requirements::new()))
            .await
            .unwrap();
        assert_eq!(machine.labels[labels::INSTANCE_TYPE], "default");
    }

    #[tokio::test]
    async fn surfaces_insufficient_capacity_when_no_candidate_remains() {
        let provider = FakeCloudProvider::new();
        for zone in ["z1", "z2", "z3"] {
            for ct in [CAPACITY_TYPE_ON_DEMAND, CAPACITY_TYPE_SPOT] {
                provider.fail_offering("small", zone, ct);
            }
        }
        let err = provider
            .create(&claim(&["small"], Requirements::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudProviderError::InsufficientCapacity { .. }
        ));
    }

    #[tokio::test]
    async fn delete_is_not_found_after_forget() {
        let provider = FakeCloudProvider::new();
        let machine = provider
            .create(&claim(&["small"], Requirements::new()))
            .await
            .unwrap();
        provider.forget(&machine.provider_id);
        assert!(matches!(
            provider.delete(&machine.provider_id).await,
            Err(CloudProviderError::NotFound(_))
        ));
    }
}
