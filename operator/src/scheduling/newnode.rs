use super::hostports::{self, HostPortUsage};
use super::taints;
use super::volumes::{VolumeCatalog, VolumeUsage};
use super::SchedulingError;
use crate::cloudprovider::{InstanceType, Offering, UnavailableOfferings};
use crate::requirements::{Requirement, Requirements};
use crate::resources::{self, MilliResources};
use crate::topology::Topology;
use k8s_openapi::api::core::v1::{Pod, Taint};
use kube::ResourceExt;
use std::collections::BTreeMap;
use stratus_common::labels;
use stratus_types::{NodeClassReference, NodePool};

/// The finished intent for one new node: everything the lifecycle controller
/// needs to create a NodeClaim. Deterministic for a given batch, which makes
/// repeated rounds over unchanged input byte-identical.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeClaimIntent {
    pub pool_name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub requirements: Requirements,
    pub requests: MilliResources,
    /// Candidate instance types, cheapest viable offering first. The cloud
    /// provider may substitute within this list.
    pub instance_types: Vec<String>,
    pub offering: Offering,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub node_class_ref: NodeClassReference,
    pub pod_keys: Vec<String>,
}

/// A simulated node under construction during a round. The instance-type
/// candidate set narrows as pods land; a pod that would empty it rolls back.
pub struct NewNode {
    pub pool_name: String,
    pub requirements: Requirements,
    pub instance_types: Vec<InstanceType>,
    pub requests: MilliResources,
    pub pod_keys: Vec<String>,
    taints: Vec<Taint>,
    startup_taints: Vec<Taint>,
    template_labels: BTreeMap<String, String>,
    template_annotations: BTreeMap<String, String>,
    node_class_ref: NodeClassReference,
    host_ports: HostPortUsage,
    volumes: VolumeUsage,
    hostname: String,
}

fn instance_type_admits(
    it: &InstanceType,
    requirements: &Requirements,
    requests: &MilliResources,
    unavailable: &UnavailableOfferings,
) -> bool {
    for (key, requirement) in it.requirements.iter() {
        if requirements.has_key(key)
            && requirement.intersect(&requirements.get(key)).is_empty()
        {
            return false;
        }
    }
    resources::fits(requests, &it.allocatable())
        && !it.viable_offerings(requirements, unavailable).is_empty()
}

impl NewNode {
    /// Seeds a fresh simulated node from a pool template. `daemonset_requests`
    /// reserves room for the daemonset pods that will bind to the node the
    /// moment it registers.
    pub fn from_pool(
        pool: &NodePool,
        instance_types: Vec<InstanceType>,
        hostname: String,
        daemonset_requests: MilliResources,
    ) -> Result<Self, SchedulingError> {
        let template = &pool.spec.template;
        let pool_name = pool.name_any();
        let mut requirements = Requirements::from_labels(&template.labels);
        requirements = requirements.intersect(
            &Requirements::try_from_node_selector_requirements(&template.requirements)?,
        )?;
        requirements.add(Requirement::new_in(labels::NODE_POOL, [pool_name.clone()]));
        requirements.add(Requirement::new_in(labels::HOSTNAME, [hostname.clone()]));
        Ok(NewNode {
            pool_name,
            requirements,
            instance_types,
            requests: daemonset_requests,
            pod_keys: Vec::new(),
            taints: template.taints.clone(),
            startup_taints: template.startup_taints.clone(),
            template_labels: template.labels.clone(),
            template_annotations: template.annotations.clone(),
            node_class_ref: template.node_class_ref.clone(),
            host_ports: HostPortUsage::new(),
            volumes: VolumeUsage::new(BTreeMap::new()),
            hostname,
        })
    }

    pub fn try_add(
        &mut self,
        pod: &Pod,
        pod_requirements: &Requirements,
        topology: &mut Topology,
        catalog: &VolumeCatalog,
        unavailable: &UnavailableOfferings,
    ) -> Result<(), SchedulingError> {
        // Pool taints must be tolerated; startup taints are removed before
        // ordinary workloads run and never count here.
        if let Some(taint) = taints::untolerated(pod, &self.taints, &[]) {
            return Err(SchedulingError::UntoleratedTaint {
                key: taint.key.clone(),
                effect: taint.effect.clone(),
            });
        }

        let wanted_ports = hostports::host_ports(pod);
        if let Some(conflict) = self.host_ports.conflict(&wanted_ports) {
            return Err(SchedulingError::HostPortConflict(conflict.port));
        }

        let pod_volumes = catalog.pod_volumes(pod)?;
        if let Some(driver) = self.volumes.exceeded_by(&pod_volumes) {
            return Err(SchedulingError::VolumeLimit(driver));
        }

        self.requirements.compatible(pod_requirements)?;
        let merged = self.requirements.intersect(pod_requirements)?;
        let augmented = topology.add_requirements(pod, &merged);
        let merged = merged.intersect(&augmented)?;

        let mut requests = self.requests.clone();
        resources::add_assign(&mut requests, &resources::pod_requests(pod));

        // Lazy candidate filtering: the set only ever narrows. Emptying it
        // means the pod does not fit here; roll back by not committing.
        let remaining: Vec<InstanceType> = self
            .instance_types
            .iter()
            .filter(|it| instance_type_admits(it, &merged, &requests, unavailable))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return Err(SchedulingError::NoInstanceTypeFits);
        }

        self.requirements = merged;
        self.instance_types = remaining;
        self.requests = requests;
        self.host_ports.add(wanted_ports);
        self.volumes.add(pod_volumes);
        self.pod_keys.push(format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        ));
        topology.record(pod, &self.requirements);
        Ok(())
    }

    /// Estimated capacity this node will consume against pool limits: the
    /// first surviving candidate's capacity.
    pub fn estimated_capacity(&self) -> MilliResources {
        self.instance_types
            .first()
            .map(|it| it.capacity.clone())
            .unwrap_or_default()
    }

    /// Commits the node: picks the cheapest available offering across the
    /// surviving candidates (ties by zone, then capacity-type), orders the
    /// candidate list by price, and strips the placeholder hostname so
    /// downstream consumers never see it.
    pub fn finalize(&self, unavailable: &UnavailableOfferings) -> Option<NodeClaimIntent> {
        let mut requirements = self.requirements.clone();
        requirements.remove(labels::HOSTNAME);

        let mut best: Option<(&InstanceType, &Offering)> = None;
        for it in &self.instance_types {
            for offering in it.viable_offerings(&requirements, unavailable) {
                let better = match best {
                    None => true,
                    Some((_, current)) => {
                        offering
                            .price
                            .total_cmp(&current.price)
                            .then_with(|| offering.zone.cmp(&current.zone))
                            .then_with(|| offering.capacity_type.cmp(&current.capacity_type))
                            .is_lt()
                    }
                };
                if better {
                    best = Some((it, offering));
                }
            }
        }
        let (_, offering) = best?;

        let mut candidates: Vec<&InstanceType> = self
            .instance_types
            .iter()
            .filter(|it| !it.viable_offerings(&requirements, unavailable).is_empty())
            .collect();
        candidates.sort_by(|a, b| {
            let pa = a.cheapest_price(&requirements, unavailable).unwrap_or(f64::MAX);
            let pb = b.cheapest_price(&requirements, unavailable).unwrap_or(f64::MAX);
            pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
        });

        let mut node_labels = self.template_labels.clone();
        node_labels.extend(requirements.labels());
        Some(NodeClaimIntent {
            pool_name: self.pool_name.clone(),
            labels: node_labels,
            annotations: self.template_annotations.clone(),
            requirements,
            requests: self.requests.clone(),
            instance_types: candidates.into_iter().map(|it| it.name.clone()).collect(),
            offering: offering.clone(),
            taints: self.taints.clone(),
            startup_taints: self.startup_taints.clone(),
            node_class_ref: self.node_class_ref.clone(),
            pod_keys: self.pod_keys.clone(),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}
