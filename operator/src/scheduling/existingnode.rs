use super::hostports::{self, HostPortUsage};
use super::taints;
use super::volumes::{VolumeCatalog, VolumeUsage};
use super::SchedulingError;
use crate::requirements::Requirements;
use crate::resources::{self, MilliResources};
use crate::state::StateNode;
use crate::topology::Topology;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// One node from the mirror snapshot (real or in-flight) as the scheduler
/// simulates pods onto it. Mutations happen only after every acceptance
/// check passes, so a rejected pod leaves no trace.
pub struct ExistingNode {
    pub state: StateNode,
    pub requirements: Requirements,
    available: MilliResources,
    host_ports: HostPortUsage,
    volumes: VolumeUsage,
    pub pod_keys: Vec<String>,
}

impl ExistingNode {
    pub fn new(state: StateNode, catalog: &VolumeCatalog) -> Self {
        let requirements = Requirements::from_labels(&state.labels());
        let available = state.available();
        let mut host_ports = HostPortUsage::new();
        host_ports.add(state.host_ports_in_use());
        let mut volumes = VolumeUsage::new(catalog.limits_for_node(&state.name));
        volumes.add(
            state
                .volumes_in_use()
                .into_iter()
                .filter_map(|id| catalog.driver_for_claim(&id).map(|driver| (driver, id))),
        );
        ExistingNode {
            state,
            requirements,
            available,
            host_ports,
            volumes,
            pod_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn try_add(
        &mut self,
        pod: &Pod,
        pod_requirements: &Requirements,
        topology: &mut Topology,
        catalog: &VolumeCatalog,
    ) -> Result<(), SchedulingError> {
        // Startup taints are discounted only while the node is in-flight.
        let node_taints = self.state.taints();
        let skip = if self.state.initialized() {
            Vec::new()
        } else {
            self.state.startup_taints()
        };
        if let Some(taint) = taints::untolerated(pod, &node_taints, &skip) {
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

        let requests = resources::pod_requests(pod);
        if !resources::fits(&requests, &self.available) {
            return Err(SchedulingError::InsufficientResources);
        }

        self.requirements.compatible(pod_requirements)?;
        let merged = self.requirements.intersect(pod_requirements)?;
        let augmented = topology.add_requirements(pod, &merged);
        let merged = merged.intersect(&augmented)?;

        // Accepted: advance the simulation.
        self.available = resources::subtract(&self.available, &requests);
        self.host_ports.add(wanted_ports);
        self.volumes.add(pod_volumes);
        self.requirements = merged;
        self.pod_keys.push(format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        ));
        topology.record(pod, &self.requirements);
        Ok(())
    }
}
