//! The batch scheduler: a first-fit-decreasing bin-packer that simulates
//! placing pending pods onto existing nodes, in-flight nodes, and synthetic
//! new nodes, selecting instance types and offerings by price.
//!
//! A round is single-threaded over a prefetched snapshot; nothing here
//! touches the cluster. The provisioner commits the resulting intents.

pub mod hostports;
pub mod preferences;
pub mod queue;
pub mod taints;
pub mod volumes;

mod existingnode;
mod newnode;

pub use existingnode::ExistingNode;
pub use newnode::{NewNode, NodeClaimIntent};

use crate::cloudprovider::{InstanceType, UnavailableOfferings};
use crate::requirements::{IncompatibleRequirement, RequirementParseError};
use crate::resources::{self, MilliResources};
use crate::state::Snapshot;
use crate::topology::Topology;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use stratus_common::labels;
use stratus_types::NodePool;
use volumes::{VolumeCatalog, VolumeError};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum SchedulingError {
    #[error(transparent)]
    Incompatible(#[from] IncompatibleRequirement),

    #[error("pod does not tolerate taint {key}:{effect}")]
    UntoleratedTaint { key: String, effect: String },

    #[error("host port {0} already in use")]
    HostPortConflict(i32),

    #[error("volume count limit reached for driver {0}")]
    VolumeLimit(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("insufficient resources remaining")]
    InsufficientResources,

    #[error("no instance type satisfies the pod")]
    NoInstanceTypeFits,

    #[error("no node pool accepts the pod")]
    NoPoolAccepts,

    #[error(transparent)]
    InvalidRequirement(#[from] RequirementParseError),
}

/// The outcome of one round: informational assignments to existing nodes
/// (the cluster scheduler does the actual binding), NodeClaim intents to
/// commit, and pods nothing could place.
pub struct Results {
    pub existing: Vec<(String, Vec<String>)>,
    pub new_nodes: Vec<NodeClaimIntent>,
    pub unschedulable: Vec<(Pod, SchedulingError)>,
}

pub struct Scheduler {
    existing: Vec<ExistingNode>,
    new_nodes: Vec<NewNode>,
    topology: Topology,
    pools: Vec<(NodePool, Vec<InstanceType>)>,
    catalog: VolumeCatalog,
    unavailable: Arc<UnavailableOfferings>,
    snapshot: Snapshot,
    hostname_counter: u64,
}

/// Domains each pool could place a node into, keyed by topology key: the
/// pool's own In-requirements plus every offering's zone and capacity type,
/// plus values already present on cluster nodes.
fn cluster_domains(
    snapshot: &Snapshot,
    pools: &[(NodePool, Vec<InstanceType>)],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut domains: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (pool, instance_types) in pools {
        for selector in &pool.spec.template.requirements {
            if selector.operator == "In" {
                domains
                    .entry(selector.key.clone())
                    .or_default()
                    .extend(selector.values.iter().flatten().cloned());
            }
        }
        for (key, value) in &pool.spec.template.labels {
            domains.entry(key.clone()).or_default().insert(value.clone());
        }
        for it in instance_types {
            for offering in &it.offerings {
                domains
                    .entry(labels::TOPOLOGY_ZONE.to_string())
                    .or_default()
                    .insert(offering.zone.clone());
                domains
                    .entry(labels::CAPACITY_TYPE.to_string())
                    .or_default()
                    .insert(offering.capacity_type.clone());
            }
        }
    }
    for node in &snapshot.nodes {
        for (key, value) in node.labels() {
            domains.entry(key).or_default().insert(value);
        }
    }
    domains
}

impl Scheduler {
    pub fn new(
        snapshot: Snapshot,
        mut pools: Vec<(NodePool, Vec<InstanceType>)>,
        batch: &[Pod],
        catalog: VolumeCatalog,
        unavailable: Arc<UnavailableOfferings>,
        namespaces: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        // Highest weight first; names break ties.
        pools.sort_by(|(a, _), (b, _)| {
            b.spec
                .weight
                .cmp(&a.spec.weight)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        });
        let topology = Topology::build(
            &snapshot,
            batch,
            cluster_domains(&snapshot, &pools),
            namespaces,
        );
        let existing = snapshot
            .nodes
            .iter()
            .filter(|n| !n.marked_for_deletion())
            // An in-flight claim is a target only once launch stamped its
            // capacity; before that there is nothing to pack against.
            .filter(|n| !n.allocatable().is_empty())
            .map(|n| ExistingNode::new(n.clone(), &catalog))
            .collect();
        Scheduler {
            existing,
            new_nodes: Vec::new(),
            topology,
            pools,
            catalog,
            unavailable,
            snapshot,
            hostname_counter: 0,
        }
    }

    /// Runs the batch to completion: repeated passes place pods until no
    /// progress is made, then preferences relax one step and the remainder
    /// retries. Pods carrying required pod-affinity get their dependency
    /// passes this way: a pass that places their target unblocks them in
    /// the next.
    pub fn solve(mut self, mut pods: Vec<Pod>) -> Results {
        queue::sort_pods(&mut pods);
        let mut errors: BTreeMap<String, SchedulingError> = BTreeMap::new();
        let mut pending = pods;
        loop {
            let mut failed: Vec<Pod> = Vec::new();
            let mut progress = false;
            for pod in pending {
                match self.add(&pod) {
                    Ok(()) => progress = true,
                    Err(err) => {
                        errors.insert(pod_key(&pod), err);
                        failed.push(pod);
                    }
                }
            }
            if failed.is_empty() {
                pending = failed;
                break;
            }
            if !progress {
                let mut relaxed = false;
                for pod in &mut failed {
                    relaxed |= preferences::relax(pod);
                }
                if !relaxed {
                    pending = failed;
                    break;
                }
            }
            pending = failed;
        }

        let mut unschedulable: Vec<(Pod, SchedulingError)> = pending
            .into_iter()
            .map(|pod| {
                let err = errors
                    .remove(&pod_key(&pod))
                    .unwrap_or(SchedulingError::NoPoolAccepts);
                (pod, err)
            })
            .collect();

        let mut new_nodes = Vec::new();
        for node in &self.new_nodes {
            match node.finalize(&self.unavailable) {
                Some(intent) => new_nodes.push(intent),
                // Offerings vanished between filtering and finalization;
                // surface the node's pods as unschedulable this round.
                None => {
                    for key in &node.pod_keys {
                        unschedulable.push((
                            Pod {
                                metadata: kube::api::ObjectMeta {
                                    name: Some(key.clone()),
                                    ..Default::default()
                                },
                                ..Default::default()
                            },
                            SchedulingError::NoInstanceTypeFits,
                        ));
                    }
                }
            }
        }

        Results {
            existing: self
                .existing
                .iter()
                .filter(|n| !n.pod_keys.is_empty())
                .map(|n| (n.name().to_string(), n.pod_keys.clone()))
                .collect(),
            new_nodes,
            unschedulable,
        }
    }

    fn add(&mut self, pod: &Pod) -> Result<(), SchedulingError> {
        // Volume resolution failures are pod-level and final for the round.
        self.catalog.pod_volumes(pod)?;
        let pod_requirements = preferences::pod_requirements(pod)?;

        let mut last_error: Option<SchedulingError> = None;

        for node in &mut self.existing {
            match node.try_add(pod, &pod_requirements, &mut self.topology, &self.catalog) {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }

        for node in &mut self.new_nodes {
            match node.try_add(
                pod,
                &pod_requirements,
                &mut self.topology,
                &self.catalog,
                &self.unavailable,
            ) {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }

        for i in 0..self.pools.len() {
            let (pool, instance_types) = self.pools[i].clone();
            if !self.pool_within_limits(&pool) {
                continue;
            }
            self.hostname_counter += 1;
            let hostname = format!("hostname-placeholder-{:04}", self.hostname_counter);
            let daemonset_requests = self
                .snapshot
                .daemonset_spec_for(&pool.spec.template.labels);
            let mut node =
                match NewNode::from_pool(&pool, instance_types, hostname.clone(), daemonset_requests)
                {
                    Ok(node) => node,
                    Err(err) => {
                        last_error = Some(err);
                        continue;
                    }
                };
            self.topology.register(labels::HOSTNAME, &hostname);
            match node.try_add(
                pod,
                &pod_requirements,
                &mut self.topology,
                &self.catalog,
                &self.unavailable,
            ) {
                Ok(()) => {
                    self.new_nodes.push(node);
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or(SchedulingError::NoPoolAccepts))
    }

    /// Capacity already committed against the pool: existing nodes labeled
    /// with it plus this round's proposed nodes.
    fn pool_usage(&self, pool_name: &str) -> MilliResources {
        let mut usage = MilliResources::new();
        for node in &self.snapshot.nodes {
            if node.labels().get(labels::NODE_POOL).map(String::as_str) == Some(pool_name) {
                resources::add_assign(&mut usage, &node.capacity());
            }
        }
        for node in &self.new_nodes {
            if node.pool_name == pool_name {
                resources::add_assign(&mut usage, &node.estimated_capacity());
            }
        }
        usage
    }

    fn pool_within_limits(&self, pool: &NodePool) -> bool {
        if pool.spec.limits.is_empty() {
            return true;
        }
        let limits = resources::from_quantity_map(&pool.spec.limits);
        let usage = self.pool_usage(&pool.name_any());
        limits
            .iter()
            .all(|(key, limit)| usage.get(key).copied().unwrap_or(0) < *limit)
    }
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}
