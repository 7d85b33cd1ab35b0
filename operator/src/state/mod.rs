//! The cluster state mirror: a single-writer view of nodes, their bound
//! pods, and derived capacity caches. Readers take deep-copied snapshots;
//! writes come only from the informer reconcilers in [`informer`].

use crate::requirements::{Requirement, Requirements};
use crate::resources::{self, MilliResources};
use crate::scheduling::hostports::{self, HostPort};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use stratus_common::labels;
use stratus_types::NodeClaim;

pub mod informer;

#[derive(Debug, Clone)]
pub struct PodEntry {
    /// `namespace/name`.
    pub key: String,
    pub uid: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub requests: MilliResources,
    pub daemonset: bool,
    pub host_ports: Vec<HostPort>,
    /// `namespace/claim-name` ids of volumes the pod mounts.
    pub volumes: BTreeSet<String>,
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn is_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
}

fn pod_volume_ids(pod: &Pod) -> BTreeSet<String> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut out = BTreeSet::new();
    for volume in pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_deref())
        .unwrap_or(&[])
    {
        if let Some(pvc) = &volume.persistent_volume_claim {
            out.insert(format!("{}/{}", namespace, pvc.claim_name));
        } else if volume.ephemeral.is_some() {
            out.insert(format!("{}/{}-{}", namespace, pod.name_any(), volume.name));
        }
    }
    out
}

fn pod_entry(pod: &Pod) -> PodEntry {
    PodEntry {
        key: pod_key(pod),
        uid: pod.metadata.uid.clone().unwrap_or_else(|| pod_key(pod)),
        namespace: pod.namespace().unwrap_or_default(),
        labels: pod.labels().clone(),
        requests: resources::pod_requests(pod),
        daemonset: is_daemonset_pod(pod),
        host_ports: hostports::host_ports(pod),
        volumes: pod_volume_ids(pod),
    }
}

/// The mirror's view of one node, real or in-flight. A NodeClaim without a
/// matching Node object is an in-flight node; once the Node registers the
/// two halves merge into one entry.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub name: String,
    pub provider_id: Option<String>,
    pub node: Option<Node>,
    pub claim: Option<NodeClaim>,
    pub pods: BTreeMap<String, PodEntry>,
    /// Total requests of daemonsets whose selector matches this node.
    /// Filled at snapshot time; zero inside the live mirror.
    pub daemonset_spec: MilliResources,
}

impl StateNode {
    fn new(name: String) -> Self {
        StateNode {
            name,
            provider_id: None,
            node: None,
            claim: None,
            pods: BTreeMap::new(),
            daemonset_spec: MilliResources::new(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        if let Some(node) = &self.node {
            return node.labels().clone();
        }
        self.claim
            .as_ref()
            .and_then(|c| c.metadata.labels.clone())
            .unwrap_or_default()
    }

    pub fn taints(&self) -> Vec<Taint> {
        if let Some(node) = &self.node {
            return node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default();
        }
        let Some(claim) = &self.claim else {
            return Vec::new();
        };
        claim
            .spec
            .taints
            .iter()
            .chain(claim.spec.startup_taints.iter())
            .cloned()
            .collect()
    }

    pub fn startup_taints(&self) -> Vec<Taint> {
        self.claim
            .as_ref()
            .map(|c| c.spec.startup_taints.clone())
            .unwrap_or_default()
    }

    /// A node is initialized once it carries the initialized label, its
    /// startup taints are gone, and the kubelet reports a non-zero pod
    /// capacity. A startup taint re-added later makes the node non-in-flight
    /// again from the scheduler's perspective, but conditions stay monotone.
    pub fn initialized(&self) -> bool {
        if self
            .labels()
            .get(labels::INITIALIZED)
            .map(String::as_str)
            != Some("true")
        {
            return false;
        }
        let current = self.taints();
        let startup_gone = self
            .startup_taints()
            .iter()
            .all(|s| !current.iter().any(|t| t.key == s.key && t.effect == s.effect));
        startup_gone && self.capacity().get(resources::PODS).copied().unwrap_or(0) > 0
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.node
            .as_ref()
            .is_some_and(|n| n.metadata.deletion_timestamp.is_some())
            || self
                .claim
                .as_ref()
                .is_some_and(|c| c.metadata.deletion_timestamp.is_some())
    }

    fn claim_resources(&self, capacity: bool) -> MilliResources {
        self.claim
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .map(|s| {
                resources::from_quantity_map(if capacity { &s.capacity } else { &s.allocatable })
            })
            .unwrap_or_default()
    }

    /// Fills in resources the kubelet reported as zero but the instance type
    /// advertises. A freshly-registered node races its first status report;
    /// without this the scheduler would double-provision extended resources.
    fn patch_zeroed(reported: MilliResources, advertised: &MilliResources) -> MilliResources {
        let mut out = reported;
        for (key, value) in advertised {
            if *value > 0 && out.get(key).copied().unwrap_or(0) == 0 {
                out.insert(key.clone(), *value);
            }
        }
        out
    }

    pub fn capacity(&self) -> MilliResources {
        let advertised = self.claim_resources(true);
        match &self.node {
            Some(node) => {
                let reported = node
                    .status
                    .as_ref()
                    .and_then(|s| s.capacity.as_ref())
                    .map(resources::from_quantity_map)
                    .unwrap_or_default();
                Self::patch_zeroed(reported, &advertised)
            }
            None => advertised,
        }
    }

    pub fn allocatable(&self) -> MilliResources {
        let advertised = self.claim_resources(false);
        match &self.node {
            Some(node) => {
                let reported = node
                    .status
                    .as_ref()
                    .and_then(|s| s.allocatable.as_ref())
                    .map(resources::from_quantity_map)
                    .unwrap_or_default();
                Self::patch_zeroed(reported, &advertised)
            }
            None => advertised,
        }
    }

    /// Requests of bound non-daemonset pods.
    pub fn allocated(&self) -> MilliResources {
        let mut out = MilliResources::new();
        for pod in self.pods.values().filter(|p| !p.daemonset) {
            resources::add_assign(&mut out, &pod.requests);
        }
        out
    }

    /// Requests of bound daemonset pods.
    pub fn daemonset_requested(&self) -> MilliResources {
        let mut out = MilliResources::new();
        for pod in self.pods.values().filter(|p| p.daemonset) {
            resources::add_assign(&mut out, &pod.requests);
        }
        out
    }

    /// allocatable − allocated − max(0, daemonset_spec − daemonset_requested):
    /// room is reserved for daemonset pods that have not bound yet, and the
    /// reservation clamps at zero when unexpected daemonset pods bind.
    pub fn available(&self) -> MilliResources {
        let reservation = resources::clamp_non_negative(&resources::subtract(
            &self.daemonset_spec,
            &self.daemonset_requested(),
        ));
        let mut used = self.allocated();
        resources::add_assign(&mut used, &reservation);
        resources::subtract(&self.allocatable(), &used)
    }

    pub fn host_ports_in_use(&self) -> Vec<HostPort> {
        self.pods
            .values()
            .flat_map(|p| p.host_ports.iter().cloned())
            .collect()
    }

    pub fn volumes_in_use(&self) -> BTreeSet<String> {
        self.pods
            .values()
            .flat_map(|p| p.volumes.iter().cloned())
            .collect()
    }

    pub fn has_non_daemonset_pods(&self) -> bool {
        self.pods.values().any(|p| !p.daemonset)
    }

    /// In-flight nodes have a claim but no Node object yet. They are
    /// schedulable targets once launch has stamped capacity onto the claim.
    pub fn in_flight(&self) -> bool {
        self.node.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DaemonSetInfo {
    pub key: String,
    pub requests: MilliResources,
    pub selector: Requirements,
}

fn daemonset_info(ds: &DaemonSet) -> Option<DaemonSetInfo> {
    let key = format!("{}/{}", ds.namespace().unwrap_or_default(), ds.name_any());
    let template = &ds.spec.as_ref()?.template;
    let template_pod = Pod {
        spec: template.spec.clone(),
        ..Default::default()
    };
    let mut selector = Requirements::new();
    if let Some(spec) = template.spec.as_ref() {
        for (k, v) in spec.node_selector.iter().flatten() {
            selector.add(Requirement::new_in(k, [v.clone()]));
        }
        if let Some(term) = spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .and_then(|sel| sel.node_selector_terms.first())
        {
            for expr in term.match_expressions.iter().flatten() {
                if let Ok(requirement) = Requirement::try_from_node_selector(expr) {
                    selector.add(requirement);
                }
            }
        }
    }
    Some(DaemonSetInfo {
        key,
        requests: resources::pod_requests(&template_pod),
        selector,
    })
}

#[derive(Default)]
struct StateInner {
    nodes: BTreeMap<String, StateNode>,
    // pod uid -> owning node entry
    bindings: HashMap<String, String>,
    daemonsets: BTreeMap<String, DaemonSetInfo>,
    // provider id -> node entry
    provider_ids: HashMap<String, String>,
}

/// A deep-copied, internally consistent view for one scheduling round.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: Vec<StateNode>,
    pub daemonsets: Vec<DaemonSetInfo>,
}

impl Snapshot {
    /// Total requests of daemonsets whose selector a label set satisfies.
    pub fn daemonset_spec_for(&self, node_labels: &BTreeMap<String, String>) -> MilliResources {
        let mut out = MilliResources::new();
        for ds in &self.daemonsets {
            if ds.selector.satisfied_by(node_labels) {
                resources::add_assign(&mut out, &ds.requests);
            }
        }
        out
    }
}

#[derive(Clone, Default)]
pub struct ClusterState {
    inner: Arc<RwLock<StateInner>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_key_for(inner: &StateInner, provider_id: Option<&str>, fallback: &str) -> String {
        provider_id
            .and_then(|pid| inner.provider_ids.get(pid).cloned())
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn update_node(&self, node: &Node) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let name = node.name_any();
        let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.clone());

        // An in-flight claim entry with the same provider id merges into the
        // node entry the moment the node registers.
        let old_key = Self::entry_key_for(inner, provider_id.as_deref(), &name);
        let mut entry = if old_key != name {
            let mut moved = inner.nodes.remove(&old_key).unwrap_or_else(|| StateNode::new(name.clone()));
            for pod in moved.pods.values() {
                inner.bindings.insert(pod.uid.clone(), name.clone());
            }
            moved.name = name.clone();
            moved
        } else {
            inner
                .nodes
                .remove(&name)
                .unwrap_or_else(|| StateNode::new(name.clone()))
        };
        entry.node = Some(node.clone());
        if let Some(pid) = &provider_id {
            entry.provider_id = Some(pid.clone());
            inner.provider_ids.insert(pid.clone(), name.clone());
        }
        inner.nodes.insert(name, entry);
    }

    pub fn delete_node(&self, name: &str) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        if let Some(mut entry) = inner.nodes.remove(name) {
            for pod in entry.pods.values() {
                inner.bindings.remove(&pod.uid);
            }
            // An in-flight claim survives the node object's deletion.
            if let Some(claim) = entry.claim.take() {
                let claim_name = claim.name_any();
                let mut shell = StateNode::new(claim_name.clone());
                shell.provider_id = claim.provider_id().map(String::from);
                if let Some(pid) = &shell.provider_id {
                    inner.provider_ids.insert(pid.clone(), claim_name.clone());
                }
                shell.claim = Some(claim);
                inner.nodes.insert(claim_name, shell);
            } else if let Some(pid) = &entry.provider_id {
                inner.provider_ids.remove(pid);
            }
        }
    }

    pub fn update_node_claim(&self, claim: &NodeClaim) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let claim_name = claim.name_any();
        let key = Self::entry_key_for(inner, claim.provider_id(), &claim_name);
        let entry = inner
            .nodes
            .entry(key.clone())
            .or_insert_with(|| StateNode::new(claim_name));
        entry.claim = Some(claim.clone());
        if let Some(pid) = claim.provider_id() {
            entry.provider_id.get_or_insert_with(|| pid.to_string());
            inner.provider_ids.insert(pid.to_string(), key);
        }
    }

    pub fn delete_node_claim(&self, claim: &NodeClaim) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let key = Self::entry_key_for(inner, claim.provider_id(), &claim.name_any());
        let Some(entry) = inner.nodes.get_mut(&key) else {
            return;
        };
        entry.claim = None;
        // A claim-only entry disappears with its claim.
        if entry.node.is_none() {
            if let Some(pid) = &entry.provider_id {
                inner.provider_ids.remove(pid);
            }
            let uids: Vec<String> = entry.pods.values().map(|p| p.uid.clone()).collect();
            for uid in uids {
                inner.bindings.remove(&uid);
            }
            inner.nodes.remove(&key);
        }
    }

    pub fn update_pod(&self, pod: &Pod) {
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
        if is_terminal(pod) || node_name.is_none() {
            self.remove_pod(pod);
            return;
        }
        let node_name = node_name.unwrap();
        let entry = pod_entry(pod);
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        // Unbind from a previous node first if the pod moved.
        if let Some(previous) = inner.bindings.get(&entry.uid).cloned() {
            if previous != node_name {
                if let Some(node) = inner.nodes.get_mut(&previous) {
                    node.pods.remove(&entry.key);
                }
            }
        }
        inner.bindings.insert(entry.uid.clone(), node_name.clone());
        inner
            .nodes
            .entry(node_name.clone())
            .or_insert_with(|| StateNode::new(node_name))
            .pods
            .insert(entry.key.clone(), entry);
    }

    pub fn remove_pod(&self, pod: &Pod) {
        let key = pod_key(pod);
        let uid = pod.metadata.uid.clone().unwrap_or_else(|| key.clone());
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        if let Some(node_key) = inner.bindings.remove(&uid) {
            if let Some(node) = inner.nodes.get_mut(&node_key) {
                node.pods.remove(&key);
            }
        }
    }

    pub fn update_daemonset(&self, ds: &DaemonSet) {
        if let Some(info) = daemonset_info(ds) {
            self.inner
                .write()
                .unwrap()
                .daemonsets
                .insert(info.key.clone(), info);
        }
    }

    pub fn delete_daemonset(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .unwrap()
            .daemonsets
            .remove(&format!("{}/{}", namespace, name));
    }

    pub fn for_each_node(&self, mut f: impl FnMut(&StateNode)) {
        let inner = self.inner.read().unwrap();
        for node in inner.nodes.values() {
            f(node);
        }
    }

    pub fn node_by_provider_id(&self, provider_id: &str) -> Option<StateNode> {
        let inner = self.inner.read().unwrap();
        let key = inner.provider_ids.get(provider_id)?;
        inner.nodes.get(key).cloned()
    }

    /// Deep-copies the mirror for a scheduling round, resolving each node's
    /// daemonset reservation while the lock is held.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap();
        let daemonsets: Vec<DaemonSetInfo> = inner.daemonsets.values().cloned().collect();
        let nodes = inner
            .nodes
            .values()
            .map(|n| {
                let mut node = n.clone();
                node.daemonset_spec = daemonsets
                    .iter()
                    .filter(|ds| ds.selector.satisfied_by(&node.labels()))
                    .fold(MilliResources::new(), |mut acc, ds| {
                        resources::add_assign(&mut acc, &ds.requests);
                        acc
                    });
                node
            })
            .collect();
        Snapshot { nodes, daemonsets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn node(name: &str, provider_id: &str, allocatable: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    labels::INITIALIZED.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                allocatable: Some(quantities(allocatable)),
                capacity: Some(quantities(allocatable)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn bound_pod(name: &str, node: &str, cpu: &str, daemonset: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                owner_references: daemonset.then(|| {
                    vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                        kind: "DaemonSet".to_string(),
                        api_version: "apps/v1".to_string(),
                        name: "ds".to_string(),
                        uid: "ds-uid".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                containers: vec![k8s_openapi::api::core::v1::Container {
                    name: "main".to_string(),
                    resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                        requests: Some(quantities(&[("cpu", cpu)])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn allocated_excludes_daemonset_pods() {
        let state = ClusterState::new();
        state.update_node(&node("n1", "p://1", &[("cpu", "4"), ("pods", "110")]));
        state.update_pod(&bound_pod("a", "n1", "500m", false));
        state.update_pod(&bound_pod("ds-a", "n1", "100m", true));
        let snapshot = state.snapshot();
        let n = &snapshot.nodes[0];
        assert_eq!(n.allocated()["cpu"], 500);
        assert_eq!(n.daemonset_requested()["cpu"], 100);
    }

    #[test]
    fn terminal_pods_do_not_contribute() {
        let state = ClusterState::new();
        state.update_node(&node("n1", "p://1", &[("cpu", "4")]));
        let mut pod = bound_pod("a", "n1", "500m", false);
        state.update_pod(&pod);
        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        state.update_pod(&pod);
        let snapshot = state.snapshot();
        assert!(snapshot.nodes[0].pods.is_empty());
    }

    #[test]
    fn available_reserves_room_for_unbound_daemonsets() {
        let state = ClusterState::new();
        state.update_node(&node("n1", "p://1", &[("cpu", "4")]));
        state.update_daemonset(&DaemonSet {
            metadata: ObjectMeta {
                name: Some("logging".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::apps::v1::DaemonSetSpec {
                template: k8s_openapi::api::core::v1::PodTemplateSpec {
                    spec: bound_pod("t", "x", "250m", false).spec,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        let snapshot = state.snapshot();
        let n = &snapshot.nodes[0];
        // 4000 allocatable − 0 allocated − 250 reserved for the daemonset.
        assert_eq!(n.available()["cpu"], 3_750);
    }

    #[test]
    fn unexpected_daemonset_usage_clamps_at_zero() {
        let state = ClusterState::new();
        state.update_node(&node("n1", "p://1", &[("cpu", "4")]));
        // A daemonset pod bound without any matching daemonset spec known.
        state.update_pod(&bound_pod("ds-x", "n1", "700m", true));
        let snapshot = state.snapshot();
        // Reservation is max(0, 0 − 700) = 0; available unaffected by it.
        assert_eq!(snapshot.nodes[0].available()["cpu"], 4_000);
    }

    #[test]
    fn kubelet_zeroed_extended_resources_keep_the_advertised_value() {
        let state = ClusterState::new();
        let mut claim = NodeClaim::default();
        claim.metadata.name = Some("claim-1".to_string());
        claim.status = Some(stratus_types::NodeClaimStatus {
            provider_id: Some("p://1".to_string()),
            capacity: quantities(&[("cpu", "8"), ("vendor/gpu", "2")]),
            allocatable: quantities(&[("cpu", "7900m"), ("vendor/gpu", "2")]),
            ..Default::default()
        });
        state.update_node_claim(&claim);
        let mut n = node("n1", "p://1", &[("cpu", "7900m"), ("pods", "110")]);
        n.status
            .as_mut()
            .unwrap()
            .allocatable
            .as_mut()
            .unwrap()
            .insert("vendor/gpu".to_string(), Quantity("0".to_string()));
        state.update_node(&n);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].allocatable()["vendor/gpu"], 2_000);
    }

    #[test]
    fn in_flight_claim_merges_with_its_registered_node() {
        let state = ClusterState::new();
        let mut claim = NodeClaim::default();
        claim.metadata.name = Some("claim-1".to_string());
        claim.status = Some(stratus_types::NodeClaimStatus {
            provider_id: Some("p://1".to_string()),
            capacity: quantities(&[("cpu", "2")]),
            allocatable: quantities(&[("cpu", "1900m")]),
            ..Default::default()
        });
        state.update_node_claim(&claim);
        {
            let snapshot = state.snapshot();
            assert_eq!(snapshot.nodes.len(), 1);
            assert!(snapshot.nodes[0].in_flight());
        }
        state.update_node(&node("n1", "p://1", &[("cpu", "1900m")]));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        let merged = &snapshot.nodes[0];
        assert_eq!(merged.name, "n1");
        assert!(!merged.in_flight());
        assert!(merged.claim.is_some());
        assert!(state.node_by_provider_id("p://1").is_some());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let state = ClusterState::new();
        state.update_node(&node("n1", "p://1", &[("cpu", "4")]));
        let snapshot = state.snapshot();
        state.update_pod(&bound_pod("late", "n1", "1", false));
        assert!(snapshot.nodes[0].pods.is_empty());
    }
}
