//! The topology accountant: a per-round counter of pod placements across
//! topology domains, answering "where may this pod go without violating
//! spread, affinity, or anti-affinity?"

use crate::requirements::{Op, Requirements};
use crate::state::Snapshot;
use k8s_openapi::api::core::v1::{Pod, PodAffinityTerm, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

mod group;

pub use group::{Policy, TopologyGroup, TopologyKind, selector_matches};

pub struct Topology {
    groups: BTreeMap<String, TopologyGroup>,
    /// One entry per batch pod carrying required anti-affinity: where that
    /// owner lands, pods matching its selector may not follow.
    inverse: Vec<InverseGroup>,
    /// Domains a node pool is able to place nodes into, per topology key.
    cluster_domains: BTreeMap<String, BTreeSet<String>>,
    /// Known namespaces and their labels, for namespace selectors.
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

struct InverseGroup {
    owner_uid: String,
    group: TopologyGroup,
}

fn group_id(
    kind: &TopologyKind,
    key: &str,
    selector: &LabelSelector,
    namespaces: &BTreeSet<String>,
) -> String {
    format!(
        "{:?}|{}|{}|{:?}",
        kind,
        key,
        serde_json::to_string(selector).unwrap_or_default(),
        namespaces
    )
}

fn pod_uid(pod: &Pod) -> String {
    pod.metadata.uid.clone().unwrap_or_else(|| {
        format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
    })
}

pub(crate) fn spread_constraints(pod: &Pod) -> Vec<&TopologySpreadConstraint> {
    pod.spec
        .as_ref()
        .and_then(|s| s.topology_spread_constraints.as_ref())
        .map(|cs| cs.iter().collect())
        .unwrap_or_default()
}

/// Required and (not yet relaxed) preferred affinity terms.
pub(crate) fn affinity_terms(pod: &Pod) -> Vec<&PodAffinityTerm> {
    let Some(affinity) = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_affinity.as_ref())
    else {
        return Vec::new();
    };
    affinity
        .required_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .chain(
            affinity
                .preferred_during_scheduling_ignored_during_execution
                .iter()
                .flatten()
                .map(|w| &w.pod_affinity_term),
        )
        .collect()
}

pub(crate) fn anti_affinity_terms(pod: &Pod) -> Vec<&PodAffinityTerm> {
    let Some(affinity) = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
    else {
        return Vec::new();
    };
    affinity
        .required_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .chain(
            affinity
                .preferred_during_scheduling_ignored_during_execution
                .iter()
                .flatten()
                .map(|w| &w.pod_affinity_term),
        )
        .collect()
}

fn required_anti_affinity_terms(pod: &Pod) -> Vec<&PodAffinityTerm> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|ts| ts.iter().collect())
        .unwrap_or_default()
}

/// True iff the pod carries any pod affinity or anti-affinity term. Such
/// pods depend on other placements and are ordered after plain pods.
pub fn has_pod_affinity_terms(pod: &Pod) -> bool {
    !affinity_terms(pod).is_empty() || !anti_affinity_terms(pod).is_empty()
}

impl Topology {
    /// Builds the round's accountant: one group per spread constraint and
    /// per pod (anti-)affinity term found in the batch, seeded with counts
    /// from every existing node's bound pods.
    pub fn build(
        snapshot: &Snapshot,
        batch: &[Pod],
        cluster_domains: BTreeMap<String, BTreeSet<String>>,
        namespaces: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        let mut topology = Topology {
            groups: BTreeMap::new(),
            inverse: Vec::new(),
            cluster_domains,
            namespaces,
        };
        for pod in batch {
            let pod_namespace = pod.namespace().unwrap_or_default();
            for constraint in spread_constraints(pod) {
                let kind = TopologyKind::Spread {
                    max_skew: constraint.max_skew,
                    policy: match constraint.when_unsatisfiable.as_str() {
                        "ScheduleAnyway" => Policy::ScheduleAnyway,
                        _ => Policy::DoNotSchedule,
                    },
                    min_domains: constraint.min_domains,
                };
                let selector = constraint.label_selector.clone().unwrap_or_default();
                let namespaces = BTreeSet::from([pod_namespace.clone()]);
                topology.add_group(kind, &constraint.topology_key, selector, namespaces);
            }
            for term in affinity_terms(pod) {
                let (selector, namespaces) = topology.term_scope(&pod_namespace, term);
                topology.add_group(TopologyKind::Affinity, &term.topology_key, selector, namespaces);
            }
            for term in anti_affinity_terms(pod) {
                let (selector, namespaces) = topology.term_scope(&pod_namespace, term);
                topology.add_group(
                    TopologyKind::AntiAffinity,
                    &term.topology_key,
                    selector,
                    namespaces,
                );
            }
            for term in required_anti_affinity_terms(pod) {
                let (selector, namespaces) = topology.term_scope(&pod_namespace, term);
                let mut group = TopologyGroup::new(
                    TopologyKind::AntiAffinity,
                    &term.topology_key,
                    selector,
                    namespaces,
                );
                for domain in topology
                    .cluster_domains
                    .get(&term.topology_key)
                    .into_iter()
                    .flatten()
                {
                    group.register_domain(domain);
                }
                topology.inverse.push(InverseGroup {
                    owner_uid: pod_uid(pod),
                    group,
                });
            }
        }
        topology.seed_from_snapshot(snapshot);
        topology
    }

    /// The namespaces a term's counts draw from: its explicit list, the
    /// namespaces matched by its selector, or the pod's own namespace when
    /// neither is present.
    fn term_scope(
        &self,
        pod_namespace: &str,
        term: &PodAffinityTerm,
    ) -> (LabelSelector, BTreeSet<String>) {
        let selector = term.label_selector.clone().unwrap_or_default();
        let mut namespaces: BTreeSet<String> =
            term.namespaces.iter().flatten().cloned().collect();
        if let Some(ns_selector) = &term.namespace_selector {
            for (name, labels) in &self.namespaces {
                if selector_matches(ns_selector, labels) {
                    namespaces.insert(name.clone());
                }
            }
        }
        if namespaces.is_empty() {
            namespaces.insert(pod_namespace.to_string());
        }
        (selector, namespaces)
    }

    fn add_group(
        &mut self,
        kind: TopologyKind,
        key: &str,
        selector: LabelSelector,
        namespaces: BTreeSet<String>,
    ) {
        let id = group_id(&kind, key, &selector, &namespaces);
        if self.groups.contains_key(&id) {
            return;
        }
        let mut group = TopologyGroup::new(kind, key, selector, namespaces);
        for domain in self.cluster_domains.get(key).into_iter().flatten() {
            group.register_domain(domain);
        }
        self.groups.insert(id, group);
    }

    /// Counts every bound pod on every known node into the matching groups.
    /// Nodes missing a group's topology key do not contribute.
    fn seed_from_snapshot(&mut self, snapshot: &Snapshot) {
        for node in &snapshot.nodes {
            let node_labels = node.labels();
            for group in self.groups.values_mut() {
                let Some(domain) = node_labels.get(&group.key) else {
                    continue;
                };
                group.register_domain(domain);
                for pod in node.pods.values() {
                    if group.matches_pod(&pod.namespace, &pod.labels) {
                        group.record(&pod.uid, std::slice::from_ref(domain));
                    }
                }
            }
        }
    }

    /// Registers a synthetic domain, e.g. the placeholder hostname of a
    /// simulated node, so spread over hostnames can account for it.
    pub fn register(&mut self, key: &str, domain: &str) {
        self.cluster_domains
            .entry(key.to_string())
            .or_default()
            .insert(domain.to_string());
        for g in self.groups.values_mut() {
            if g.key == key {
                g.register_domain(domain);
            }
        }
        for inv in &mut self.inverse {
            if inv.group.key == key {
                inv.group.register_domain(domain);
            }
        }
    }

    /// The additional requirements that place the pod in domains acceptable
    /// to every topology constraint it carries, given the node's current
    /// requirements. The result may be unsatisfiable; callers detect that
    /// through the intersection.
    pub fn add_requirements(&self, pod: &Pod, node_requirements: &Requirements) -> Requirements {
        let pod_namespace = pod.namespace().unwrap_or_default();
        let pod_labels = pod.labels();
        let mut out = Requirements::new();
        let mut consult = |kind: TopologyKind, key: &str, selector: LabelSelector, namespaces| {
            let id = group_id(&kind, key, &selector, &namespaces);
            let Some(group) = self.groups.get(&id) else {
                return;
            };
            let mut node_domain = node_requirements.get(key);
            if out.has_key(key) {
                node_domain = node_domain.intersect(&out.get(key));
            }
            let self_selecting = group.matches_pod(&pod_namespace, pod_labels);
            out.add(group.next(&node_domain, self_selecting));
        };
        for constraint in spread_constraints(pod) {
            consult(
                TopologyKind::Spread {
                    max_skew: constraint.max_skew,
                    policy: match constraint.when_unsatisfiable.as_str() {
                        "ScheduleAnyway" => Policy::ScheduleAnyway,
                        _ => Policy::DoNotSchedule,
                    },
                    min_domains: constraint.min_domains,
                },
                &constraint.topology_key,
                constraint.label_selector.clone().unwrap_or_default(),
                BTreeSet::from([pod_namespace.clone()]),
            );
        }
        for term in affinity_terms(pod) {
            let (selector, namespaces) = self.term_scope(&pod_namespace, term);
            consult(TopologyKind::Affinity, &term.topology_key, selector, namespaces);
        }
        for term in anti_affinity_terms(pod) {
            let (selector, namespaces) = self.term_scope(&pod_namespace, term);
            consult(
                TopologyKind::AntiAffinity,
                &term.topology_key,
                selector,
                namespaces,
            );
        }
        drop(consult);
        // Anti-affinity held by already-placed pods repels this pod from
        // wherever those owners may be.
        let uid = pod_uid(pod);
        for inv in &self.inverse {
            if inv.owner_uid == uid || !inv.group.matches_pod(&pod_namespace, pod_labels) {
                continue;
            }
            let mut node_domain = node_requirements.get(&inv.group.key);
            if out.has_key(&inv.group.key) {
                node_domain = node_domain.intersect(&out.get(&inv.group.key));
            }
            out.add(inv.group.next(&node_domain, false));
        }
        out
    }

    /// Records a committed placement. `committed` is the node's requirement
    /// set after the pod was added. Anti-affinity targets on nodes whose
    /// domain is still multi-valued count into every domain the node may
    /// occupy; other groups count only once the domain is pinned.
    pub fn record(&mut self, pod: &Pod, committed: &Requirements) {
        let namespace = pod.namespace().unwrap_or_default();
        let labels = pod.labels();
        let uid = pod_uid(pod);
        for g in self.groups.values_mut() {
            if !g.matches_pod(&namespace, labels) {
                continue;
            }
            let requirement = committed.get(&g.key);
            match g.kind {
                TopologyKind::AntiAffinity => {
                    let domains: Vec<String> = if requirement.operator() == Op::In {
                        requirement.values().map(String::from).collect()
                    } else {
                        // Domain entirely unknown: the target may end up
                        // anywhere, so every registered domain is reserved.
                        g.registered_domains().map(String::from).collect()
                    };
                    g.record(&uid, &domains);
                }
                _ => {
                    if requirement.len() == Some(1)
                        && let Some(domain) = requirement.any()
                    {
                        let domain = domain.to_string();
                        g.record(&uid, &[domain]);
                    }
                }
            }
        }
        for inv in &mut self.inverse {
            if inv.owner_uid != uid {
                continue;
            }
            let requirement = committed.get(&inv.group.key);
            let domains: Vec<String> = if requirement.operator() == Op::In {
                requirement.values().map(String::from).collect()
            } else {
                inv.group.registered_domains().map(String::from).collect()
            };
            inv.group.record(&uid, &domains);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::Requirement;
    use k8s_openapi::api::core::v1::{PodAffinity, PodAntiAffinity};
    use kube::api::ObjectMeta;

    fn pod_with_labels(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_spread(mut pod: Pod, key: &str, max_skew: i32, selector: &[(&str, &str)]) -> Pod {
        let spec = pod.spec.get_or_insert_with(Default::default);
        spec.topology_spread_constraints = Some(vec![TopologySpreadConstraint {
            max_skew,
            topology_key: key.to_string(),
            when_unsatisfiable: "DoNotSchedule".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    fn with_anti_affinity(mut pod: Pod, key: &str, selector: &[(&str, &str)]) -> Pod {
        let spec = pod.spec.get_or_insert_with(Default::default);
        let affinity = spec.affinity.get_or_insert_with(Default::default);
        affinity.pod_anti_affinity = Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                topology_key: key.to_string(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(
                        selector
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn with_affinity(mut pod: Pod, key: &str, selector: &[(&str, &str)]) -> Pod {
        let spec = pod.spec.get_or_insert_with(Default::default);
        let affinity = spec.affinity.get_or_insert_with(Default::default);
        affinity.pod_affinity = Some(PodAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                topology_key: key.to_string(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(
                        selector
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn zones() -> BTreeMap<String, BTreeSet<String>> {
        BTreeMap::from([(
            "zone".to_string(),
            BTreeSet::from(["z1".to_string(), "z2".to_string(), "z3".to_string()]),
        )])
    }

    #[test]
    fn spread_rotates_through_empty_domains() {
        let pods: Vec<Pod> = (0..4)
            .map(|i| {
                with_spread(
                    pod_with_labels(&format!("p{i}"), &[("app", "x")]),
                    "zone",
                    1,
                    &[("app", "x")],
                )
            })
            .collect();
        let snapshot = Snapshot::default();
        let mut topology = Topology::build(&snapshot, &pods, zones(), BTreeMap::new());
        let mut counts: BTreeMap<String, i32> = BTreeMap::new();
        for pod in &pods {
            let reqs = topology.add_requirements(pod, &Requirements::new());
            let zone = reqs.get("zone").any().unwrap().to_string();
            let committed: Requirements =
                [Requirement::new_in("zone", [zone.clone()])].into_iter().collect();
            topology.record(pod, &committed);
            *counts.entry(zone).or_insert(0) += 1;
        }
        let mut sorted: Vec<i32> = counts.values().copied().collect();
        sorted.sort();
        assert_eq!(sorted, vec![1, 1, 2]);
    }

    #[test]
    fn anti_affinity_against_an_unpinned_node_blocks_everywhere() {
        let target = pod_with_labels("target", &[("sec", "s2")]);
        let repelled = with_anti_affinity(
            pod_with_labels("repelled", &[("app", "other")]),
            "zone",
            &[("sec", "s2")],
        );
        let snapshot = Snapshot::default();
        let mut topology =
            Topology::build(&snapshot, &[target.clone(), repelled.clone()], zones(), BTreeMap::new());
        // Target lands on a node that may still be any of the three zones.
        let committed: Requirements =
            [Requirement::new_in("zone", ["z1", "z2", "z3"])].into_iter().collect();
        topology.record(&target, &committed);
        let reqs = topology.add_requirements(&repelled, &Requirements::new());
        let zone_req = reqs.get("zone");
        assert!(!zone_req.has("z1"));
        assert!(!zone_req.has("z2"));
        assert!(!zone_req.has("z3"));
    }

    #[test]
    fn anti_affinity_against_a_pinned_node_frees_other_domains() {
        let target = pod_with_labels("target", &[("sec", "s2")]);
        let repelled = with_anti_affinity(
            pod_with_labels("repelled", &[("app", "other")]),
            "zone",
            &[("sec", "s2")],
        );
        let snapshot = Snapshot::default();
        let mut topology =
            Topology::build(&snapshot, &[target.clone(), repelled.clone()], zones(), BTreeMap::new());
        let committed: Requirements =
            [Requirement::new_in("zone", ["z2"])].into_iter().collect();
        topology.record(&target, &committed);
        let reqs = topology.add_requirements(&repelled, &Requirements::new());
        let zone_req = reqs.get("zone");
        assert!(zone_req.has("z1"));
        assert!(!zone_req.has("z2"));
        assert!(zone_req.has("z3"));
    }

    #[test]
    fn affinity_blocks_until_a_target_is_placed() {
        let follower = with_affinity(
            pod_with_labels("follower", &[("app", "web")]),
            "zone",
            &[("app", "cache")],
        );
        let cache = pod_with_labels("cache", &[("app", "cache")]);
        let snapshot = Snapshot::default();
        let mut topology =
            Topology::build(&snapshot, &[follower.clone(), cache.clone()], zones(), BTreeMap::new());
        assert!(
            topology
                .add_requirements(&follower, &Requirements::new())
                .get("zone")
                .is_empty()
        );
        let committed: Requirements =
            [Requirement::new_in("zone", ["z3"])].into_iter().collect();
        topology.record(&cache, &committed);
        assert_eq!(
            topology
                .add_requirements(&follower, &Requirements::new())
                .get("zone"),
            Requirement::new_in("zone", ["z3"])
        );
    }
}
