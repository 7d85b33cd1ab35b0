use crate::requirements::Requirement;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyKind {
    Spread {
        max_skew: i32,
        policy: Policy,
        min_domains: Option<i32>,
    },
    Affinity,
    AntiAffinity,
}

/// True iff a label map matches the selector. An absent selector matches
/// nothing; an empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    for (key, value) in selector.match_labels.iter().flatten() {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default();
        let current = labels.get(&expr.key);
        let ok = match expr.operator.as_str() {
            "In" => current.is_some_and(|v| values.contains(v)),
            "NotIn" => !current.is_some_and(|v| values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// One topology constraint in scope for the current round: a spread
/// constraint or a pod (anti-)affinity term, with its per-domain counts.
#[derive(Debug, Clone)]
pub struct TopologyGroup {
    pub kind: TopologyKind,
    pub key: String,
    pub selector: LabelSelector,
    pub namespaces: BTreeSet<String>,
    domains: BTreeMap<String, i32>,
    owners: HashSet<String>,
}

impl TopologyGroup {
    pub fn new(
        kind: TopologyKind,
        key: &str,
        selector: LabelSelector,
        namespaces: BTreeSet<String>,
    ) -> Self {
        TopologyGroup {
            kind,
            key: key.to_string(),
            selector,
            namespaces,
            domains: BTreeMap::new(),
            owners: HashSet::new(),
        }
    }

    pub fn register_domain(&mut self, domain: &str) {
        self.domains.entry(domain.to_string()).or_insert(0);
    }

    pub fn registered_domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Whether a pod participates in this group's counts.
    pub fn matches_pod(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        self.namespaces.contains(namespace) && selector_matches(&self.selector, labels)
    }

    /// Counts a pod into the given domains. Each owner counts once; the
    /// multi-domain case is an anti-affinity target on a node whose domain
    /// is still undetermined, which reserves every domain it may end up in.
    pub fn record(&mut self, owner_uid: &str, domains: &[String]) {
        if !self.owners.insert(owner_uid.to_string()) {
            return;
        }
        for domain in domains {
            *self.domains.entry(domain.clone()).or_insert(0) += 1;
        }
    }

    pub fn count(&self, domain: &str) -> i32 {
        self.domains.get(domain).copied().unwrap_or(0)
    }

    /// The requirement that keeps this group satisfied for a pod landing on
    /// a node whose current requirement for the key is `node_domain`.
    /// `self_selecting` means the pod itself matches the group's selector.
    pub fn next(&self, node_domain: &Requirement, self_selecting: bool) -> Requirement {
        match &self.kind {
            TopologyKind::Spread {
                max_skew,
                policy,
                min_domains,
            } => self.next_spread(node_domain, self_selecting, *max_skew, *policy, *min_domains),
            TopologyKind::Affinity => {
                let populated: Vec<String> = self
                    .domains
                    .iter()
                    .filter(|(_, c)| **c > 0)
                    .map(|(d, _)| d.clone())
                    .collect();
                if populated.is_empty() && self_selecting {
                    // The pod can satisfy its own affinity; any domain
                    // bootstraps the group.
                    return Requirement::exists(&self.key);
                }
                Requirement::new_in(&self.key, populated)
            }
            TopologyKind::AntiAffinity => {
                let populated: Vec<String> = self
                    .domains
                    .iter()
                    .filter(|(_, c)| **c > 0)
                    .map(|(d, _)| d.clone())
                    .collect();
                Requirement::new_not_in(&self.key, populated)
            }
        }
    }

    fn next_spread(
        &self,
        node_domain: &Requirement,
        self_selecting: bool,
        max_skew: i32,
        policy: Policy,
        min_domains: Option<i32>,
    ) -> Requirement {
        let populated = self.domains.values().filter(|c| **c > 0).count();
        let global_min = if min_domains.is_some_and(|md| populated < md as usize) {
            0
        } else {
            self.domains.values().copied().min().unwrap_or(0)
        };
        let pick = |honor_skew: bool| -> Option<&str> {
            let mut best: Option<(&str, i32)> = None;
            for (domain, count) in &self.domains {
                if !node_domain.has(domain) {
                    continue;
                }
                let effective = if self_selecting { count + 1 } else { *count };
                if honor_skew && effective - global_min > max_skew {
                    continue;
                }
                if best.is_none_or(|(_, c)| *count < c) {
                    best = Some((domain, *count));
                }
            }
            best.map(|(d, _)| d)
        };
        if let Some(domain) = pick(true) {
            return Requirement::new_in(&self.key, [domain.to_string()]);
        }
        match policy {
            // Every eligible domain is viable when we may not block; the
            // least-loaded one still wins.
            Policy::ScheduleAnyway => match pick(false) {
                Some(domain) => Requirement::new_in(&self.key, [domain.to_string()]),
                None => Requirement::does_not_exist(&self.key),
            },
            Policy::DoNotSchedule => Requirement::does_not_exist(&self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn spread_group(max_skew: i32, policy: Policy) -> TopologyGroup {
        let mut group = TopologyGroup::new(
            TopologyKind::Spread {
                max_skew,
                policy,
                min_domains: None,
            },
            "zone",
            selector(&[("app", "x")]),
            BTreeSet::from(["default".to_string()]),
        );
        for zone in ["z1", "z2", "z3"] {
            group.register_domain(zone);
        }
        group
    }

    #[test]
    fn spread_picks_the_least_loaded_viable_domain() {
        let mut group = spread_group(1, Policy::DoNotSchedule);
        group.record("a", &["z1".to_string()]);
        let next = group.next(&Requirement::exists("zone"), true);
        // z2 is the lexicographically-smallest zero-count domain.
        assert_eq!(next, Requirement::new_in("zone", ["z2"]));
    }

    #[test]
    fn spread_respects_the_node_domain_restriction() {
        let mut group = spread_group(2, Policy::DoNotSchedule);
        group.record("a", &["z1".to_string()]);
        let next = group.next(&Requirement::new_in("zone", ["z1"]), true);
        assert_eq!(next, Requirement::new_in("zone", ["z1"]));
    }

    #[test]
    fn do_not_schedule_dead_end_returns_an_unsatisfiable_requirement() {
        let mut group = spread_group(1, Policy::DoNotSchedule);
        group.record("a", &["z1".to_string()]);
        group.record("b", &["z1".to_string()]);
        // Forcing z1 while z2/z3 sit at zero would push skew past 1.
        let next = group.next(&Requirement::new_in("zone", ["z1"]), true);
        assert!(next.is_empty());
    }

    #[test]
    fn schedule_anyway_degrades_to_least_loaded() {
        let mut group = spread_group(1, Policy::ScheduleAnyway);
        group.record("a", &["z1".to_string()]);
        group.record("b", &["z1".to_string()]);
        let next = group.next(&Requirement::new_in("zone", ["z1"]), true);
        assert_eq!(next, Requirement::new_in("zone", ["z1"]));
    }

    #[test]
    fn anti_affinity_excludes_every_possibly_occupied_domain() {
        let mut group = TopologyGroup::new(
            TopologyKind::AntiAffinity,
            "zone",
            selector(&[("sec", "s2")]),
            BTreeSet::from(["default".to_string()]),
        );
        for zone in ["z1", "z2", "z3"] {
            group.register_domain(zone);
        }
        // Target pod sits on a node that may still land in any zone.
        group.record(
            "target",
            &["z1".to_string(), "z2".to_string(), "z3".to_string()],
        );
        let next = group.next(&Requirement::exists("zone"), false);
        assert!(!next.has("z1"));
        assert!(!next.has("z2"));
        assert!(!next.has("z3"));
    }

    #[test]
    fn affinity_requires_a_populated_domain_unless_self_selecting() {
        let mut group = TopologyGroup::new(
            TopologyKind::Affinity,
            "zone",
            selector(&[("app", "cache")]),
            BTreeSet::from(["default".to_string()]),
        );
        group.register_domain("z1");
        group.register_domain("z2");
        assert!(group.next(&Requirement::exists("zone"), false).is_empty());
        assert_eq!(
            group.next(&Requirement::exists("zone"), true),
            Requirement::exists("zone")
        );
        group.record("target", &["z2".to_string()]);
        assert_eq!(
            group.next(&Requirement::exists("zone"), false),
            Requirement::new_in("zone", ["z2"])
        );
    }

    #[test]
    fn owners_count_once() {
        let mut group = spread_group(1, Policy::DoNotSchedule);
        group.record("a", &["z1".to_string()]);
        group.record("a", &["z1".to_string()]);
        assert_eq!(group.count("z1"), 1);
    }

    #[test]
    fn empty_selector_matches_everything_absent_matches_nothing() {
        let all = LabelSelector {
            match_labels: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(selector_matches(&all, &BTreeMap::new()));
        let labeled = BTreeMap::from([("app".to_string(), "x".to_string())]);
        assert!(selector_matches(&all, &labeled));
        let with_expr = LabelSelector {
            match_expressions: Some(vec![
                k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                    key: "app".to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec!["y".to_string()]),
                },
            ]),
            ..Default::default()
        };
        assert!(selector_matches(&with_expr, &labeled));
    }
}
