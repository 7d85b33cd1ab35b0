//! The constraint engine: symbolic label requirements supporting
//! intersection, compatibility checking, and projection to concrete labels.

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use std::collections::BTreeMap;
use std::fmt;

mod requirement;

pub use requirement::{Op, Requirement, RequirementParseError};

use stratus_common::labels;

/// The failed intersection of two requirements on one key. This is a value,
/// not an exception: callers inspect it to drive preferred-term relaxation.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("incompatible requirements for '{key}': {left} does not intersect {right}")]
pub struct IncompatibleRequirement {
    pub key: String,
    pub left: String,
    pub right: String,
}

impl IncompatibleRequirement {
    fn new(key: &str, left: impl fmt::Display, right: impl fmt::Display) -> Self {
        IncompatibleRequirement {
            key: key.to_string(),
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

/// A set of requirements, at most one per key. Iteration order is the key
/// order, which keeps every downstream decision deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    inner: BTreeMap<String, Requirement>,
}

/// Label keys whose values the platform itself resolves (via the chosen
/// instance type and offering), so a pool need not declare them explicitly.
pub fn is_well_known(key: &str) -> bool {
    matches!(
        key,
        labels::TOPOLOGY_ZONE
            | labels::INSTANCE_TYPE
            | labels::ARCH
            | labels::OS
            | labels::HOSTNAME
            | labels::NODE_POOL
            | labels::CAPACITY_TYPE
    )
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut out = Self::new();
        for (key, value) in labels {
            out.add(Requirement::new_in(key, [value.clone()]));
        }
        out
    }

    pub fn try_from_node_selector_requirements(
        selectors: &[NodeSelectorRequirement],
    ) -> Result<Self, RequirementParseError> {
        let mut out = Self::new();
        for selector in selectors {
            out.add(Requirement::try_from_node_selector(selector)?);
        }
        Ok(out)
    }

    /// Intersects the requirement into the set in place. The stored
    /// requirement may become empty; `compatible`/`intersect` report that as
    /// an incompatibility.
    pub fn add(&mut self, requirement: Requirement) {
        match self.inner.get_mut(requirement.key()) {
            Some(existing) => *existing = existing.intersect(&requirement),
            None => {
                self.inner
                    .insert(requirement.key().to_string(), requirement);
            }
        }
    }

    /// The requirement for a key; universal (`Exists`) if unset.
    pub fn get(&self, key: &str) -> Requirement {
        self.inner
            .get(key)
            .cloned()
            .unwrap_or_else(|| Requirement::exists(key))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Requirement> {
        self.inner.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Requirement)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn check_pair(
        key: &str,
        left: &Requirement,
        right: &Requirement,
    ) -> Result<(), IncompatibleRequirement> {
        if left.is_does_not_exist() && right.is_does_not_exist() {
            return Ok(());
        }
        if left.intersect(right).is_empty() {
            return Err(IncompatibleRequirement::new(key, left, right));
        }
        Ok(())
    }

    /// Checks that `incoming` can be satisfied together with this set, where
    /// this set describes a node (or node template). Keys this set does not
    /// define are allowed when well-known (the instance type will define
    /// them) or when absence satisfies the incoming operator; custom keys
    /// requiring a value are incompatible, since nothing will ever put that
    /// label on the node.
    pub fn compatible(&self, incoming: &Requirements) -> Result<(), IncompatibleRequirement> {
        for (key, requirement) in incoming.iter() {
            match self.inner.get(key) {
                Some(existing) => Self::check_pair(key, existing, requirement)?,
                None => {
                    if !is_well_known(key) && !requirement.matches_absent_key() {
                        return Err(IncompatibleRequirement::new(key, "undefined", requirement));
                    }
                }
            }
        }
        Ok(())
    }

    /// Produces the combined set, or the first incompatibility in key order.
    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, IncompatibleRequirement> {
        let mut out = self.clone();
        for (key, requirement) in other.iter() {
            match out.inner.get(key) {
                Some(existing) => {
                    Self::check_pair(key, existing, requirement)?;
                    let merged = existing.intersect(requirement);
                    out.inner.insert(key.to_string(), merged);
                }
                None => {
                    out.inner.insert(key.to_string(), requirement.clone());
                }
            }
        }
        Ok(out)
    }

    /// Materializes every single-valued key into a concrete label map.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .filter(|(_, r)| r.len() == Some(1))
            .filter_map(|(k, r)| r.any().map(|v| (k.clone(), v.to_string())))
            .collect()
    }

    /// True iff a concrete label map satisfies every requirement.
    pub fn satisfied_by(&self, labels: &BTreeMap<String, String>) -> bool {
        self.inner.iter().all(|(key, requirement)| {
            match labels.get(key) {
                Some(value) => requirement.has(value),
                None => requirement.matches_absent_key(),
            }
        })
    }

    /// Renders the set as node selector requirements, for persisting onto a
    /// NodeClaim spec.
    pub fn to_node_selector_requirements(&self) -> Vec<NodeSelectorRequirement> {
        self.inner
            .values()
            .map(|r| {
                let (operator, values) = match r.operator() {
                    Op::In => ("In", Some(r.values().map(String::from).collect())),
                    Op::NotIn => ("NotIn", Some(r.values().map(String::from).collect())),
                    Op::Exists => ("Exists", None),
                    Op::DoesNotExist => ("DoesNotExist", None),
                    // Gt/Lt render the bound back as the single value.
                    Op::Gt => (
                        "Gt",
                        Some(vec![r.greater_than_bound().unwrap_or(0).to_string()]),
                    ),
                    Op::Lt => (
                        "Lt",
                        Some(vec![r.less_than_bound().unwrap_or(0).to_string()]),
                    ),
                };
                NodeSelectorRequirement {
                    key: r.key().to_string(),
                    operator: operator.to_string(),
                    values,
                }
            })
            .collect()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut out = Self::new();
        for requirement in iter {
            out.add(requirement);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn add_intersects_in_place() {
        let mut reqs = Requirements::new();
        reqs.add(Requirement::new_in("zone", ["z1", "z2", "z3"]));
        reqs.add(Requirement::new_not_in("zone", ["z2"]));
        assert_eq!(
            reqs.get("zone").values().collect::<Vec<_>>(),
            vec!["z1", "z3"]
        );
    }

    #[test]
    fn get_returns_universal_for_unset_keys() {
        let reqs = Requirements::new();
        assert_eq!(reqs.get("anything").operator(), Op::Exists);
    }

    #[test]
    fn intersect_reports_the_first_incompatible_key() {
        let left: Requirements = [
            Requirement::new_in("a", ["1"]),
            Requirement::new_in("b", ["x"]),
        ]
        .into_iter()
        .collect();
        let right: Requirements = [
            Requirement::new_in("a", ["2"]),
            Requirement::new_in("b", ["y"]),
        ]
        .into_iter()
        .collect();
        let err = left.intersect(&right).unwrap_err();
        // BTreeMap order makes "a" the first conflict every time.
        assert_eq!(err.key, "a");
    }

    #[test]
    fn compatible_rejects_undefined_custom_keys_but_allows_well_known() {
        let node: Requirements = [Requirement::new_in("team-owned", ["x"])].into_iter().collect();
        let pod_custom: Requirements = [Requirement::new_in("team", ["a"])].into_iter().collect();
        assert!(node.compatible(&pod_custom).is_err());

        let pod_zone: Requirements =
            [Requirement::new_in(labels::TOPOLOGY_ZONE, ["z1"])].into_iter().collect();
        assert!(node.compatible(&pod_zone).is_ok());

        // Absence satisfies NotIn and DoesNotExist.
        let pod_not_in: Requirements = [Requirement::new_not_in("team", ["a"])].into_iter().collect();
        assert!(node.compatible(&pod_not_in).is_ok());
        let pod_dne: Requirements = [Requirement::does_not_exist("team")].into_iter().collect();
        assert!(node.compatible(&pod_dne).is_ok());
    }

    #[test]
    fn does_not_exist_pairs_are_compatible() {
        let left: Requirements = [Requirement::does_not_exist("gpu")].into_iter().collect();
        let right: Requirements = [Requirement::does_not_exist("gpu")].into_iter().collect();
        assert!(left.compatible(&right).is_ok());
        let nonempty: Requirements = [Requirement::new_in("gpu", ["1"])].into_iter().collect();
        assert!(left.compatible(&nonempty).is_err());
    }

    #[test]
    fn labels_materializes_only_single_valued_keys() {
        let reqs: Requirements = [
            Requirement::new_in("zone", ["z1"]),
            Requirement::new_in("arch", ["amd64", "arm64"]),
            Requirement::exists("os"),
        ]
        .into_iter()
        .collect();
        assert_eq!(reqs.labels(), labels(&[("zone", "z1")]));
    }

    #[test]
    fn satisfied_by_checks_every_key() {
        let reqs: Requirements = [
            Requirement::new_in("zone", ["z1", "z2"]),
            Requirement::new_not_in("pool", ["banned"]),
            Requirement::does_not_exist("quarantine"),
        ]
        .into_iter()
        .collect();
        assert!(reqs.satisfied_by(&labels(&[("zone", "z1")])));
        assert!(reqs.satisfied_by(&labels(&[("zone", "z2"), ("pool", "ok")])));
        assert!(!reqs.satisfied_by(&labels(&[("zone", "z9")])));
        assert!(!reqs.satisfied_by(&labels(&[("zone", "z1"), ("quarantine", "y")])));
    }

    #[test]
    fn intersection_satisfaction_implies_both_sides() {
        let left: Requirements = [
            Requirement::new_in("zone", ["z1", "z2"]),
            Requirement::greater_than("generation", 3),
        ]
        .into_iter()
        .collect();
        let right: Requirements = [
            Requirement::new_not_in("zone", ["z2"]),
            Requirement::less_than("generation", 10),
        ]
        .into_iter()
        .collect();
        let combined = left.intersect(&right).unwrap();
        let sample = labels(&[("zone", "z1"), ("generation", "5")]);
        assert!(combined.satisfied_by(&sample));
        assert!(left.satisfied_by(&sample));
        assert!(right.satisfied_by(&sample));
    }

    #[test]
    fn round_trips_node_selector_requirements() {
        let reqs: Requirements = [
            Requirement::new_in("zone", ["z1", "z2"]),
            Requirement::greater_than("generation", 3),
            Requirement::does_not_exist("quarantine"),
        ]
        .into_iter()
        .collect();
        let rendered = reqs.to_node_selector_requirements();
        let parsed = Requirements::try_from_node_selector_requirements(&rendered).unwrap();
        assert_eq!(reqs, parsed);
    }
}
