//! Pod requirement extraction and preferred-term relaxation.
//!
//! Relaxation mutates the scheduler's private copy of a pod, one step per
//! call, and is driven by inspecting incompatibility values: required terms
//! are never weakened, but OR-ed required node selector terms may be dropped
//! one at a time down to the last.

use crate::requirements::{Requirement, RequirementParseError, Requirements};
use k8s_openapi::api::core::v1::Pod;

/// The scheduling requirements a pod currently expresses: its node selector,
/// the first OR-ed required node affinity term, and the highest-weight
/// preferred term (which relaxation removes on failure).
pub fn pod_requirements(pod: &Pod) -> Result<Requirements, RequirementParseError> {
    let mut out = Requirements::new();
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(out);
    };
    for (key, value) in spec.node_selector.iter().flatten() {
        out.add(Requirement::new_in(key, [value.clone()]));
    }
    let Some(node_affinity) = spec.affinity.as_ref().and_then(|a| a.node_affinity.as_ref())
    else {
        return Ok(out);
    };
    if let Some(preferred) = node_affinity
        .preferred_during_scheduling_ignored_during_execution
        .as_ref()
        .filter(|p| !p.is_empty())
    {
        // Highest weight wins; the first listed wins ties.
        let top = preferred
            .iter()
            .enumerate()
            .max_by(|(ai, a), (bi, b)| a.weight.cmp(&b.weight).then(bi.cmp(ai)))
            .map(|(_, t)| t)
            .unwrap();
        for expr in top.preference.match_expressions.iter().flatten() {
            out.add(Requirement::try_from_node_selector(expr)?);
        }
    }
    if let Some(term) = node_affinity
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .and_then(|sel| sel.node_selector_terms.first())
    {
        for expr in term.match_expressions.iter().flatten() {
            out.add(Requirement::try_from_node_selector(expr)?);
        }
    }
    Ok(out)
}

/// Removes one preference from the pod, in fixed order. Returns false when
/// nothing further can be relaxed.
pub fn relax(pod: &mut Pod) -> bool {
    if remove_lowest_weight_preferred_node_term(pod) {
        return true;
    }
    if remove_lowest_weight_preferred_pod_term(pod) {
        return true;
    }
    if drop_surplus_required_node_selector_term(pod) {
        return true;
    }
    false
}

fn remove_lowest_weight_preferred_node_term(pod: &mut Pod) -> bool {
    let Some(preferred) = pod
        .spec
        .as_mut()
        .and_then(|s| s.affinity.as_mut())
        .and_then(|a| a.node_affinity.as_mut())
        .and_then(|na| {
            na.preferred_during_scheduling_ignored_during_execution
                .as_mut()
        })
    else {
        return false;
    };
    let Some(index) = preferred
        .iter()
        .enumerate()
        .min_by_key(|(i, t)| (t.weight, *i))
        .map(|(i, _)| i)
    else {
        return false;
    };
    preferred.remove(index);
    true
}

fn remove_lowest_weight_preferred_pod_term(pod: &mut Pod) -> bool {
    let Some(affinity) = pod.spec.as_mut().and_then(|s| s.affinity.as_mut()) else {
        return false;
    };
    let affinity_terms = affinity
        .pod_affinity
        .as_mut()
        .and_then(|pa| pa.preferred_during_scheduling_ignored_during_execution.as_mut());
    let anti_terms = affinity
        .pod_anti_affinity
        .as_mut()
        .and_then(|pa| pa.preferred_during_scheduling_ignored_during_execution.as_mut());
    // The globally lowest weight across both lists goes first.
    let affinity_min = affinity_terms
        .as_ref()
        .and_then(|ts| ts.iter().map(|t| t.weight).min());
    let anti_min = anti_terms
        .as_ref()
        .and_then(|ts| ts.iter().map(|t| t.weight).min());
    match (affinity_min, anti_min) {
        (Some(a), Some(b)) if b < a => remove_weight(anti_terms, b),
        (Some(a), _) => remove_weight(affinity_terms, a),
        (None, Some(b)) => remove_weight(anti_terms, b),
        (None, None) => false,
    }
}

fn remove_weight(
    terms: Option<&mut Vec<k8s_openapi::api::core::v1::WeightedPodAffinityTerm>>,
    weight: i32,
) -> bool {
    let Some(terms) = terms else {
        return false;
    };
    let Some(index) = terms.iter().position(|t| t.weight == weight) else {
        return false;
    };
    terms.remove(index);
    true
}

/// OR-ed required node selector terms fall back one alternative at a time.
/// The final remaining term is requiredness itself and is never dropped.
fn drop_surplus_required_node_selector_term(pod: &mut Pod) -> bool {
    let Some(terms) = pod
        .spec
        .as_mut()
        .and_then(|s| s.affinity.as_mut())
        .and_then(|a| a.node_affinity.as_mut())
        .and_then(|na| {
            na.required_during_scheduling_ignored_during_execution
                .as_mut()
        })
        .map(|sel| &mut sel.node_selector_terms)
    else {
        return false;
    };
    if terms.len() <= 1 {
        return false;
    }
    terms.remove(0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
        PreferredSchedulingTerm,
    };

    fn expr(key: &str, values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement {
            key: key.to_string(),
            operator: "In".to_string(),
            values: Some(values.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn pod_with_affinity(
        preferred: Vec<(i32, NodeSelectorRequirement)>,
        required_terms: Vec<Vec<NodeSelectorRequirement>>,
    ) -> Pod {
        Pod {
            spec: Some(PodSpec {
                affinity: Some(Affinity {
                    node_affinity: Some(NodeAffinity {
                        preferred_during_scheduling_ignored_during_execution: (!preferred
                            .is_empty())
                        .then(|| {
                            preferred
                                .into_iter()
                                .map(|(weight, e)| PreferredSchedulingTerm {
                                    weight,
                                    preference: NodeSelectorTerm {
                                        match_expressions: Some(vec![e]),
                                        ..Default::default()
                                    },
                                })
                                .collect()
                        }),
                        required_during_scheduling_ignored_during_execution: (!required_terms
                            .is_empty())
                        .then(|| NodeSelector {
                            node_selector_terms: required_terms
                                .into_iter()
                                .map(|exprs| NodeSelectorTerm {
                                    match_expressions: Some(exprs),
                                    ..Default::default()
                                })
                                .collect(),
                        }),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn highest_weight_preference_becomes_a_requirement() {
        let pod = pod_with_affinity(
            vec![(1, expr("zone", &["z1"])), (10, expr("zone", &["z2"]))],
            vec![],
        );
        let reqs = pod_requirements(&pod).unwrap();
        assert_eq!(reqs.get("zone"), Requirement::new_in("zone", ["z2"]));
    }

    #[test]
    fn relax_removes_preferences_lowest_weight_first() {
        let mut pod = pod_with_affinity(
            vec![(1, expr("zone", &["z1"])), (10, expr("zone", &["z2"]))],
            vec![],
        );
        assert!(relax(&mut pod));
        let reqs = pod_requirements(&pod).unwrap();
        // The weight-1 term is gone; weight 10 survives the first pass.
        assert_eq!(reqs.get("zone"), Requirement::new_in("zone", ["z2"]));
        assert!(relax(&mut pod));
        assert!(!pod_requirements(&pod).unwrap().has_key("zone"));
        assert!(!relax(&mut pod));
    }

    #[test]
    fn only_the_first_required_term_applies_until_relaxed() {
        let mut pod = pod_with_affinity(
            vec![],
            vec![
                vec![expr("zone", &["z9"])],
                vec![expr("zone", &["z1", "z2"])],
            ],
        );
        assert_eq!(
            pod_requirements(&pod).unwrap().get("zone"),
            Requirement::new_in("zone", ["z9"])
        );
        // Falling back to the next OR-ed alternative is allowed...
        assert!(relax(&mut pod));
        assert_eq!(
            pod_requirements(&pod).unwrap().get("zone"),
            Requirement::new_in("zone", ["z1", "z2"])
        );
        // ...but the final term is requiredness itself.
        assert!(!relax(&mut pod));
        assert!(pod_requirements(&pod).unwrap().has_key("zone"));
    }

    #[test]
    fn node_selector_is_never_relaxed() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                node_selector: Some(
                    [("disk".to_string(), "ssd".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!relax(&mut pod));
        assert_eq!(
            pod_requirements(&pod).unwrap().get("disk"),
            Requirement::new_in("disk", ["ssd"])
        );
    }
}
