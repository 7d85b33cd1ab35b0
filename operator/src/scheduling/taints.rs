use k8s_openapi::api::core::v1::{Pod, Taint, Toleration};
use stratus_common::taints;

/// Taints the kubelet adds and removes on its own while a node settles;
/// they never disqualify a node during scheduling simulation.
pub fn is_ephemeral(taint: &Taint) -> bool {
    taint.key == taints::NOT_READY || taint.key == taints::UNREACHABLE
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    // An empty key with Exists tolerates everything.
    let key_matches = match toleration.key.as_deref() {
        None | Some("") => toleration.operator.as_deref() == Some("Exists"),
        Some(key) => key == taint.key,
    };
    if !key_matches {
        return false;
    }
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    match toleration.operator.as_deref() {
        Some("Exists") => true,
        // Equal is the default operator.
        _ => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
    }
}

/// The first NoSchedule/NoExecute taint the pod does not tolerate, after
/// dropping ephemeral taints and any in the explicit skip list (a pool's
/// startup taints while the node is in-flight).
pub fn untolerated<'a>(pod: &Pod, node_taints: &'a [Taint], skip: &[Taint]) -> Option<&'a Taint> {
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or(&[]);
    node_taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .filter(|t| !is_ephemeral(t))
        .filter(|t| !skip.iter().any(|s| s.key == t.key && s.effect == t.effect))
        .find(|taint| !tolerations.iter().any(|tol| tolerates(tol, taint)))
}

/// True iff the pod tolerates the unschedulable taint; such pods are skipped
/// during drain because they would immediately reschedule onto the cordoned
/// node.
pub fn tolerates_unschedulable(pod: &Pod) -> bool {
    let unschedulable = Taint {
        key: taints::UNSCHEDULABLE.to_string(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    };
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .is_some_and(|ts| ts.iter().any(|tol| tolerates(tol, &unschedulable)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: (!value.is_empty()).then(|| value.to_string()),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    fn pod_tolerating(tolerations: Vec<Toleration>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                tolerations: Some(tolerations),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn equal_toleration_matches_key_value_effect() {
        let pod = pod_tolerating(vec![Toleration {
            key: Some("dedicated".to_string()),
            operator: Some("Equal".to_string()),
            value: Some("batch".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]);
        assert!(untolerated(&pod, &[taint("dedicated", "batch", "NoSchedule")], &[]).is_none());
        assert!(untolerated(&pod, &[taint("dedicated", "web", "NoSchedule")], &[]).is_some());
    }

    #[test]
    fn empty_key_exists_tolerates_everything() {
        let pod = pod_tolerating(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]);
        assert!(untolerated(&pod, &[taint("anything", "x", "NoExecute")], &[]).is_none());
    }

    #[test]
    fn ephemeral_and_skipped_taints_are_discounted() {
        let pod = pod_tolerating(vec![]);
        let startup = taint("bootstrap.example.com/agent", "", "NoSchedule");
        assert!(untolerated(&pod, &[taint(taints::NOT_READY, "", "NoSchedule")], &[]).is_none());
        assert!(
            untolerated(&pod, std::slice::from_ref(&startup), std::slice::from_ref(&startup))
                .is_none()
        );
        assert!(untolerated(&pod, std::slice::from_ref(&startup), &[]).is_some());
    }

    #[test]
    fn prefer_no_schedule_never_blocks() {
        let pod = pod_tolerating(vec![]);
        assert!(untolerated(&pod, &[taint("soft", "", "PreferNoSchedule")], &[]).is_none());
    }
}
