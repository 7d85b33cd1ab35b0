use crate::resources::{self, CPU, MEMORY};
use crate::topology;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

fn priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

/// Orders the batch: priority descending, then total resource request
/// descending (first-fit-decreasing packs best when big pods go first),
/// with names breaking ties so identical inputs yield identical rounds.
/// Within a priority band, pods carrying pod (anti-)affinity terms go last:
/// their placement depends on where the plain pods land.
pub fn sort_pods(pods: &mut [Pod]) {
    pods.sort_by_cached_key(|pod| {
        let requests = resources::pod_requests(pod);
        (
            std::cmp::Reverse(priority(pod)),
            topology::has_pod_affinity_terms(pod),
            std::cmp::Reverse(requests.get(CPU).copied().unwrap_or(0)),
            std::cmp::Reverse(requests.get(MEMORY).copied().unwrap_or(0)),
            pod.name_any(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn pod(name: &str, priority: Option<i32>, cpu: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                priority,
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            [("cpu".to_string(), Quantity(cpu.to_string()))]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn names(pods: &[Pod]) -> Vec<String> {
        pods.iter().map(|p| p.name_any()).collect()
    }

    #[test]
    fn priority_dominates_size() {
        let mut pods = vec![pod("big", None, "4"), pod("urgent", Some(1000), "100m")];
        sort_pods(&mut pods);
        assert_eq!(names(&pods), vec!["urgent", "big"]);
    }

    #[test]
    fn larger_requests_first_within_a_priority_band() {
        let mut pods = vec![
            pod("small", None, "100m"),
            pod("large", None, "4"),
            pod("medium", None, "1"),
        ];
        sort_pods(&mut pods);
        assert_eq!(names(&pods), vec!["large", "medium", "small"]);
    }

    #[test]
    fn ties_break_by_name() {
        let mut pods = vec![pod("b", None, "1"), pod("a", None, "1")];
        sort_pods(&mut pods);
        assert_eq!(names(&pods), vec!["a", "b"]);
    }
}
