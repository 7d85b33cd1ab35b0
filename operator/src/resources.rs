//! Quantity parsing and resource-list arithmetic.
//!
//! All math is done on integer milli-units (1 cpu = 1000, 1 byte = 1000) so
//! repeated simulation rounds stay exact and deterministic.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// Resource quantities in milli-units, keyed by resource name.
pub type MilliResources = BTreeMap<String, i64>;

// Longest suffixes first so "Gi" is not mistaken for decimal "G".
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

/// Parses a Kubernetes quantity string into milli-units. Returns `None` for
/// strings that are not quantities.
pub fn parse_quantity(quantity: &Quantity) -> Option<i64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            let n: f64 = number.parse().ok()?;
            return Some((n * multiplier * 1000.0).round() as i64);
        }
    }
    let n: f64 = s.parse().ok()?;
    Some((n * 1000.0).round() as i64)
}

/// Formats milli-units back into a quantity string: whole units where exact,
/// otherwise the "m" suffix.
pub fn format_milli(value: i64) -> Quantity {
    if value % 1000 == 0 {
        Quantity(format!("{}", value / 1000))
    } else {
        Quantity(format!("{}m", value))
    }
}

pub fn from_quantity_map(map: &BTreeMap<String, Quantity>) -> MilliResources {
    map.iter()
        .filter_map(|(k, v)| parse_quantity(v).map(|m| (k.clone(), m)))
        .collect()
}

pub fn to_quantity_map(resources: &MilliResources) -> BTreeMap<String, Quantity> {
    resources
        .iter()
        .map(|(k, v)| (k.clone(), format_milli(*v)))
        .collect()
}

pub fn add_assign(target: &mut MilliResources, other: &MilliResources) {
    for (key, value) in other {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

pub fn subtract(left: &MilliResources, right: &MilliResources) -> MilliResources {
    let mut out = left.clone();
    for (key, value) in right {
        *out.entry(key.clone()).or_insert(0) -= value;
    }
    out
}

/// Clamps every negative entry to zero. Negative remainders arise when pods
/// the controller did not anticipate bind to a node.
pub fn clamp_non_negative(resources: &MilliResources) -> MilliResources {
    resources
        .iter()
        .map(|(k, v)| (k.clone(), (*v).max(0)))
        .collect()
}

/// True iff every requested resource is covered by `available`. A resource
/// absent from `available` counts as zero.
pub fn fits(requests: &MilliResources, available: &MilliResources) -> bool {
    requests
        .iter()
        .all(|(key, requested)| *requested <= available.get(key).copied().unwrap_or(0))
}

/// Per-resource max of two resource lists.
pub fn max_resources(left: &MilliResources, right: &MilliResources) -> MilliResources {
    let mut out = left.clone();
    for (key, value) in right {
        let entry = out.entry(key.clone()).or_insert(0);
        *entry = (*entry).max(*value);
    }
    out
}

fn container_requests(pod: &Pod, init: bool) -> MilliResources {
    let mut total = MilliResources::new();
    let Some(spec) = pod.spec.as_ref() else {
        return total;
    };
    let containers = if init {
        spec.init_containers.as_deref().unwrap_or(&[])
    } else {
        &spec.containers[..]
    };
    for container in containers {
        if let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
        {
            add_assign(&mut total, &from_quantity_map(requests));
        }
    }
    total
}

/// Effective requests of a pod: the sum over primary containers, maxed
/// per-resource against the sum over init containers. Init containers run
/// serially before primary containers, so the peak is a max, not a sum.
pub fn pod_requests(pod: &Pod) -> MilliResources {
    max_resources(
        &container_requests(pod, false),
        &container_requests(pod, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};

    fn quantity(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn pod_with_requests(containers: &[&[(&str, &str)]], inits: &[&[(&str, &str)]]) -> Pod {
        let build = |requests: &[(&str, &str)]| Container {
            resources: Some(ResourceRequirements {
                requests: Some(
                    requests
                        .iter()
                        .map(|(k, v)| (k.to_string(), quantity(v)))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        Pod {
            spec: Some(PodSpec {
                containers: containers.iter().map(|r| build(r)).collect(),
                init_containers: if inits.is_empty() {
                    None
                } else {
                    Some(inits.iter().map(|r| build(r)).collect())
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_plain_millis_and_binary_suffixes() {
        assert_eq!(parse_quantity(&quantity("100m")), Some(100));
        assert_eq!(parse_quantity(&quantity("2")), Some(2_000));
        assert_eq!(parse_quantity(&quantity("1.5")), Some(1_500));
        assert_eq!(parse_quantity(&quantity("10Mi")), Some(10 * 1024 * 1024 * 1000));
        assert_eq!(parse_quantity(&quantity("2Gi")), Some(2 * 1024 * 1024 * 1024 * 1000));
        assert_eq!(parse_quantity(&quantity("1k")), Some(1_000_000));
        assert_eq!(parse_quantity(&quantity("")), None);
        assert_eq!(parse_quantity(&quantity("banana")), None);
    }

    #[test]
    fn formats_whole_units_without_suffix() {
        assert_eq!(format_milli(2_000).0, "2");
        assert_eq!(format_milli(1_500).0, "1500m");
    }

    #[test]
    fn fit_requires_every_requested_resource() {
        let requests = MilliResources::from([("cpu".to_string(), 500), ("vendor/gpu".to_string(), 1_000)]);
        let cpu_only = MilliResources::from([("cpu".to_string(), 4_000)]);
        assert!(!fits(&requests, &cpu_only));
        let both = MilliResources::from([("cpu".to_string(), 4_000), ("vendor/gpu".to_string(), 2_000)]);
        assert!(fits(&requests, &both));
    }

    #[test]
    fn init_containers_are_maxed_per_resource_not_summed() {
        let pod = pod_with_requests(
            &[&[("cpu", "100m"), ("memory", "128Mi")], &[("cpu", "100m")]],
            &[&[("cpu", "500m")], &[("memory", "64Mi")]],
        );
        let requests = pod_requests(&pod);
        // init cpu (500m) exceeds the primary sum (200m); init memory (64Mi) does not.
        assert_eq!(requests["cpu"], 500);
        assert_eq!(requests["memory"], 128 * 1024 * 1024 * 1000);
    }

    #[test]
    fn negative_daemonset_remainders_clamp_to_zero() {
        let remaining = MilliResources::from([("cpu".to_string(), -300), ("memory".to_string(), 5)]);
        let clamped = clamp_non_negative(&remaining);
        assert_eq!(clamped["cpu"], 0);
        assert_eq!(clamped["memory"], 5);
    }
}
