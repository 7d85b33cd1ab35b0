use k8s_openapi::api::core::v1::Pod;

/// One host-port reservation on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub ip: String,
    pub port: i32,
    pub protocol: String,
}

const WILDCARDS: &[&str] = &["", "0.0.0.0", "::"];

impl HostPort {
    /// Two uses conflict iff same port, same protocol, and overlapping IPs,
    /// where the wildcard addresses overlap everything.
    pub fn conflicts_with(&self, other: &HostPort) -> bool {
        self.port == other.port
            && self.protocol == other.protocol
            && (self.ip == other.ip
                || WILDCARDS.contains(&self.ip.as_str())
                || WILDCARDS.contains(&other.ip.as_str()))
    }
}

/// Host ports a pod would reserve.
pub fn host_ports(pod: &Pod) -> Vec<HostPort> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            p.host_port.map(|port| HostPort {
                ip: p.host_ip.clone().unwrap_or_default(),
                port,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect()
}

/// Tracks host ports in use on one (simulated) node.
#[derive(Debug, Clone, Default)]
pub struct HostPortUsage {
    used: Vec<HostPort>,
}

impl HostPortUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first conflicting reservation, if any.
    pub fn conflict(&self, wanted: &[HostPort]) -> Option<HostPort> {
        for w in wanted {
            if let Some(existing) = self.used.iter().find(|u| u.conflicts_with(w)) {
                return Some(existing.clone());
            }
        }
        None
    }

    pub fn add(&mut self, ports: impl IntoIterator<Item = HostPort>) {
        self.used.extend(ports);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp(ip: &str, port: i32, protocol: &str) -> HostPort {
        HostPort {
            ip: ip.to_string(),
            port,
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn same_port_different_protocol_is_fine() {
        assert!(!hp("10.0.0.1", 80, "TCP").conflicts_with(&hp("10.0.0.1", 80, "UDP")));
    }

    #[test]
    fn wildcard_overlaps_every_address() {
        assert!(hp("0.0.0.0", 80, "TCP").conflicts_with(&hp("10.0.0.1", 80, "TCP")));
        assert!(hp("10.0.0.1", 80, "TCP").conflicts_with(&hp("::", 80, "TCP")));
        assert!(!hp("10.0.0.1", 80, "TCP").conflicts_with(&hp("10.0.0.2", 80, "TCP")));
    }

    #[test]
    fn usage_reports_the_first_conflict() {
        let mut usage = HostPortUsage::new();
        usage.add([hp("", 443, "TCP")]);
        assert!(usage.conflict(&[hp("10.1.1.1", 443, "TCP")]).is_some());
        assert!(usage.conflict(&[hp("10.1.1.1", 8443, "TCP")]).is_none());
    }
}
