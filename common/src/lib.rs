pub mod shutdown;
pub mod wait;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Well-known label keys. The platform keys are bit-exact copies of the
/// orchestrator's; the `autoscaling.stratus.dev` keys are owned by this
/// controller.
pub mod labels {
    pub const TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const ARCH: &str = "kubernetes.io/arch";
    pub const OS: &str = "kubernetes.io/os";
    pub const HOSTNAME: &str = "kubernetes.io/hostname";

    pub const NODE_POOL: &str = "autoscaling.stratus.dev/nodepool";
    pub const CAPACITY_TYPE: &str = "autoscaling.stratus.dev/capacity-type";
    pub const INITIALIZED: &str = "autoscaling.stratus.dev/initialized";
    pub const REGISTERED: &str = "autoscaling.stratus.dev/registered";
    pub const LAUNCHED: &str = "autoscaling.stratus.dev/launched";

    /// Applied while draining so services stop routing through the node.
    pub const EXCLUDE_FROM_LOAD_BALANCERS: &str =
        "node.kubernetes.io/exclude-from-external-load-balancers";
}

pub mod annotations {
    /// Blocks eviction of a pod during drain; the node stays Terminating.
    pub const DO_NOT_EVICT: &str = "autoscaling.stratus.dev/do-not-evict";
    pub const CREATED_BY: &str = "autoscaling.stratus.dev/created-by";
    pub const SPEC_HASH: &str = "autoscaling.stratus.dev/spec-hash";
}

pub mod taints {
    /// Ephemeral taints the kubelet adds before a node settles; never count
    /// against toleration checks.
    pub const NOT_READY: &str = "node.kubernetes.io/not-ready";
    pub const UNREACHABLE: &str = "node.kubernetes.io/unreachable";
    pub const UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";
}

/// Removed only after the cloud instance is confirmed deleted.
pub const TERMINATION_FINALIZER: &str = "autoscaling.stratus.dev/termination";

pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Priority classes evicted last during drain.
pub const CRITICAL_PRIORITY_CLASSES: &[&str] =
    &["system-cluster-critical", "system-node-critical"];
