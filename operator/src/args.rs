use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "stratus-operator", about = "Just-in-time node autoscaler")]
pub struct Args {
    /// Port to serve Prometheus metrics on; disabled when unset
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Namespace holding the leader-election lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Run without leader election (single-replica deployments)
    #[arg(long, env = "DISABLE_LEADER_ELECTION", default_value_t = false)]
    pub disable_leader_election: bool,

    /// Seconds between scheduling rounds
    #[arg(long, env = "BATCH_PERIOD_SECONDS", default_value_t = 10)]
    pub batch_period_seconds: u64,

    /// How long a launched claim may sit unregistered before it is retired,
    /// e.g. "15m"
    #[arg(long, env = "TTL_AFTER_NOT_REGISTERED", default_value = "15m")]
    pub ttl_after_not_registered: String,

    /// Seconds between instance garbage-collection sweeps
    #[arg(long, env = "GC_INTERVAL_SECONDS", default_value_t = 120)]
    pub gc_interval_seconds: u64,

    /// Seconds a fresh launch is sheltered from garbage collection
    #[arg(long, env = "GC_LAUNCH_GRACE_SECONDS", default_value_t = 10)]
    pub gc_launch_grace_seconds: u64,

    /// Global evictions per second during drain
    #[arg(long, env = "EVICTION_RATE", default_value_t = 10.0)]
    pub eviction_rate: f64,

    /// Eviction burst size
    #[arg(long, env = "EVICTION_BURST", default_value_t = 100)]
    pub eviction_burst: u32,
}
