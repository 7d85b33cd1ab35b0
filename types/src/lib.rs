use k8s_openapi::api::core::v1::{NodeSelectorRequirement, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// Condition types reported on a [`NodeClaim`]. The set is monotone: once a
/// condition is `True` it stays `True` until the claim terminates.
pub mod conditions {
    pub const LAUNCHED: &str = "Launched";
    pub const REGISTERED: &str = "Registered";
    pub const INITIALIZED: &str = "Initialized";
    pub const EMPTY: &str = "Empty";
    pub const DRIFTED: &str = "Drifted";
    pub const EXPIRED: &str = "Expired";

    pub mod reasons {
        pub const DUPLICATE_PROVIDER_ID: &str = "DuplicateProviderID";
        pub const MISSING_OWNER_POOL: &str = "MissingOwnerPool";
        pub const INSUFFICIENT_CAPACITY: &str = "InsufficientCapacity";
        pub const LAUNCH_FAILED: &str = "LaunchFailed";
    }
}

/// Reference to the cloud-specific class object that parameterizes launched
/// instances. The core treats it as opaque and hands it to the cloud provider.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    pub group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    pub max_pods: Option<i32>,
    pub cluster_dns: Option<Vec<String>>,
    pub system_reserved: Option<BTreeMap<String, String>>,
    pub kube_reserved: Option<BTreeMap<String, String>>,
    pub eviction_hard: Option<BTreeMap<String, String>>,
}

/// The shape of nodes a pool produces. Everything here is stamped onto the
/// NodeClaims the scheduler emits for this pool.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Taints removed by an external bootstrap agent once the node is ready
    /// for ordinary workloads. Present while the node is in-flight only.
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    pub node_class_ref: NodeClassReference,
    pub kubelet: Option<KubeletConfiguration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    /// How long a node may sit without non-daemonset pods before it is
    /// retired, e.g. "30s". Unset disables emptiness-based retirement.
    pub ttl_after_empty: Option<String>,
    /// Maximum node lifetime, e.g. "720h". Unset disables expiry.
    pub expire_after: Option<String>,
    #[serde(default)]
    pub budgets: Vec<DisruptionBudget>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    /// Number or percentage of this pool's nodes that may be voluntarily
    /// disrupted at once, e.g. "10%".
    pub nodes: String,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaling.stratus.dev",
    version = "v1",
    kind = "NodePool",
    plural = "nodepools",
    derive = "PartialEq",
    status = "NodePoolStatus"
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.weight\", \"name\": \"WEIGHT\", \"type\": \"integer\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub template: NodeClaimTemplate,
    #[serde(default)]
    pub disruption: DisruptionSpec,
    /// Ceiling on the total capacity of nodes launched from this pool.
    #[serde(default)]
    pub limits: BTreeMap<String, Quantity>,
    /// Pools are consulted highest weight first; name breaks ties.
    #[serde(default)]
    pub weight: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Capacity of all launched and in-flight nodes owned by this pool,
    /// compared against `spec.limits` before each launch.
    #[serde(default)]
    pub resources: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaling.stratus.dev",
    version = "v1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    derive = "PartialEq",
    status = "NodeClaimStatus"
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".metadata.labels.node\\\\.kubernetes\\\\.io/instance-type\", \"name\": \"TYPE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".metadata.labels.topology\\\\.kubernetes\\\\.io/zone\", \"name\": \"ZONE\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    #[serde(default)]
    pub requirements: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub resources: ResourceRequests,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    /// Instance types able to satisfy this claim, cheapest first. The cloud
    /// provider may substitute within this list if the head is unavailable.
    #[serde(default)]
    pub instance_types: Vec<String>,
    pub node_class_ref: NodeClassReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    pub phase: NodeClaimPhase,
    pub provider_id: Option<String>,
    pub node_name: Option<String>,
    #[serde(default)]
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub allocatable: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Last time a non-daemonset pod was bound to or removed from the node.
    /// Drives the pool's emptiness TTL.
    pub last_pod_event_time: Option<Time>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum NodeClaimPhase {
    #[default]
    Pending,
    Launched,
    Registered,
    Ready,
    Terminating,
    Failed,
}

impl FromStr for NodeClaimPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(NodeClaimPhase::Pending),
            "Launched" => Ok(NodeClaimPhase::Launched),
            "Registered" => Ok(NodeClaimPhase::Registered),
            "Ready" => Ok(NodeClaimPhase::Ready),
            "Terminating" => Ok(NodeClaimPhase::Terminating),
            "Failed" => Ok(NodeClaimPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for NodeClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeClaimPhase::Pending => write!(f, "Pending"),
            NodeClaimPhase::Launched => write!(f, "Launched"),
            NodeClaimPhase::Registered => write!(f, "Registered"),
            NodeClaimPhase::Ready => write!(f, "Ready"),
            NodeClaimPhase::Terminating => write!(f, "Terminating"),
            NodeClaimPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl NodeClaim {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.status == "True")
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.status.as_ref()?.provider_id.as_deref()
    }
}

impl NodeClaimStatus {
    /// Sets a condition, keeping the set monotone: a condition that is
    /// already `True` is never downgraded, and identical updates are dropped
    /// so status patches stay quiet.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: Time,
    ) {
        let status_str = if status { "True" } else { "False" };
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status == "True" && !status {
                return;
            }
            if existing.status == status_str && existing.reason == reason {
                return;
            }
            existing.status = status_str.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.last_transition_time = now;
            return;
        }
        self.conditions.push(Condition {
            last_transition_time: now,
            message: message.to_string(),
            observed_generation: None,
            reason: reason.to_string(),
            status: status_str.to_string(),
            type_: type_.to_string(),
        });
    }

    /// Drops a condition entirely. Only the re-evaluated conditions (Empty,
    /// Drifted) go away; the lifecycle conditions never do.
    pub fn remove_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }
}
