use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::jiff::Timestamp;
use kube::api::ListParams;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{
    Api, Resource, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use stratus_common::{CRITICAL_PRIORITY_CLASSES, TERMINATION_FINALIZER, annotations, labels};
use stratus_types::*;
use tokio::{sync::Mutex, time::Duration};

use super::actions;
use super::evict::{EvictionQueue, EvictionTarget};
use crate::cloudprovider::CloudProvider;
use crate::scheduling::taints::tolerates_unschedulable;
use crate::util::{
    Error,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// A pod deleting for longer than this is stuck-terminating and no longer
/// blocks drain.
const STUCK_TERMINATING: Duration = Duration::from_secs(60);

/// Entrypoint for the termination controller. Reconciles NodeClaims whose
/// deletion timestamp is set, holding the termination finalizer until the
/// cloud instance is confirmed gone.
pub async fn run(
    client: Client,
    cloud: Arc<dyn CloudProvider>,
    evictions: EvictionQueue,
) -> Result<(), Error> {
    println!("{}", "⚙️ Starting termination controller...".green());
    let context = Arc::new(ContextData::new(client.clone(), cloud, evictions));
    let claims: Api<NodeClaim> = Api::all(client.clone());
    Controller::new(claims, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    Ok(())
}

struct ContextData {
    client: Client,
    cloud: Arc<dyn CloudProvider>,
    evictions: EvictionQueue,
    recorder: Recorder,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<String, (TerminateAction, Instant)>>,
}

impl ContextData {
    fn new(client: Client, cloud: Arc<dyn CloudProvider>, evictions: EvictionQueue) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "stratus-termination".to_string(),
                instance: None,
            },
        );
        ContextData {
            client,
            cloud,
            evictions,
            recorder,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("termination"),
            last_action: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum TerminateAction {
    /// Mark the node unschedulable and out of load balancers.
    Cordon { node_name: String },

    /// Evict the given tier of pods.
    Drain { targets: Vec<EvictionTarget> },

    /// Evictions are in flight; check again shortly.
    AwaitDrain { remaining: usize },

    /// A do-not-evict pod pins the node in Terminating.
    Blocked { pod: String },

    /// Nothing evictable remains: delete the instance and release the
    /// finalizer.
    Finalize { node_name: Option<String> },

    NoOp,
}

impl TerminateAction {
    fn to_str(&self) -> &str {
        match self {
            TerminateAction::Cordon { .. } => "Cordon",
            TerminateAction::Drain { .. } => "Drain",
            TerminateAction::AwaitDrain { .. } => "AwaitDrain",
            TerminateAction::Blocked { .. } => "Blocked",
            TerminateAction::Finalize { .. } => "Finalize",
            TerminateAction::NoOp => "NoOp",
        }
    }
}

async fn reconcile(claim: Arc<NodeClaim>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();
    let name = claim.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(&context, &claim).await?;

    if action != TerminateAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(name.clone(), (action.clone(), Instant::now()))
        };
        if value.is_none_or(|(last_action, last_instant)| {
            action != last_action || last_instant.elapsed() > Duration::from_secs(300)
        }) {
            println!(
                "🔧 {}{}{}",
                name.color(FG2),
                " TERMINATION: ".color(FG1),
                action.to_str().color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, action.to_str()])
        .inc();

    let result = match action {
        TerminateAction::Cordon { node_name } => {
            let nodes: Api<Node> = Api::all(client.clone());
            let node = nodes.get(&node_name).await?;
            actions::mark_terminating(client.clone(), &claim).await?;
            actions::cordon(client, &node).await?;
            Action::requeue(Duration::from_secs(1))
        }
        TerminateAction::Drain { targets } => {
            context.evictions.enqueue(targets);
            Action::requeue(Duration::from_secs(5))
        }
        TerminateAction::AwaitDrain { .. } => Action::requeue(Duration::from_secs(5)),
        TerminateAction::Blocked { pod } => {
            let _ = context
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "DrainBlocked".to_string(),
                        note: Some(format!("pod '{}' has the do-not-evict annotation", pod)),
                        action: "Draining".to_string(),
                        secondary: None,
                    },
                    &claim.object_ref(&()),
                )
                .await;
            Action::requeue(Duration::from_secs(10))
        }
        TerminateAction::Finalize { node_name } => {
            let node = match node_name {
                Some(node_name) => {
                    let nodes: Api<Node> = Api::all(client.clone());
                    nodes.get_opt(&node_name).await?
                }
                None => None,
            };
            actions::finalize(
                client,
                &context.cloud,
                &claim,
                node.as_ref(),
                termination_reason(&claim),
            )
            .await?;
            Action::await_change()
        }
        TerminateAction::NoOp => Action::await_change(),
    };

    Ok(result)
}

/// Why the claim is going away, for the termination metrics.
fn termination_reason(claim: &NodeClaim) -> &'static str {
    if claim.is_condition_true(conditions::EXPIRED) {
        return "expiration";
    }
    if claim.is_condition_true(conditions::EMPTY) {
        return "emptiness";
    }
    if !claim.is_condition_true(conditions::REGISTERED) {
        return "liveness";
    }
    "deletion"
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_static(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "Node"))
}

fn is_stuck_terminating(pod: &Pod) -> bool {
    pod.metadata
        .deletion_timestamp
        .as_ref()
        .map(|t| {
            let age: Duration = Timestamp::now()
                .duration_since(t.0)
                .try_into()
                .unwrap_or(Duration::ZERO);
            age > STUCK_TERMINATING
        })
        .unwrap_or(false)
}

fn has_do_not_evict(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::DO_NOT_EVICT))
        .is_some_and(|v| v == "true")
}

fn is_critical(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.priority_class_name.as_deref())
        .is_some_and(|pc| CRITICAL_PRIORITY_CLASSES.contains(&pc))
}

fn eviction_target(pod: &Pod) -> EvictionTarget {
    EvictionTarget {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        uid: pod.metadata.uid.clone().unwrap_or_else(|| pod.name_any()),
    }
}

async fn determine_action(
    context: &ContextData,
    claim: &NodeClaim,
) -> Result<TerminateAction, Error> {
    if claim.metadata.deletion_timestamp.is_none() {
        return Ok(TerminateAction::NoOp);
    }
    if !claim
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|fs| fs.iter().any(|f| f == TERMINATION_FINALIZER))
    {
        return Ok(TerminateAction::NoOp);
    }

    // Never launched: nothing to drain, nothing to delete in the cloud.
    let Some(provider_id) = claim.provider_id().map(String::from) else {
        return Ok(TerminateAction::Finalize { node_name: None });
    };

    let nodes: Api<Node> = Api::all(context.client.clone());
    let node = nodes
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .find(|n| {
            n.spec.as_ref().and_then(|s| s.provider_id.as_deref()) == Some(provider_id.as_str())
        });
    let Some(node) = node else {
        // The node never registered or is already gone; go straight to the
        // cloud delete.
        return Ok(TerminateAction::Finalize { node_name: None });
    };
    let node_name = node.name_any();

    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
        && node.labels().contains_key(labels::EXCLUDE_FROM_LOAD_BALANCERS);
    if !cordoned {
        return Ok(TerminateAction::Cordon { node_name });
    }

    let pods_api: Api<Pod> = Api::all(context.client.clone());
    let bound = pods_api
        .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
        .await?
        .items;

    // Pods the drain still owes an eviction or a wait.
    let remaining: Vec<&Pod> = bound
        .iter()
        .filter(|p| !is_terminal(p))
        .filter(|p| !is_static(p))
        .filter(|p| !is_stuck_terminating(p))
        .filter(|p| !tolerates_unschedulable(p))
        .collect();

    if remaining.is_empty() {
        return Ok(TerminateAction::Finalize {
            node_name: Some(node_name),
        });
    }

    if let Some(blocked) = remaining.iter().find(|p| has_do_not_evict(p)) {
        return Ok(TerminateAction::Blocked {
            pod: blocked.name_any(),
        });
    }

    // Pods already deleting just need time.
    let evictable: Vec<&&Pod> = remaining
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();
    if evictable.is_empty() {
        return Ok(TerminateAction::AwaitDrain {
            remaining: remaining.len(),
        });
    }

    // Two tiers: the critical pods hold the node's plumbing up and leave
    // only after everything else is gone.
    let non_critical: Vec<EvictionTarget> = evictable
        .iter()
        .filter(|p| !is_critical(p))
        .map(|p| eviction_target(p))
        .collect();
    let targets = if non_critical.is_empty() {
        evictable.iter().map(|p| eviction_target(p)).collect()
    } else {
        non_critical
    };
    Ok(TerminateAction::Drain { targets })
}

fn on_error(claim: Arc<NodeClaim>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Termination reconciliation error: {:?} on '{}'",
            error,
            claim.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn pod_named(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn critical_pods_are_recognized_by_priority_class() {
        let mut pod = pod_named("coredns");
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            priority_class_name: Some("system-cluster-critical".to_string()),
            ..Default::default()
        });
        assert!(is_critical(&pod));
        assert!(!is_critical(&pod_named("app")));
    }

    #[test]
    fn stuck_terminating_pods_age_out_of_the_drain() {
        let mut pod = pod_named("stuck");
        pod.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                Timestamp::now()
                    - k8s_openapi::jiff::SignedDuration::try_from(Duration::from_secs(120))
                        .unwrap(),
            ),
        );
        assert!(is_stuck_terminating(&pod));
        pod.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                Timestamp::now()
                    - k8s_openapi::jiff::SignedDuration::try_from(Duration::from_secs(5)).unwrap(),
            ),
        );
        assert!(!is_stuck_terminating(&pod));
    }

    #[test]
    fn termination_reason_prefers_specific_conditions() {
        let mut claim = NodeClaim::default();
        claim.status = Some(NodeClaimStatus::default());
        // Unregistered claims die for liveness.
        assert_eq!(termination_reason(&claim), "liveness");
        let now = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Timestamp::now());
        claim.status.as_mut().unwrap().set_condition(
            conditions::REGISTERED,
            true,
            "NodeRegistered",
            "",
            now.clone(),
        );
        assert_eq!(termination_reason(&claim), "deletion");
        claim.status.as_mut().unwrap().set_condition(
            conditions::EMPTY,
            true,
            "NoWorkloadPods",
            "",
            now.clone(),
        );
        assert_eq!(termination_reason(&claim), "emptiness");
        claim
            .status
            .as_mut()
            .unwrap()
            .set_condition(conditions::EXPIRED, true, "Expired", "", now);
        assert_eq!(termination_reason(&claim), "expiration");
    }
}
