use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::jiff::Timestamp;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use stratus_common::labels;
use stratus_types::*;
use tokio::{sync::Mutex, time::Duration};

use super::actions;
use crate::cloudprovider::{CloudProvider, UnavailableOfferings};
use crate::state::ClusterState;
use crate::util::{
    self, Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `NodeClaim` lifecycle controller.
pub async fn run(
    client: Client,
    state: ClusterState,
    cloud: Arc<dyn CloudProvider>,
    unavailable: Arc<UnavailableOfferings>,
    ttl_after_not_registered: Duration,
) -> Result<(), Error> {
    println!("{}", "⚙️ Starting NodeClaim lifecycle controller...".green());
    let context = Arc::new(ContextData::new(
        client.clone(),
        state,
        cloud,
        unavailable,
        ttl_after_not_registered,
    ));
    let claims: Api<NodeClaim> = Api::all(client.clone());
    Controller::new(claims, Default::default())
        .owns(Api::<Node>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    Ok(())
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    client: Client,
    state: ClusterState,
    cloud: Arc<dyn CloudProvider>,
    unavailable: Arc<UnavailableOfferings>,
    ttl_after_not_registered: Duration,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<String, (ClaimAction, Instant)>>,
}

impl ContextData {
    fn new(
        client: Client,
        state: ClusterState,
        cloud: Arc<dyn CloudProvider>,
        unavailable: Arc<UnavailableOfferings>,
        ttl_after_not_registered: Duration,
    ) -> Self {
        ContextData {
            client,
            state,
            cloud,
            unavailable,
            ttl_after_not_registered,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("nodeclaims"),
            last_action: Mutex::new(HashMap::new()),
        }
    }
}

/// Action to be taken upon a `NodeClaim` resource during reconciliation.
#[derive(Debug, PartialEq, Clone)]
enum ClaimAction {
    /// Ask the cloud provider for an instance.
    Launch,

    /// A Node with our provider-id appeared; adopt it.
    Register { node_name: String },

    /// The registered node went Ready with startup taints removed.
    Initialize { node_name: String },

    MarkEmpty,
    ClearEmpty,
    MarkDrifted { message: String },

    /// Launched but never registered within the TTL.
    DeleteLiveness,
    DeleteEmptiness,
    DeleteExpired,

    /// Fatal; surfaced as a condition and not retried.
    InvariantViolation {
        reason: &'static str,
        message: String,
    },

    NoOp,

    Requeue(Duration),
}

impl ClaimAction {
    fn to_str(&self) -> &str {
        match self {
            ClaimAction::Launch => "Launch",
            ClaimAction::Register { .. } => "Register",
            ClaimAction::Initialize { .. } => "Initialize",
            ClaimAction::MarkEmpty => "MarkEmpty",
            ClaimAction::ClearEmpty => "ClearEmpty",
            ClaimAction::MarkDrifted { .. } => "MarkDrifted",
            ClaimAction::DeleteLiveness => "DeleteLiveness",
            ClaimAction::DeleteEmptiness => "DeleteEmptiness",
            ClaimAction::DeleteExpired => "DeleteExpired",
            ClaimAction::InvariantViolation { .. } => "InvariantViolation",
            ClaimAction::NoOp => "NoOp",
            ClaimAction::Requeue(_) => "Requeue",
        }
    }
}

fn age_of(time: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Time) -> Duration {
    Timestamp::now()
        .duration_since(time.0)
        .try_into()
        .unwrap_or(Duration::ZERO)
}

fn condition_age(claim: &NodeClaim, type_: &str) -> Option<Duration> {
    claim
        .condition(type_)
        .map(|c| age_of(&c.last_transition_time))
}

/// Reconciliation function for the `NodeClaim` resource.
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

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(&context, &claim).await?;

    if action != ClaimAction::NoOp {
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
                " ACTION: ".color(FG1),
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

    #[cfg(feature = "metrics")]
    let timer = match action {
        ClaimAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, action.to_str()])
                .start_timer(),
        ),
    };

    // Write phase: perform the action decided above.
    let result = match action {
        ClaimAction::Launch => {
            actions::launch(client, &context.cloud, &context.unavailable, &claim).await?;
            Action::requeue(Duration::from_secs(5))
        }
        ClaimAction::Register { node_name } => {
            let nodes: Api<Node> = Api::all(client.clone());
            let node = nodes.get(&node_name).await?;
            actions::register(client, &claim, &node).await?;
            Action::requeue(Duration::from_secs(5))
        }
        ClaimAction::Initialize { node_name } => {
            let nodes: Api<Node> = Api::all(client.clone());
            let node = nodes.get(&node_name).await?;
            actions::initialize(client, &claim, &node).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        ClaimAction::MarkEmpty => {
            actions::mark_empty(client, &claim).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        ClaimAction::ClearEmpty => {
            actions::clear_empty(client, &claim).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        ClaimAction::MarkDrifted { message } => {
            actions::mark_drifted(client, &claim, message).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        ClaimAction::DeleteLiveness => {
            actions::delete_claim(client, &claim, "never registered within TTL").await?;
            Action::await_change()
        }
        ClaimAction::DeleteEmptiness => {
            actions::delete_claim(client, &claim, "empty past the pool TTL").await?;
            Action::await_change()
        }
        ClaimAction::DeleteExpired => {
            actions::mark_expired(client.clone(), &claim).await?;
            actions::delete_claim(client, &claim, "exceeded the pool lifetime").await?;
            Action::await_change()
        }
        ClaimAction::InvariantViolation { reason, message } => {
            actions::invariant_violation(client, &claim, reason, message).await?;
            Action::await_change()
        }
        ClaimAction::Requeue(duration) => Action::requeue(duration),
        ClaimAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Looks at the state of the claim and the cluster and decides the next
/// action. The finite set of possible actions is the `ClaimAction` enum.
async fn determine_action(
    context: &ContextData,
    claim: &NodeClaim,
) -> Result<ClaimAction, Error> {
    // Deletion is the termination controller's job.
    if claim.metadata.deletion_timestamp.is_some() {
        return Ok(ClaimAction::NoOp);
    }

    if !claim.is_condition_true(conditions::LAUNCHED) {
        // A failed launch is terminal until an operator intervenes.
        if claim
            .status
            .as_ref()
            .is_some_and(|s| s.phase == NodeClaimPhase::Failed)
        {
            return Ok(ClaimAction::NoOp);
        }
        return Ok(ClaimAction::Launch);
    }

    let Some(pool_name) = claim
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::NODE_POOL))
        .cloned()
    else {
        return Ok(ClaimAction::InvariantViolation {
            reason: conditions::reasons::MISSING_OWNER_POOL,
            message: "NodeClaim carries no owning pool label".to_string(),
        });
    };
    let pools: Api<NodePool> = Api::all(context.client.clone());
    let Some(pool) = pools.get_opt(&pool_name).await? else {
        return Ok(ClaimAction::InvariantViolation {
            reason: conditions::reasons::MISSING_OWNER_POOL,
            message: format!("owning pool '{}' does not exist", pool_name),
        });
    };

    if let Some(expire_after) = pool
        .spec
        .disruption
        .expire_after
        .as_ref()
        .filter(|s| !s.is_empty())
    {
        let ttl = parse_duration::parse(expire_after)?;
        if let Some(created) = claim.metadata.creation_timestamp.as_ref() {
            if age_of(created) > ttl {
                return Ok(ClaimAction::DeleteExpired);
            }
        }
    }

    let template_hash = util::hash_spec(&pool.spec.template);
    let recorded_hash = claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(stratus_common::annotations::SPEC_HASH));
    if recorded_hash.is_some_and(|h| h != &template_hash)
        && !claim.is_condition_true(conditions::DRIFTED)
    {
        return Ok(ClaimAction::MarkDrifted {
            message: format!("pool '{}' template changed since launch", pool_name),
        });
    }

    let Some(provider_id) = claim.provider_id().map(String::from) else {
        // Launched without a provider id is a status write race; retry soon.
        return Ok(ClaimAction::Requeue(Duration::from_secs(5)));
    };

    if !claim.is_condition_true(conditions::REGISTERED) {
        let nodes: Api<Node> = Api::all(context.client.clone());
        let matching: Vec<Node> = nodes
            .list(&Default::default())
            .await?
            .items
            .into_iter()
            .filter(|n| {
                n.spec
                    .as_ref()
                    .and_then(|s| s.provider_id.as_deref())
                    == Some(provider_id.as_str())
            })
            .collect();
        return Ok(match matching.len() {
            0 => {
                let launched_for =
                    condition_age(claim, conditions::LAUNCHED).unwrap_or(Duration::ZERO);
                if launched_for > context.ttl_after_not_registered {
                    ClaimAction::DeleteLiveness
                } else {
                    ClaimAction::Requeue(Duration::from_secs(30))
                }
            }
            1 => ClaimAction::Register {
                node_name: matching[0].name_any(),
            },
            _ => ClaimAction::InvariantViolation {
                reason: conditions::reasons::DUPLICATE_PROVIDER_ID,
                message: format!(
                    "nodes [{}] share provider id {}",
                    matching
                        .iter()
                        .map(|n| n.name_any())
                        .collect::<Vec<_>>()
                        .join(", "),
                    provider_id
                ),
            },
        });
    }

    if !claim.is_condition_true(conditions::INITIALIZED) {
        let Some(node_name) = claim.status.as_ref().and_then(|s| s.node_name.clone()) else {
            return Ok(ClaimAction::Requeue(Duration::from_secs(5)));
        };
        let nodes: Api<Node> = Api::all(context.client.clone());
        let Some(node) = nodes.get_opt(&node_name).await? else {
            return Ok(ClaimAction::Requeue(Duration::from_secs(30)));
        };
        if node_ready_for_initialization(claim, &node) {
            return Ok(ClaimAction::Initialize { node_name });
        }
        return Ok(ClaimAction::Requeue(PROBE_INTERVAL));
    }

    // Emptiness bookkeeping drives the pool's scale-to-zero TTL.
    let has_workload_pods = context
        .state
        .node_by_provider_id(&provider_id)
        .map(|entry| entry.has_non_daemonset_pods())
        .unwrap_or(true);
    if !has_workload_pods {
        if !claim.is_condition_true(conditions::EMPTY) {
            return Ok(ClaimAction::MarkEmpty);
        }
        if let Some(ttl_after_empty) = pool
            .spec
            .disruption
            .ttl_after_empty
            .as_ref()
            .filter(|s| !s.is_empty())
        {
            let ttl = parse_duration::parse(ttl_after_empty)?;
            let empty_for = condition_age(claim, conditions::EMPTY).unwrap_or(Duration::ZERO);
            if empty_for > ttl {
                return Ok(ClaimAction::DeleteEmptiness);
            }
        }
    } else if claim.condition(conditions::EMPTY).is_some() {
        return Ok(ClaimAction::ClearEmpty);
    }

    Ok(ClaimAction::NoOp)
}

/// Ready condition True, every startup taint gone, and a non-zero pod
/// capacity reported.
fn node_ready_for_initialization(claim: &NodeClaim, node: &Node) -> bool {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    if !ready {
        return false;
    }
    let node_taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or(&[]);
    let startup_gone = claim
        .spec
        .startup_taints
        .iter()
        .all(|s| !node_taints.iter().any(|t| t.key == s.key && t.effect == s.effect));
    if !startup_gone {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("pods"))
        .and_then(crate::resources::parse_quantity)
        .unwrap_or(0)
        > 0
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(claim: Arc<NodeClaim>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "NodeClaim reconciliation error: {:?} on '{}'",
            error,
            claim.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
