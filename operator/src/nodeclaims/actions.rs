use crate::cloudprovider::{CloudProvider, CloudProviderError, UnavailableOfferings};
use crate::resources;
use crate::util::{Error, patch::*};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::{Api, Client, Resource, ResourceExt};
use owo_colors::OwoColorize;
use std::sync::Arc;
use stratus_common::labels;
use stratus_types::*;

use crate::util::colors::{FG1, FG2};

fn now() -> Time {
    Time::from(Timestamp::now())
}

/// Asks the cloud for an instance and records the outcome on the claim.
/// Insufficient capacity embargoes the offering and leaves the claim
/// unlaunched; the next round retries the remaining candidates.
pub async fn launch(
    client: Client,
    cloud: &Arc<dyn CloudProvider>,
    unavailable: &Arc<UnavailableOfferings>,
    claim: &NodeClaim,
) -> Result<(), Error> {
    match cloud.create(claim).await {
        Ok(machine) => {
            println!(
                "☁️ {}{}{}",
                claim.name_any().color(FG2),
                " launched as ".color(FG1),
                machine.provider_id.color(FG2),
            );
            let machine_labels = machine.labels.clone();
            let updated = patch_resource(client.clone(), claim, move |c| {
                let claim_labels = c.metadata.labels.get_or_insert_with(Default::default);
                for (key, value) in &machine_labels {
                    claim_labels.insert(key.clone(), value.clone());
                }
                claim_labels.insert(labels::LAUNCHED.to_string(), "true".to_string());
            })
            .await?;
            patch_status(client, &updated, move |status: &mut NodeClaimStatus| {
                status.provider_id = Some(machine.provider_id.clone());
                status.capacity = resources::to_quantity_map(&machine.capacity);
                status.allocatable = resources::to_quantity_map(&machine.allocatable);
                status.phase = NodeClaimPhase::Launched;
                status.set_condition(conditions::LAUNCHED, true, "Launched", "", now());
            })
            .await?;
            Ok(())
        }
        Err(CloudProviderError::InsufficientCapacity {
            instance_type,
            zone,
            capacity_type,
        }) => {
            unavailable.mark(&instance_type, &zone, &capacity_type);
            let message = format!(
                "no capacity for {} in {} ({})",
                instance_type, zone, capacity_type
            );
            patch_status(client, claim, move |status: &mut NodeClaimStatus| {
                status.set_condition(
                    conditions::LAUNCHED,
                    false,
                    conditions::reasons::INSUFFICIENT_CAPACITY,
                    &message,
                    now(),
                );
            })
            .await?;
            Ok(())
        }
        Err(CloudProviderError::Invalid(message)) => {
            patch_status(client, claim, move |status: &mut NodeClaimStatus| {
                status.phase = NodeClaimPhase::Failed;
                status.set_condition(
                    conditions::LAUNCHED,
                    false,
                    conditions::reasons::LAUNCH_FAILED,
                    &message,
                    now(),
                );
            })
            .await?;
            Ok(())
        }
        Err(e) => Err(Error::from(e)),
    }
}

/// Adopts a registered Node: owner reference, merged labels/annotations/
/// taints, and the Registered condition.
pub async fn register(client: Client, claim: &NodeClaim, node: &Node) -> Result<(), Error> {
    let owner_ref = claim.controller_owner_ref(&()).ok_or_else(|| {
        Error::UserInput(format!("NodeClaim '{}' has no metadata for an owner reference", claim.name_any()))
    })?;
    let claim_labels = claim.metadata.labels.clone().unwrap_or_default();
    let claim_annotations = claim.metadata.annotations.clone().unwrap_or_default();
    let claim_taints = claim.spec.taints.clone();
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = kube::api::Patch::Json::<Node>({
        let mut modified = node.clone();
        modified.metadata.owner_references = Some(vec![owner_ref]);
        let node_labels = modified.metadata.labels.get_or_insert_with(Default::default);
        for (key, value) in &claim_labels {
            node_labels.insert(key.clone(), value.clone());
        }
        node_labels.insert(labels::REGISTERED.to_string(), "true".to_string());
        if !claim_annotations.is_empty() {
            let node_annotations = modified
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            for (key, value) in &claim_annotations {
                node_annotations.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        let spec = modified.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Default::default);
        for taint in claim_taints {
            if !taints.iter().any(|t| t.key == taint.key && t.effect == taint.effect) {
                taints.push(taint);
            }
        }
        json_patch::diff(
            &serde_json::to_value(node)?,
            &serde_json::to_value(&modified)?,
        )
    });
    nodes
        .patch(
            &node.name_any(),
            &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
            &patch,
        )
        .await?;
    let node_name = node.name_any();
    patch_status(client, claim, move |status: &mut NodeClaimStatus| {
        status.node_name = Some(node_name);
        status.phase = NodeClaimPhase::Registered;
        status.set_condition(conditions::REGISTERED, true, "NodeRegistered", "", now());
    })
    .await?;
    println!(
        "🔗 {}{}{}",
        claim.name_any().color(FG2),
        " registered node ".color(FG1),
        node.name_any().color(FG2),
    );
    Ok(())
}

/// Marks the node and claim initialized once the node went Ready with its
/// startup taints removed.
pub async fn initialize(client: Client, claim: &NodeClaim, node: &Node) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = kube::api::Patch::Json::<Node>({
        let mut modified = node.clone();
        modified
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(labels::INITIALIZED.to_string(), "true".to_string());
        json_patch::diff(
            &serde_json::to_value(node)?,
            &serde_json::to_value(&modified)?,
        )
    });
    nodes
        .patch(
            &node.name_any(),
            &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
            &patch,
        )
        .await?;
    patch_status(client, claim, |status: &mut NodeClaimStatus| {
        status.phase = NodeClaimPhase::Ready;
        status.set_condition(conditions::INITIALIZED, true, "NodeInitialized", "", now());
    })
    .await?;
    Ok(())
}

pub async fn mark_empty(client: Client, claim: &NodeClaim) -> Result<(), Error> {
    patch_status(client, claim, |status: &mut NodeClaimStatus| {
        status.last_pod_event_time = Some(now());
        status.set_condition(conditions::EMPTY, true, "NoWorkloadPods", "", now());
    })
    .await?;
    Ok(())
}

pub async fn clear_empty(client: Client, claim: &NodeClaim) -> Result<(), Error> {
    patch_status(client, claim, |status: &mut NodeClaimStatus| {
        status.last_pod_event_time = Some(now());
        status.remove_condition(conditions::EMPTY);
    })
    .await?;
    Ok(())
}

pub async fn mark_expired(client: Client, claim: &NodeClaim) -> Result<(), Error> {
    patch_status(client, claim, |status: &mut NodeClaimStatus| {
        status.set_condition(conditions::EXPIRED, true, "LifetimeExceeded", "", now());
    })
    .await?;
    Ok(())
}

pub async fn mark_drifted(client: Client, claim: &NodeClaim, message: String) -> Result<(), Error> {
    patch_status(client, claim, move |status: &mut NodeClaimStatus| {
        status.set_condition(conditions::DRIFTED, true, "TemplateChanged", &message, now());
    })
    .await?;
    Ok(())
}

/// Surfaces a fatal invariant violation. No retry happens until an operator
/// intervenes; the condition carries the evidence.
pub async fn invariant_violation(
    client: Client,
    claim: &NodeClaim,
    reason: &'static str,
    message: String,
) -> Result<(), Error> {
    eprintln!(
        "{}",
        format!("Invariant violation on '{}': {}: {}", claim.name_any(), reason, message).red()
    );
    patch_status(client, claim, move |status: &mut NodeClaimStatus| {
        status.phase = NodeClaimPhase::Failed;
        status.set_condition("InvariantViolated", true, reason, &message, now());
    })
    .await?;
    Ok(())
}

/// Deletes the claim; the termination finalizer takes it from there.
pub async fn delete_claim(client: Client, claim: &NodeClaim, reason: &str) -> Result<(), Error> {
    println!(
        "🗑️ {}{}{}",
        claim.name_any().color(FG2),
        " deleting: ".color(FG1),
        reason.color(FG2),
    );
    let api: Api<NodeClaim> = Api::all(client);
    match api.delete(&claim.name_any(), &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}
