use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::util::{Error, patch::*};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use std::sync::Arc;
use stratus_common::{TERMINATION_FINALIZER, labels};
use stratus_types::*;

use crate::util::colors::{FG1, FG2};

/// Marks the node unschedulable and pulls it out of service load balancers.
pub async fn cordon(client: Client, node: &Node) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client);
    let patch = kube::api::Patch::Json::<Node>({
        let mut modified = node.clone();
        modified
            .spec
            .get_or_insert_with(Default::default)
            .unschedulable = Some(true);
        modified
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(
                labels::EXCLUDE_FROM_LOAD_BALANCERS.to_string(),
                "true".to_string(),
            );
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
    println!(
        "🚧 {}{}",
        node.name_any().color(FG2),
        " cordoned".color(FG1),
    );
    Ok(())
}

pub async fn mark_terminating(client: Client, claim: &NodeClaim) -> Result<(), Error> {
    patch_status(client, claim, |status: &mut NodeClaimStatus| {
        status.phase = NodeClaimPhase::Terminating;
    })
    .await?;
    Ok(())
}

/// Deletes the backing instance, the Node object, and finally the
/// termination finalizer. NotFound from the cloud means the instance is
/// already gone, which is the outcome we wanted.
pub async fn finalize(
    client: Client,
    cloud: &Arc<dyn CloudProvider>,
    claim: &NodeClaim,
    node: Option<&Node>,
    reason: &'static str,
) -> Result<(), Error> {
    if let Some(provider_id) = claim.provider_id() {
        match cloud.delete(provider_id).await {
            Ok(()) | Err(CloudProviderError::NotFound(_)) => {}
            Err(e) => return Err(Error::from(e)),
        }
    }
    if let Some(node) = node {
        let nodes: Api<Node> = Api::all(client.clone());
        match nodes.delete(&node.name_any(), &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::from(e)),
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Some(deleted_at) = claim.metadata.deletion_timestamp.as_ref() {
            let took: std::time::Duration = k8s_openapi::jiff::Timestamp::now()
                .duration_since(deleted_at.0)
                .try_into()
                .unwrap_or_default();
            crate::util::metrics::TERMINATION_DURATION
                .with_label_values(&[reason])
                .observe(took.as_secs_f64());
        }
        crate::util::metrics::NODECLAIMS_TERMINATED
            .with_label_values(&[reason])
            .inc();
    }

    let claims: Api<NodeClaim> = Api::all(client);
    let patch = kube::api::Patch::Json::<NodeClaim>({
        let mut modified = claim.clone();
        if let Some(finalizers) = modified.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != TERMINATION_FINALIZER);
        }
        json_patch::diff(
            &serde_json::to_value(claim)?,
            &serde_json::to_value(&modified)?,
        )
    });
    match claims
        .patch(
            &claim.name_any(),
            &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
            &patch,
        )
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(Error::from(e)),
    }
    println!(
        "💀 {}{}{}",
        claim.name_any().color(FG2),
        " terminated: ".color(FG1),
        reason.color(FG2),
    );
    Ok(())
}
