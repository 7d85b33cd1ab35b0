//! Garbage collection of claims whose cloud instance vanished out-of-band.
//! Every sweep lists the provider's instances and deletes any claim that
//! has been Launched for longer than the grace window but no longer has a
//! backing instance.

use crate::cloudprovider::CloudProvider;
use crate::util::Error;
use futures::StreamExt;
use k8s_openapi::jiff::Timestamp;
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stratus_types::{NodeClaim, conditions};

const SWEEP_CONCURRENCY: usize = 20;

pub async fn run(
    client: Client,
    cloud: Arc<dyn CloudProvider>,
    interval: Duration,
    launch_grace: Duration,
) -> Result<(), Error> {
    println!("{}", "🧹 Starting instance garbage collector...".green());
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = sweep(client.clone(), &cloud, launch_grace).await {
            eprintln!("{}", format!("Garbage collection sweep failed: {e}").red());
        }
    }
}

fn launched_longer_than(claim: &NodeClaim, grace: Duration) -> bool {
    claim
        .condition(conditions::LAUNCHED)
        .filter(|c| c.status == "True")
        .map(|c| {
            Timestamp::now()
                .duration_since(c.last_transition_time.0)
                .try_into()
                .unwrap_or(Duration::ZERO)
        })
        .is_some_and(|age: Duration| age > grace)
}

async fn sweep(
    client: Client,
    cloud: &Arc<dyn CloudProvider>,
    launch_grace: Duration,
) -> Result<(), Error> {
    let live: HashSet<String> = cloud
        .list()
        .await?
        .into_iter()
        .map(|m| m.provider_id)
        .collect();
    let claims: Api<NodeClaim> = Api::all(client.clone());
    let orphaned: Vec<NodeClaim> = claims
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .filter(|c| launched_longer_than(c, launch_grace))
        .filter(|c| {
            c.provider_id()
                .is_some_and(|pid| !live.contains(pid))
        })
        .collect();
    if orphaned.is_empty() {
        return Ok(());
    }
    futures::stream::iter(orphaned)
        .map(|claim| {
            let api: Api<NodeClaim> = Api::all(client.clone());
            async move {
                let name = claim.name_any();
                println!(
                    "🧹 {} {}",
                    name.yellow(),
                    "instance vanished; deleting claim".yellow().dimmed(),
                );
                match api.delete(&name, &Default::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => eprintln!("{}", format!("failed to delete '{}': {e}", name).red()),
                }
            }
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .collect::<Vec<()>>()
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
    use stratus_types::NodeClaimStatus;

    fn claim_launched_at(age: Duration, provider_id: &str) -> NodeClaim {
        let mut claim = NodeClaim::default();
        claim.metadata.name = Some("c".to_string());
        claim.status = Some(NodeClaimStatus {
            provider_id: Some(provider_id.to_string()),
            conditions: vec![Condition {
                type_: conditions::LAUNCHED.to_string(),
                status: "True".to_string(),
                reason: "Launched".to_string(),
                message: String::new(),
                observed_generation: None,
                last_transition_time: Time(
                    Timestamp::now() - k8s_openapi::jiff::SignedDuration::try_from(age).unwrap(),
                ),
            }],
            ..Default::default()
        });
        claim
    }

    #[test]
    fn fresh_launches_are_sheltered_by_the_grace_window() {
        let claim = claim_launched_at(Duration::from_secs(2), "p://gone");
        assert!(!launched_longer_than(&claim, Duration::from_secs(10)));
        let claim = claim_launched_at(Duration::from_secs(30), "p://gone");
        assert!(launched_longer_than(&claim, Duration::from_secs(10)));
    }
}
