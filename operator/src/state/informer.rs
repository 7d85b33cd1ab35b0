//! Informer watchers: the mirror's only writers. Each resource kind gets its
//! own watch stream; events are folded into [`ClusterState`] as they arrive.

use super::ClusterState;
use crate::util::Error;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client, ResourceExt, runtime::watcher};
use owo_colors::OwoColorize;
use std::pin::pin;
use stratus_types::NodeClaim;

/// Runs all informer watchers to completion. Returns only on stream failure
/// or shutdown.
pub async fn run(client: Client, state: ClusterState) -> Result<(), Error> {
    println!("{}", "🪞 Starting cluster state informers...".green());
    tokio::try_join!(
        watch_nodes(client.clone(), state.clone()),
        watch_pods(client.clone(), state.clone()),
        watch_daemonsets(client.clone(), state.clone()),
        watch_node_claims(client, state),
    )?;
    Ok(())
}

async fn watch_nodes(client: Client, state: ClusterState) -> Result<(), Error> {
    let api: Api<Node> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event? {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                state.update_node(&node)
            }
            watcher::Event::Delete(node) => state.delete_node(&node.name_any()),
            _ => {}
        }
    }
    Ok(())
}

async fn watch_pods(client: Client, state: ClusterState) -> Result<(), Error> {
    let api: Api<Pod> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event? {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => state.update_pod(&pod),
            watcher::Event::Delete(pod) => state.remove_pod(&pod),
            _ => {}
        }
    }
    Ok(())
}

async fn watch_daemonsets(client: Client, state: ClusterState) -> Result<(), Error> {
    let api: Api<DaemonSet> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event? {
            watcher::Event::Apply(ds) | watcher::Event::InitApply(ds) => {
                state.update_daemonset(&ds)
            }
            watcher::Event::Delete(ds) => {
                state.delete_daemonset(&ds.namespace().unwrap_or_default(), &ds.name_any())
            }
            _ => {}
        }
    }
    Ok(())
}

async fn watch_node_claims(client: Client, state: ClusterState) -> Result<(), Error> {
    let api: Api<NodeClaim> = Api::all(client);
    let mut stream = pin!(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event? {
            watcher::Event::Apply(claim) | watcher::Event::InitApply(claim) => {
                state.update_node_claim(&claim)
            }
            watcher::Event::Delete(claim) => state.delete_node_claim(&claim),
            _ => {}
        }
    }
    Ok(())
}
