//! The provisioner: batches pending unschedulable pods, snapshots the
//! mirror, runs the batch scheduler, and commits the resulting NodeClaims.
//! All inputs are prefetched; the solve itself never touches the network.

use crate::cloudprovider::{CloudProvider, InstanceType, UnavailableOfferings};
use crate::resources;
use crate::scheduling::volumes::VolumeCatalog;
use crate::scheduling::{NodeClaimIntent, Scheduler};
use crate::state::ClusterState;
use crate::util::{self, Error, colors::{FG1, FG2}};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt, api::PostParams};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stratus_common::{TERMINATION_FINALIZER, annotations, labels};
use stratus_types::{NodeClaim, NodeClaimSpec, NodePool, ResourceRequests};

#[cfg(feature = "metrics")]
use crate::util::metrics;

/// Renders a committed intent as the NodeClaim object to create.
pub fn build_node_claim(intent: &NodeClaimIntent, name: &str) -> NodeClaim {
    let mut claim = NodeClaim::new(
        name,
        NodeClaimSpec {
            requirements: intent.requirements.to_node_selector_requirements(),
            resources: ResourceRequests {
                requests: resources::to_quantity_map(&intent.requests),
            },
            taints: intent.taints.clone(),
            startup_taints: intent.startup_taints.clone(),
            instance_types: intent.instance_types.clone(),
            node_class_ref: intent.node_class_ref.clone(),
        },
    );
    let mut claim_labels = intent.labels.clone();
    claim_labels.insert(labels::NODE_POOL.to_string(), intent.pool_name.clone());
    claim.metadata.labels = Some(claim_labels);
    let mut claim_annotations = intent.annotations.clone();
    claim_annotations.insert(
        annotations::CREATED_BY.to_string(),
        util::MANAGER_NAME.to_string(),
    );
    claim.metadata.annotations = Some(claim_annotations);
    claim.metadata.finalizers = Some(vec![TERMINATION_FINALIZER.to_string()]);
    claim
}

/// A pod is in scope when nothing has bound it, the cluster scheduler has
/// declared it unschedulable, and it is not daemonset-owned (daemonsets
/// follow nodes, not the other way around).
fn is_pending_unschedulable(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if pod
        .spec
        .as_ref()
        .is_none_or(|s| s.node_name.is_some())
    {
        return false;
    }
    if pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
    {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| {
            cs.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
}

/// Keeps each pool's in-use capacity current on its status, so operators
/// can read limit pressure without recomputing it. Patches only on change.
async fn update_pool_statuses(
    client: &Client,
    state: &ClusterState,
    pools: &[NodePool],
) -> Result<(), Error> {
    let snapshot = state.snapshot();
    for pool in pools {
        let pool_name = pool.name_any();
        let mut usage = crate::resources::MilliResources::new();
        for node in &snapshot.nodes {
            if node.labels().get(labels::NODE_POOL) == Some(&pool_name) {
                resources::add_assign(&mut usage, &node.capacity());
            }
        }
        let usage = resources::to_quantity_map(&usage);
        let current = pool.status.as_ref().map(|s| &s.resources);
        if current == Some(&usage) {
            continue;
        }
        crate::util::patch::patch_status(
            client.clone(),
            pool,
            move |status: &mut stratus_types::NodePoolStatus| {
                status.resources = usage;
            },
        )
        .await?;
    }
    Ok(())
}

/// Entrypoint for the provisioner loop.
pub async fn run(
    client: Client,
    state: ClusterState,
    cloud: Arc<dyn CloudProvider>,
    unavailable: Arc<UnavailableOfferings>,
    batch_period: Duration,
) -> Result<(), Error> {
    println!("{}", "⚙️ Starting provisioner...".green());
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "stratus-provisioner".to_string(),
            instance: None,
        },
    );
    let mut tick = tokio::time::interval(batch_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = provision_once(&client, &state, &cloud, &unavailable, &recorder).await {
            eprintln!("{}", format!("Provisioning round failed: {e}").red());
        }
    }
}

async fn provision_once(
    client: &Client,
    state: &ClusterState,
    cloud: &Arc<dyn CloudProvider>,
    unavailable: &Arc<UnavailableOfferings>,
    recorder: &Recorder,
) -> Result<(), Error> {
    let pods_api: Api<Pod> = Api::all(client.clone());
    let pending: Vec<Pod> = pods_api
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .filter(is_pending_unschedulable)
        .collect();

    let pools_api: Api<NodePool> = Api::all(client.clone());
    let pools = pools_api.list(&Default::default()).await?.items;
    if pools.is_empty() {
        return Ok(());
    }
    update_pool_statuses(client, state, &pools).await?;
    if pending.is_empty() {
        return Ok(());
    }
    let template_hashes: BTreeMap<String, String> = pools
        .iter()
        .map(|p| (p.name_any(), util::hash_spec(&p.spec.template)))
        .collect();
    let mut pool_instances: Vec<(NodePool, Vec<InstanceType>)> = Vec::new();
    for pool in pools {
        let instance_types = cloud.get_instance_types(&pool).await?;
        pool_instances.push((pool, instance_types));
    }

    let mut catalog = VolumeCatalog::new();
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
    for pvc in pvcs.list(&Default::default()).await?.items {
        catalog.add_pvc(&pvc);
    }
    let storage_classes: Api<StorageClass> = Api::all(client.clone());
    for sc in storage_classes.list(&Default::default()).await?.items {
        catalog.add_storage_class(&sc);
    }
    let csi_nodes: Api<CSINode> = Api::all(client.clone());
    for csi in csi_nodes.list(&Default::default()).await?.items {
        catalog.add_csi_node(&csi);
    }
    let namespaces_api: Api<Namespace> = Api::all(client.clone());
    let namespaces: BTreeMap<String, BTreeMap<String, String>> = namespaces_api
        .list(&Default::default())
        .await?
        .items
        .iter()
        .map(|ns| (ns.name_any(), ns.labels().clone()))
        .collect();

    #[cfg(feature = "metrics")]
    let round_start = std::time::Instant::now();

    let scheduler = Scheduler::new(
        state.snapshot(),
        pool_instances,
        &pending,
        catalog,
        unavailable.clone(),
        namespaces,
    );
    let results = scheduler.solve(pending);

    #[cfg(feature = "metrics")]
    {
        metrics::SCHEDULING_DURATION.observe(round_start.elapsed().as_secs_f64());
        metrics::PODS_SCHEDULED
            .with_label_values(&["existing"])
            .inc_by(results.existing.iter().map(|(_, p)| p.len() as u64).sum());
        metrics::PODS_SCHEDULED
            .with_label_values(&["new-node"])
            .inc_by(results.new_nodes.iter().map(|n| n.pod_keys.len() as u64).sum());
        metrics::PODS_SCHEDULED
            .with_label_values(&["unschedulable"])
            .inc_by(results.unschedulable.len() as u64);
    }

    for (pod, err) in &results.unschedulable {
        println!(
            "🚫 {}{}{}",
            pod.name_any().color(FG2),
            " unschedulable: ".color(FG1),
            format!("{err}").color(FG2),
        );
        let _ = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: "FailedScheduling".to_string(),
                    note: Some(format!("{err}")),
                    action: "Scheduling".to_string(),
                    secondary: None,
                },
                &pod.object_ref(&()),
            )
            .await;
    }

    let claims: Api<NodeClaim> = Api::all(client.clone());
    for intent in &results.new_nodes {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", intent.pool_name, &suffix[..8]);
        let mut claim = build_node_claim(intent, &name);
        if let Some(hash) = template_hashes.get(&intent.pool_name) {
            claim
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(annotations::SPEC_HASH.to_string(), hash.clone());
        }
        match claims.create(&PostParams::default(), &claim).await {
            Ok(created) => {
                // Read-your-writes: the mirror must see this claim before
                // the next round, or the same pods double-provision.
                state.update_node_claim(&created);
                println!(
                    "🚀 {}{}{}{}{}",
                    name.color(FG2),
                    " created for ".color(FG1),
                    format!("{} pod(s)", intent.pod_keys.len()).color(FG2),
                    " at ".color(FG1),
                    format!(
                        "{}/{} ${:.2}",
                        intent.offering.zone, intent.offering.capacity_type, intent.offering.price
                    )
                    .color(FG2),
                );
                #[cfg(feature = "metrics")]
                metrics::NODECLAIMS_CREATED
                    .with_label_values(&[&intent.pool_name])
                    .inc();
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                state.update_node_claim(&claim);
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}
