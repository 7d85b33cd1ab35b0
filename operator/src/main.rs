mod args;
mod cloudprovider;
mod nodeclaims;
mod provisioning;
mod requirements;
mod resources;
mod scheduling;
mod state;
mod termination;
mod topology;
mod util;

use args::Args;
use clap::Parser;
use cloudprovider::{CloudProvider, UnavailableOfferings, fake::FakeCloudProvider};
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use state::ClusterState;
use std::sync::Arc;
use std::time::Duration;
use termination::evict::EvictionQueue;
use tokio_util::sync::CancellationToken;

fn spawn_controllers(
    client: Client,
    state: ClusterState,
    cloud: Arc<dyn CloudProvider>,
    unavailable: Arc<UnavailableOfferings>,
    args: Args,
    ttl_after_not_registered: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let evictions = EvictionQueue::new(client.clone(), args.eviction_rate, args.eviction_burst);
        let result = tokio::try_join!(
            provisioning::run(
                client.clone(),
                state.clone(),
                cloud.clone(),
                unavailable.clone(),
                Duration::from_secs(args.batch_period_seconds),
            ),
            nodeclaims::reconcile::run(
                client.clone(),
                state.clone(),
                cloud.clone(),
                unavailable.clone(),
                ttl_after_not_registered,
            ),
            nodeclaims::garbagecollect::run(
                client.clone(),
                cloud.clone(),
                Duration::from_secs(args.gc_interval_seconds),
                Duration::from_secs(args.gc_launch_grace_seconds),
            ),
            termination::reconcile::run(client, cloud, evictions),
        );
        if let Err(e) = result {
            eprintln!("{}", format!("Controller set failed: {e}").red());
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("{}", "🌩️ Starting stratus operator...".green());

    let ttl_after_not_registered = parse_duration::parse(&args.ttl_after_not_registered)?;
    let client = Client::try_default().await?;
    let state = ClusterState::new();
    let cloud: Arc<dyn CloudProvider> = Arc::new(FakeCloudProvider::new());
    let unavailable = Arc::new(UnavailableOfferings::default());
    println!(
        "{}{}",
        "☁️ Cloud provider: ".green(),
        cloud.name().green().dimmed(),
    );
    cloud.liveness_probe().await.map_err(|e| {
        anyhow::anyhow!("cloud provider failed its liveness probe: {e}")
    })?;

    #[cfg(feature = "metrics")]
    if let Some(port) = args.metrics_port {
        tokio::spawn(util::metrics::run_metrics_server(port));
    }

    // Informers feed the mirror regardless of leadership; they only read.
    let informers = tokio::spawn(state::informer::run(client.clone(), state.clone()));
    stratus_common::signal_ready();

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        stratus_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    if args.disable_leader_election {
        let task = spawn_controllers(
            client,
            state,
            cloud,
            unavailable,
            args,
            ttl_after_not_registered,
        );
        shutdown.cancelled().await;
        task.abort();
        task.await.ok();
        informers.abort();
        return Ok(());
    }

    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("stratus-operator-{}", uuid::Uuid::new_v4()));
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &args.namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "stratus-operator-lock".to_string(),
            lease_ttl,
        },
    );

    // Only the leader runs the controllers; on leadership loss the whole
    // set is aborted and we return to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                informers.abort();
                break;
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controllers due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controllers".green());
                controller_task = Some(spawn_controllers(
                    client.clone(),
                    state.clone(),
                    cloud.clone(),
                    unavailable.clone(),
                    args.clone(),
                    ttl_after_not_registered,
                ));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controllers");
            task.abort();
        }
    }
    Ok(())
}
