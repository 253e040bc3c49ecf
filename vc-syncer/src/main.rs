use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vc_syncer::descriptor;
use vc_syncer::manager::ConfigMapManager;
use vc_syncer::mcc::{ClusterRegistry, ClusterSink};
use vc_syncer::node_manager::NodeManager;
use vc_syncer::scheduler::{ClusterUsage, SchedulerEngine, SchedulerManager};

/// CLI surface per spec.md §6's "Configuration recognized" list,
/// flattening the per-concern `*Args` structs the way the teacher's
/// binaries compose `common::args`.
#[derive(Parser, Debug)]
struct Cli {
    #[clap(flatten)]
    queue: vc_common::args::QueueArgs,
    #[clap(flatten)]
    reconcile: vc_common::args::ReconcileArgs,

    /// Metrics/health server port; unset disables it.
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Annotation key prefixes stripped from tenant objects before
    /// they're translated into super space.
    #[arg(long, env = "OPAQUE_META_DOMAINS", value_delimiter = ',')]
    opaque_meta_domains: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    vc_common::metrics::maybe_spawn_metrics_server(cli.metrics_port);

    let client = Client::try_default().await?;

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("vc-syncer-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "vc-syncer-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        vc_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    vc_common::signal_ready();

    println!("{}", "🌱 Starting vc-syncer...".green());

    let registry = ClusterRegistry::new();
    let configmap_manager = Arc::new(ConfigMapManager::new(
        registry.clone(),
        &cli.queue,
        &cli.reconcile,
        cli.opaque_meta_domains.clone(),
    ));
    let scheduler_engine = Arc::new(SchedulerEngine::new());
    let scheduler_manager = Arc::new(SchedulerManager::new(
        registry.clone(),
        scheduler_engine.clone(),
        &cli.queue,
        &cli.reconcile,
    ));
    let node_manager = Arc::new(NodeManager::new(registry.clone(), &cli.queue, &cli.reconcile));

    let sinks: Vec<Arc<dyn ClusterSink>> = vec![
        configmap_manager.mcc(),
        scheduler_manager.namespace_mcc(),
        scheduler_manager.pod_mcc(),
        scheduler_engine.clone(),
    ];

    let mut tick = tokio::time::interval(Duration::from_secs(5));
    let mut leader_tasks: Option<Vec<tokio::task::JoinHandle<()>>> = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(tasks) = leader_tasks.take() {
                    for task in tasks {
                        task.abort();
                    }
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("{}", format!("leader election renew/acquire failed: {e}").red());
                if let Some(tasks) = leader_tasks.take() {
                    for task in tasks {
                        task.abort();
                    }
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if leader_tasks.is_none() {
                println!("{}", "👑 Acquired leadership; starting syncer".green());
                configmap_manager.sync_watched_clusters().await;
                scheduler_manager.sync_watched_clusters().await;
                for cluster in registry.list().await {
                    scheduler_engine.set_capacity(&cluster.cluster_key, ClusterUsage::default());
                }

                let mut tasks = Vec::new();

                let descriptor_client = client.clone();
                let descriptor_registry = registry.clone();
                let descriptor_sinks = sinks.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = descriptor::run(descriptor_client, descriptor_registry, descriptor_sinks).await {
                        eprintln!("{}", format!("descriptor controller exited: {e}").red());
                    }
                }));

                let syncer_client = client.clone();
                let syncer_manager = configmap_manager.clone();
                let syncer_cancel = shutdown.child_token();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = syncer_manager.run(syncer_client, syncer_cancel).await {
                        eprintln!("{}", format!("ConfigMap syncer exited: {e}").red());
                    }
                }));

                let scheduler_task_manager = scheduler_manager.clone();
                let scheduler_cancel = shutdown.child_token();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = scheduler_task_manager.run(scheduler_cancel).await {
                        eprintln!("{}", format!("namespace/pod scheduler exited: {e}").red());
                    }
                }));

                let node_client = client.clone();
                let node_task_manager = node_manager.clone();
                let node_cancel = shutdown.child_token();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = node_task_manager.run(node_client, node_cancel).await {
                        eprintln!("{}", format!("node virtualization UWS exited: {e}").red());
                    }
                }));

                leader_tasks = Some(tasks);
            }
        } else if let Some(tasks) = leader_tasks.take() {
            eprintln!("lost leadership; stopping syncer");
            for task in tasks {
                task.abort();
            }
        }
    }
}
