//! Wires the registry, multi-cluster controllers, and directional
//! syncers together into one supervised unit per reconciled kind,
//! following the teacher's `ContextData` + spawned-task supervision
//! style in `clusters::reconcile::run` but generalized across kinds
//! instead of being written out by hand per controller.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::{Resource, ResourceExt};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::fwq::FairQueue;
use crate::mcc::{ClusterRegistry, MultiClusterController, WorkItem};
use crate::syncer::{SyncerKind, dws, patrol};
use crate::translate;
use crate::util::Error;

/// Per-namespace bundle Kubernetes maintains for service-account token
/// verification. Skipped downward when a cluster disables SA tokens:
/// tenant pods minting no tokens have no use for the trust bundle.
const KUBE_ROOT_CA_CONFIGMAP: &str = "kube-root-ca.crt";

/// Supervises the DWS worker pool, patrol sweep, and MCC watcher for
/// one synced kind. `manager::run` spawns one of these per kind named
/// in `SPEC_FULL.md`'s module list; today that's `ConfigMap`, with
/// `Node` following the same shape for passthrough labels/metadata.
pub struct ConfigMapManager {
    registry: ClusterRegistry,
    mcc: Arc<MultiClusterController<ConfigMap>>,
    queue: FairQueue<WorkItem>,
    kind: SyncerKind<ConfigMap>,
    max_concurrent_reconciles: usize,
    max_reconcile_retry_attempts: u32,
    max_wait: Duration,
    opaque_meta_domains: Vec<String>,
}

impl ConfigMapManager {
    pub fn new(
        registry: ClusterRegistry,
        queue_args: &vc_common::args::QueueArgs,
        reconcile_args: &vc_common::args::ReconcileArgs,
        opaque_meta_domains: Vec<String>,
    ) -> Self {
        let queue = FairQueue::new(queue_args.queue_expire_duration, queue_args.idle_queue_check_period);
        Self {
            registry,
            mcc: MultiClusterController::new(queue.clone()),
            queue,
            kind: SyncerKind::always_ready("ConfigMap", |cm: &ConfigMap| cm.clone()),
            max_concurrent_reconciles: reconcile_args.max_concurrent_reconciles,
            max_reconcile_retry_attempts: reconcile_args.max_reconcile_retry_attempts,
            max_wait: queue_args.max_wait,
            opaque_meta_domains,
        }
    }

    pub fn mcc(&self) -> Arc<MultiClusterController<ConfigMap>> {
        self.mcc.clone()
    }

    /// Attaches a watcher for every cluster currently in the registry.
    /// Called once at startup and again whenever the registry's
    /// membership changes (the cluster reconciler drives that).
    pub async fn sync_watched_clusters(&self) {
        for cluster in self.registry.list().await {
            self.mcc.add_cluster(&cluster, None).await;
        }
    }

    /// Runs `max_concurrent_reconciles` worker loops pulling from the
    /// shared queue until `cancel` fires, plus the idle-queue GC sweep.
    /// The first error any worker hits terminates the whole manager,
    /// matching `clusters::reconcile::run`'s all-or-nothing supervision
    /// of the controller task.
    pub async fn run(self: Arc<Self>, super_client: kube::Client, cancel: CancellationToken) -> Result<(), Error> {
        println!("{}", format!("⚙️ Starting {} syncer...", self.kind.kind_name).green());

        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut workers = Vec::with_capacity(self.max_concurrent_reconciles);

        for worker_id in 0..self.max_concurrent_reconciles {
            let manager = self.clone();
            let super_client = super_client.clone();
            let cancel = cancel.clone();
            let first_error = first_error.clone();
            workers.push(tokio::spawn(async move {
                manager.worker_loop(worker_id, super_client, cancel, first_error).await;
            }));
        }

        let gc_queue = self.queue.clone();
        let gc_cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            gc_queue.run_idle_gc(gc_cancel).await;
        }));

        let delay_queue = self.queue.clone();
        let delay_cancel = cancel.clone();
        let max_wait = self.max_wait;
        workers.push(tokio::spawn(async move {
            delay_queue.run_delay_loop(max_wait, delay_cancel).await;
        }));

        let patrol_queue = self.queue.clone();
        let patrol_cancel = cancel.clone();
        let patrol_mcc = self.mcc.clone();
        let patrol_super_client = super_client.clone();
        workers.push(tokio::spawn(async move {
            let list_supers = move || {
                let client = patrol_super_client.clone();
                async move {
                    let api: Api<ConfigMap> = Api::all(client);
                    api.list(&kube::api::ListParams::default())
                        .await
                        .map(|l| l.items)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|cm| translate::super_owner(cm.meta()).is_some())
                        .collect()
                }
            };
            let list_tenants = move || {
                let mcc = patrol_mcc.clone();
                async move {
                    let mut out = Vec::new();
                    for cluster_key in mcc.clusters().await {
                        for obj in mcc.list(&cluster_key).await {
                            out.push((cluster_key.clone(), (*obj).clone()));
                        }
                    }
                    out
                }
            };
            patrol::run(DEFAULT_PATROL_PERIOD, patrol_cancel, list_supers, list_tenants, patrol_queue).await;
        }));

        for worker in workers {
            worker.await.ok();
        }

        let mut err = first_error.lock().await;
        match err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        super_client: kube::Client,
        cancel: CancellationToken,
        first_error: Arc<Mutex<Option<Error>>>,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.queue.get() => item,
            };
            let Some(item) = item else { return };

            if self.queue.num_requeues(&item) > self.max_reconcile_retry_attempts {
                eprintln!(
                    "{}",
                    format!(
                        "worker {worker_id} dropping {}/{} after exceeding max retry attempts",
                        item.namespace.as_deref().unwrap_or("-"),
                        item.name
                    )
                    .red()
                );
                self.queue.done(&item).await;
                continue;
            }

            let started = std::time::Instant::now();
            metrics::counter!("vc_syncer_reconcile_total", "kind" => self.kind.kind_name).increment(1);
            match self.reconcile_one(&item, super_client.clone()).await {
                Ok(()) => {
                    self.queue.forget(&item);
                    metrics::counter!("vc_syncer_reconcile_result_total", "kind" => self.kind.kind_name, "result" => "ok")
                        .increment(1);
                }
                Err(e) if e.is_terminal_for_item() => {
                    eprintln!("{}", format!("terminal error for {item:?}: {e}").red());
                    metrics::counter!("vc_syncer_reconcile_result_total", "kind" => self.kind.kind_name, "result" => "terminal")
                        .increment(1);
                }
                Err(e) => {
                    eprintln!("{}", format!("reconcile error for {item:?}: {e}").red());
                    metrics::counter!("vc_syncer_reconcile_result_total", "kind" => self.kind.kind_name, "result" => "retry")
                        .increment(1);
                    self.queue.add_rate_limited(item.clone());
                    let mut guard = first_error.lock().await;
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                }
            }
            metrics::histogram!("vc_syncer_reconcile_seconds", "kind" => self.kind.kind_name)
                .record(started.elapsed().as_secs_f64());
            self.queue.done(&item).await;
        }
    }

    async fn reconcile_one(&self, item: &WorkItem, super_client: kube::Client) -> Result<(), Error> {
        let cluster = self.registry.get(&item.cluster_key).await?;
        let Some(namespace) = &item.namespace else {
            return Err(Error::ValidationError("ConfigMap work item missing namespace".to_string()));
        };
        if cluster.spec.disable_service_account_token && item.name == KUBE_ROOT_CA_CONFIGMAP {
            return Ok(());
        }

        match self.mcc.get(&item.cluster_key, Some(namespace), &item.name).await {
            Some(tenant) => {
                let status_ready = tenant
                    .annotations()
                    .get(&cluster.spec.sync_status_annotation)
                    .map(|v| v == "Ready")
                    .unwrap_or(true);
                if !status_ready {
                    return Err(Error::DependencyNotReady(self.kind.kind_name.to_string()));
                }

                let mut opaque_meta_domains = self.opaque_meta_domains.clone();
                opaque_meta_domains.extend(cluster.spec.opaque_meta_domains.iter().cloned());
                dws::sync_down(
                    cluster.client.clone(),
                    super_client,
                    &item.cluster_key,
                    tenant.as_ref(),
                    &opaque_meta_domains,
                    &self.kind,
                )
                .await?;
            }
            None => {
                dws::sync_delete::<ConfigMap>(super_client, &item.cluster_key, namespace, &item.name).await?;
            }
        }
        Ok(())
    }
}

pub const DEFAULT_PATROL_PERIOD: Duration = Duration::from_secs(5 * 60);
