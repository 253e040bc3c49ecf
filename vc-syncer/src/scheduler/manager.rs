//! Wires the scheduler engine to live `Namespace`/`Pod` watchers,
//! following `manager::ConfigMapManager`'s worker-pool shape: one MCC
//! per kind feeding a shared `FairQueue`, `max_concurrent_reconciles`
//! workers pulling from it. This is the reconciler review feedback
//! flagged as missing: without it `SchedulerEngine` is only ever
//! exercised by its own unit tests.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::fwq::FairQueue;
use crate::mcc::{ClusterRegistry, MultiClusterController, WorkItem};
use crate::scheduler::{SchedulerEngine, reconcile};
use crate::util::Error;

pub struct SchedulerManager {
    registry: ClusterRegistry,
    namespace_mcc: Arc<MultiClusterController<Namespace>>,
    pod_mcc: Arc<MultiClusterController<Pod>>,
    namespace_queue: FairQueue<WorkItem>,
    pod_queue: FairQueue<WorkItem>,
    engine: Arc<SchedulerEngine>,
    max_concurrent_reconciles: usize,
    max_reconcile_retry_attempts: u32,
    max_wait: std::time::Duration,
}

impl SchedulerManager {
    pub fn new(
        registry: ClusterRegistry,
        engine: Arc<SchedulerEngine>,
        queue_args: &vc_common::args::QueueArgs,
        reconcile_args: &vc_common::args::ReconcileArgs,
    ) -> Self {
        let namespace_queue = FairQueue::new(queue_args.queue_expire_duration, queue_args.idle_queue_check_period);
        let pod_queue = FairQueue::new(queue_args.queue_expire_duration, queue_args.idle_queue_check_period);
        Self {
            registry,
            namespace_mcc: MultiClusterController::new(namespace_queue.clone()),
            pod_mcc: MultiClusterController::new(pod_queue.clone()),
            namespace_queue,
            pod_queue,
            engine,
            max_concurrent_reconciles: reconcile_args.max_concurrent_reconciles,
            max_reconcile_retry_attempts: reconcile_args.max_reconcile_retry_attempts,
            max_wait: queue_args.max_wait,
        }
    }

    pub fn namespace_mcc(&self) -> Arc<MultiClusterController<Namespace>> {
        self.namespace_mcc.clone()
    }

    pub fn pod_mcc(&self) -> Arc<MultiClusterController<Pod>> {
        self.pod_mcc.clone()
    }

    /// Attaches namespace/pod watchers for every cluster already in the
    /// registry, mirroring `ConfigMapManager::sync_watched_clusters` for
    /// the clusters registered before this manager started watching.
    pub async fn sync_watched_clusters(&self) {
        for cluster in self.registry.list().await {
            self.namespace_mcc.add_cluster(&cluster, None).await;
            self.pod_mcc.add_cluster(&cluster, None).await;
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        println!("{}", "⚙️ Starting namespace/pod scheduler...".green());
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut workers = Vec::new();

        for worker_id in 0..self.max_concurrent_reconciles {
            let manager = self.clone();
            let cancel = cancel.clone();
            let first_error = first_error.clone();
            workers.push(tokio::spawn(async move {
                manager.namespace_worker_loop(worker_id, cancel, first_error).await;
            }));
        }
        for worker_id in 0..self.max_concurrent_reconciles {
            let manager = self.clone();
            let cancel = cancel.clone();
            let first_error = first_error.clone();
            workers.push(tokio::spawn(async move {
                manager.pod_worker_loop(worker_id, cancel, first_error).await;
            }));
        }

        let ns_gc = self.namespace_queue.clone();
        let ns_gc_cancel = cancel.clone();
        workers.push(tokio::spawn(async move { ns_gc.run_idle_gc(ns_gc_cancel).await }));
        let pod_gc = self.pod_queue.clone();
        let pod_gc_cancel = cancel.clone();
        workers.push(tokio::spawn(async move { pod_gc.run_idle_gc(pod_gc_cancel).await }));

        let ns_delay = self.namespace_queue.clone();
        let ns_delay_cancel = cancel.clone();
        let ns_max_wait = self.max_wait;
        workers.push(tokio::spawn(async move { ns_delay.run_delay_loop(ns_max_wait, ns_delay_cancel).await }));
        let pod_delay = self.pod_queue.clone();
        let pod_delay_cancel = cancel.clone();
        let pod_max_wait = self.max_wait;
        workers.push(tokio::spawn(async move { pod_delay.run_delay_loop(pod_max_wait, pod_delay_cancel).await }));

        for worker in workers {
            worker.await.ok();
        }

        let mut err = first_error.lock().await;
        match err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn namespace_worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        cancel: CancellationToken,
        first_error: Arc<Mutex<Option<Error>>>,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.namespace_queue.get() => item,
            };
            let Some(item) = item else { return };

            if self.namespace_queue.num_requeues(&item) > self.max_reconcile_retry_attempts {
                eprintln!("{}", format!("namespace worker {worker_id} dropping {item:?} after too many retries").red());
                self.namespace_queue.done(&item).await;
                continue;
            }

            match self.reconcile_namespace_item(&item).await {
                Ok(()) => self.namespace_queue.forget(&item),
                Err(e) if e.is_terminal_for_item() => {
                    eprintln!("{}", format!("terminal namespace scheduling error for {item:?}: {e}").red());
                }
                Err(e) => {
                    eprintln!("{}", format!("namespace scheduling error for {item:?}: {e}").red());
                    self.namespace_queue.add_rate_limited(item.clone());
                    let mut guard = first_error.lock().await;
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                }
            }
            self.namespace_queue.done(&item).await;
        }
    }

    async fn reconcile_namespace_item(&self, item: &WorkItem) -> Result<(), Error> {
        let cluster = self.registry.get(&item.cluster_key).await?;
        let Some(namespace) = self.namespace_mcc.get(&item.cluster_key, None, &item.name).await else {
            self.engine.deschedule_namespace(&format!("{}/{}", item.cluster_key, item.name));
            return Ok(());
        };
        reconcile::reconcile_namespace(&self.engine, cluster.client.clone(), &item.cluster_key, &namespace).await
    }

    async fn pod_worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        cancel: CancellationToken,
        first_error: Arc<Mutex<Option<Error>>>,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = self.pod_queue.get() => item,
            };
            let Some(item) = item else { return };

            if self.pod_queue.num_requeues(&item) > self.max_reconcile_retry_attempts {
                eprintln!("{}", format!("pod worker {worker_id} dropping {item:?} after too many retries").red());
                self.pod_queue.done(&item).await;
                continue;
            }

            match self.reconcile_pod_item(&item).await {
                Ok(()) => self.pod_queue.forget(&item),
                Err(e) if e.is_terminal_for_item() => {
                    eprintln!("{}", format!("terminal pod scheduling error for {item:?}: {e}").red());
                }
                Err(e) => {
                    eprintln!("{}", format!("pod scheduling error for {item:?}: {e}").red());
                    self.pod_queue.add_rate_limited(item.clone());
                    let mut guard = first_error.lock().await;
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                }
            }
            self.pod_queue.done(&item).await;
        }
    }

    async fn reconcile_pod_item(&self, item: &WorkItem) -> Result<(), Error> {
        let cluster = self.registry.get(&item.cluster_key).await?;
        let Some(namespace) = &item.namespace else {
            return Err(Error::ValidationError("Pod work item missing namespace".to_string()));
        };
        let Some(pod) = self.pod_mcc.get(&item.cluster_key, Some(namespace), &item.name).await else {
            let pod_key = format!("{}/{}/{}", item.cluster_key, namespace, item.name);
            self.engine.deschedule_pod(&pod_key);
            return Ok(());
        };
        reconcile::reconcile_pod(&self.engine, cluster.client.clone(), &item.cluster_key, namespace, &pod).await
    }
}
