//! Supervises the Node UWS fan-out: one super-cluster watcher feeding a
//! `FairQueue<NodeFanoutItem>`, drained by worker loops that patch each
//! tenant's virtual node status. Mirrors `ConfigMapManager`'s worker-pool
//! shape but in the opposite sync direction and over a single upstream
//! watch rather than one watch per tenant cluster.

use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::fwq::FairQueue;
use crate::mcc::ClusterRegistry;
use crate::syncer::node::{self, NodeFanoutItem};
use crate::util::Error;

pub struct NodeManager {
    registry: ClusterRegistry,
    queue: FairQueue<NodeFanoutItem>,
    max_concurrent_reconciles: usize,
    max_reconcile_retry_attempts: u32,
    max_wait: std::time::Duration,
}

impl NodeManager {
    pub fn new(
        registry: ClusterRegistry,
        queue_args: &vc_common::args::QueueArgs,
        reconcile_args: &vc_common::args::ReconcileArgs,
    ) -> Self {
        Self {
            registry,
            queue: FairQueue::new(queue_args.queue_expire_duration, queue_args.idle_queue_check_period),
            max_concurrent_reconciles: reconcile_args.max_concurrent_reconciles,
            max_reconcile_retry_attempts: reconcile_args.max_reconcile_retry_attempts,
            max_wait: queue_args.max_wait,
        }
    }

    pub async fn run(self: Arc<Self>, super_client: kube::Client, cancel: CancellationToken) -> Result<(), Error> {
        println!("{}", "⚙️ Starting node virtualization UWS...".green());
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut workers = Vec::new();

        let fanout_client = super_client.clone();
        let fanout_registry = self.registry.clone();
        let fanout_queue = self.queue.clone();
        let fanout_cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            node::run_fanout(fanout_client, fanout_registry, fanout_queue, fanout_cancel).await;
        }));

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
        workers.push(tokio::spawn(async move { gc_queue.run_idle_gc(gc_cancel).await }));

        let delay_queue = self.queue.clone();
        let delay_cancel = cancel.clone();
        let max_wait = self.max_wait;
        workers.push(tokio::spawn(async move { delay_queue.run_delay_loop(max_wait, delay_cancel).await }));

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
                eprintln!("{}", format!("node worker {worker_id} dropping {item:?} after too many retries").red());
                self.queue.done(&item).await;
                continue;
            }

            match self.reconcile_one(&item, super_client.clone()).await {
                Ok(()) => self.queue.forget(&item),
                Err(e) if e.is_terminal_for_item() => {
                    eprintln!("{}", format!("terminal node sync error for {item:?}: {e}").red());
                }
                Err(e) => {
                    eprintln!("{}", format!("node sync error for {item:?}: {e}").red());
                    self.queue.add_rate_limited(item.clone());
                    let mut guard = first_error.lock().await;
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                }
            }
            self.queue.done(&item).await;
        }
    }

    async fn reconcile_one(&self, item: &NodeFanoutItem, super_client: kube::Client) -> Result<(), Error> {
        let tenant = self.registry.get(&item.cluster_key).await?;
        node::sync_node_up(super_client, &tenant, &item.node_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A cluster unregistering between the fan-out enqueue and its item
    /// being picked up by a worker must surface as a terminal
    /// `ClusterNotFound`, not hang or retry forever against a cluster
    /// that's gone — `is_terminal_for_item` is what lets the worker loop
    /// drop it instead of re-queuing.
    #[tokio::test]
    async fn reconcile_of_an_item_whose_cluster_was_removed_mid_flight_is_terminal() {
        let registry = ClusterRegistry::new();
        let queue_args = vc_common::args::QueueArgs::default();
        let reconcile_args = vc_common::args::ReconcileArgs::default();
        let manager = NodeManager::new(registry, &queue_args, &reconcile_args);

        let item = NodeFanoutItem { cluster_key: "gone".to_string(), node_name: "n-7".to_string() };
        let err = manager
            .registry
            .get(&item.cluster_key)
            .await
            .expect_err("cluster was never registered");
        assert!(matches!(err, Error::ClusterNotFound(_)));
        assert!(err.is_terminal_for_item());
    }
}
