//! Fair work queue: per-tenant FIFOs balanced round-robin, with
//! dirty/processing set bookkeeping so an item is reconciled at most
//! once concurrently and re-added items requeue behind their tenant's
//! existing backlog rather than jumping the line.
//!
//! Grounded on `vc_common::wait::backoff_full_jitter` for the
//! rate-limited re-add path and on the teacher's `CancellationToken`
//! based shutdown idiom (`storage-operator::clusters::reconcile::run`).
//! `delay` holds the heap-backed `AddAfter` scheduler; a `FairQueue`
//! owns one and runs its heartbeat loop alongside its workers.

mod delay;
mod rate_limiter;

pub use delay::DelayQueue;
pub use rate_limiter::RateLimiter;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// An item queued for reconciliation, keyed by `(tenant, item)` so the
/// balancer can round-robin fairly across tenants regardless of how
/// unevenly they produce work.
pub trait QueueItem: Clone + Eq + Hash + Send + Sync + 'static {
    /// Tenant this item belongs to, for fairness bucketing.
    fn tenant(&self) -> String;
}

struct Inner<T: QueueItem> {
    /// FIFO per tenant.
    queues: BTreeMap<String, VecDeque<T>>,
    /// Tenants with at least one queued item, in round-robin order.
    order: VecDeque<String>,
    /// Items currently queued or in flight; prevents duplicate entries.
    dirty: HashSet<T>,
    /// Items currently being processed by a `get()` caller.
    processing: HashSet<T>,
    /// Items whose processing finished while they were dirty again;
    /// re-queued as soon as their slot frees up in `done()`.
    requeue_on_done: HashSet<T>,
    shutting_down: bool,
    /// Last time a tenant's queue went from non-empty to empty, used by
    /// the idle GC sweep to drop tenant bookkeeping that's gone quiet.
    last_activity: BTreeMap<String, Instant>,
}

impl<T: QueueItem> Inner<T> {
    fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            order: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            requeue_on_done: HashSet::new(),
            shutting_down: false,
            last_activity: BTreeMap::new(),
        }
    }

    fn push(&mut self, item: T) {
        let tenant = item.tenant();
        if !self.queues.contains_key(&tenant) {
            self.order.push_back(tenant.clone());
        }
        self.queues.entry(tenant).or_default().push_back(item);
    }
}

/// A fair, tenant-balanced work queue. Cloning shares the underlying
/// state, matching how the teacher's controllers pass `Arc<ContextData>`
/// into spawned tasks.
pub struct FairQueue<T: QueueItem> {
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
    rate_limiter: Arc<RateLimiter<T>>,
    delay: Arc<DelayQueue<T>>,
    /// Staleness threshold for the idle GC sweep: a tenant with no queued
    /// work and no activity within this long is forgotten.
    queue_expire_duration: Duration,
    /// How often the idle GC sweep runs.
    idle_queue_check_period: Duration,
}

impl<T: QueueItem> Clone for FairQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            rate_limiter: self.rate_limiter.clone(),
            delay: self.delay.clone(),
            queue_expire_duration: self.queue_expire_duration,
            idle_queue_check_period: self.idle_queue_check_period,
        }
    }
}

impl<T: QueueItem> FairQueue<T> {
    pub fn new(queue_expire_duration: Duration, idle_queue_check_period: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            notify: Arc::new(Notify::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            delay: Arc::new(DelayQueue::new()),
            queue_expire_duration,
            idle_queue_check_period,
        }
    }

    /// Enqueue `item` immediately, unless it's already dirty (queued or
    /// in flight) or currently processing, in which case it's marked to
    /// re-run once the in-flight attempt calls `done`.
    pub async fn add(&self, item: T) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&item) {
            inner.requeue_on_done.insert(item);
            return;
        }
        if inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        inner.last_activity.insert(item.tenant(), Instant::now());
        inner.push(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Schedules `item` to be enqueued after `delay` elapses, via the
    /// shared heap-backed delay queue rather than spawning a dedicated
    /// sleep task per call. Pair with `run_delay_loop` to actually drain
    /// the heap; `add_after` alone only records the entry.
    pub fn add_after(&self, item: T, delay: Duration) {
        self.delay.push(item, delay);
    }

    /// Runs the delay queue's heartbeat loop, moving entries onto this
    /// queue as their deadlines elapse, until `cancel` fires. `max_wait`
    /// bounds how long the loop can sleep with an empty heap, so an
    /// insertion that races the loop's readiness check is still picked
    /// up promptly rather than waiting for the next scheduled wakeup.
    pub async fn run_delay_loop(&self, max_wait: Duration, cancel: CancellationToken) {
        delay::run(&self.delay, self, max_wait, cancel).await;
    }

    /// Enqueue `item` after a rate-limiter-computed exponential backoff
    /// tied to this item's retry count.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.next_backoff(&item);
        self.add_after(item, delay);
    }

    /// Clears the retry counter for `item`. Call on successful
    /// reconciliation so a future transient failure starts its backoff
    /// fresh rather than continuing an old escalation.
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Blocks until an item is available, balancing fairly across
    /// tenants: each call advances to the next tenant in round-robin
    /// order rather than draining one tenant's backlog before moving on.
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(item) = Self::pop_next(&mut inner) {
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn pop_next(inner: &mut Inner<T>) -> Option<T> {
        let tenants = inner.order.len();
        for _ in 0..tenants {
            let Some(tenant) = inner.order.pop_front() else {
                break;
            };
            let Some(queue) = inner.queues.get_mut(&tenant) else {
                continue;
            };
            let Some(item) = queue.pop_front() else {
                continue;
            };
            if queue.is_empty() {
                inner.queues.remove(&tenant);
                inner.last_activity.insert(tenant, Instant::now());
            } else {
                inner.order.push_back(tenant);
            }
            return Some(item);
        }
        None
    }

    /// Marks `item` as finished processing. If it was re-added while in
    /// flight, it is pushed back onto its tenant's queue now.
    pub async fn done(&self, item: &T) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(item);
        if inner.requeue_on_done.remove(item) {
            inner.push(item.clone());
            drop(inner);
            self.notify.notify_one();
        } else {
            inner.dirty.remove(item);
        }
    }

    /// Stops accepting new work and wakes every blocked `get()` caller.
    pub async fn shut_down(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Background sweep dropping per-tenant bookkeeping (retry counters,
    /// activity timestamps) for tenants with no queued or in-flight work
    /// and no recent activity, so a churning tenant population doesn't
    /// leak memory indefinitely. Ticks every `idle_queue_check_period`
    /// and expires a tenant once it's been quiet for
    /// `queue_expire_duration` — two independent knobs, not one reused
    /// for both the sweep cadence and the staleness threshold.
    pub async fn run_idle_gc(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.idle_queue_check_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let stale: Vec<String> = inner
                .last_activity
                .iter()
                .filter(|(tenant, at)| {
                    !inner.queues.contains_key(*tenant) && now.duration_since(**at) > self.queue_expire_duration
                })
                .map(|(tenant, _)| tenant.clone())
                .collect();
            for tenant in stale {
                inner.last_activity.remove(&tenant);
            }
        }
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Item {
        tenant: &'static str,
        name: &'static str,
    }

    impl QueueItem for Item {
        fn tenant(&self) -> String {
            self.tenant.to_string()
        }
    }

    fn queue() -> FairQueue<Item> {
        FairQueue::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn balances_round_robin_across_tenants() {
        let q = queue();
        q.add(Item { tenant: "a", name: "1" }).await;
        q.add(Item { tenant: "a", name: "2" }).await;
        q.add(Item { tenant: "b", name: "1" }).await;

        let first = q.get().await.unwrap();
        assert_eq!(first.tenant, "a");
        q.done(&first).await;

        let second = q.get().await.unwrap();
        assert_eq!(second.tenant, "b");
        q.done(&second).await;

        let third = q.get().await.unwrap();
        assert_eq!(third.tenant, "a");
        assert_eq!(third.name, "2");
    }

    #[tokio::test]
    async fn duplicate_add_while_dirty_is_collapsed() {
        let q = queue();
        let item = Item { tenant: "a", name: "1" };
        q.add(item.clone()).await;
        q.add(item.clone()).await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn add_while_processing_requeues_after_done() {
        let q = queue();
        let item = Item { tenant: "a", name: "1" };
        q.add(item.clone()).await;
        let got = q.get().await.unwrap();
        assert_eq!(got, item);

        // Reconciler is still running when a new event arrives.
        q.add(item.clone()).await;
        q.done(&item).await;

        let requeued = q.get().await.unwrap();
        assert_eq!(requeued, item);
    }

    #[tokio::test]
    async fn shut_down_unblocks_pending_get() {
        let q = queue();
        let waiter = q.clone();
        let handle = tokio::spawn(async move { waiter.get().await });
        tokio::task::yield_now().await;
        q.shut_down().await;
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_idle_gc_drops_stale_tenant_activity_but_not_fresh() {
        let q = FairQueue::new(Duration::from_millis(20), Duration::from_millis(10));
        let item = Item { tenant: "a", name: "1" };
        q.add(item.clone()).await;
        let got = q.get().await.unwrap();
        q.done(&got).await;
        assert!(q.inner.lock().await.last_activity.contains_key("a"));

        let cancel = CancellationToken::new();
        let gc_cancel = cancel.clone();
        let gc_queue = q.clone();
        let handle = tokio::spawn(async move {
            gc_queue.run_idle_gc(gc_cancel).await;
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(!q.inner.lock().await.last_activity.contains_key("a"));
    }

    #[tokio::test]
    async fn heavy_tenant_does_not_starve_light_tenant() {
        const NAMES: [&str; 5] = ["1", "2", "3", "4", "5"];
        let q = queue();
        // "a" floods the queue well ahead of "b" ever getting a turn.
        for name in NAMES {
            q.add(Item { tenant: "a", name }).await;
        }
        q.add(Item { tenant: "b", name: "1" }).await;

        // Round-robin means "b"'s single item comes out no later than "a"'s second.
        let first = q.get().await.unwrap();
        assert_eq!(first.tenant, "a");
        q.done(&first).await;

        let second = q.get().await.unwrap();
        assert_eq!(second.tenant, "b");
        q.done(&second).await;
    }

    #[tokio::test]
    async fn add_after_is_delivered_once_the_delay_loop_runs() {
        let q = queue();
        let item = Item { tenant: "a", name: "1" };
        q.add_after(item.clone(), Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let loop_queue = q.clone();
        let handle = tokio::spawn(async move {
            loop_queue.run_delay_loop(Duration::from_secs(1), loop_cancel).await;
        });

        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
        assert_eq!(got, item);
        cancel.cancel();
        handle.await.unwrap();
    }
}
