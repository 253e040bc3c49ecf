//! Heap-backed delay scheduler for `FairQueue::add_after`. Grounded on
//! spec.md §9's design note: "a priority heap plus a single goroutine
//! waking on the nearest deadline with a `maxWait` heartbeat. The
//! heartbeat is required for liveness when the heap is briefly empty at
//! the moment of insertion; preserve it." `push` is a cheap synchronous
//! lock+insert+notify; the heartbeat loop itself is `run`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{FairQueue, QueueItem};

struct Entry<T> {
    ready_at: Instant,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at.cmp(&other.ready_at)
    }
}

/// A min-heap of `(ready_at, item)` pairs, woken either by a fresh
/// insertion or by a `max_wait` heartbeat so the loop never sleeps past
/// the point where it should re-check an empty heap.
pub struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<Reverse<Entry<T>>>>,
    notify: Notify,
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    /// Schedules `item` to become ready after `delay`. Synchronous and
    /// non-blocking: no task is spawned per call, unlike the one-timer-
    /// per-item approach this replaces.
    pub fn push(&self, item: T, delay: Duration) {
        self.heap.lock().unwrap().push(Reverse(Entry {
            ready_at: Instant::now() + delay,
            item,
        }));
        self.notify.notify_one();
    }

    /// Drains every entry whose `ready_at` has passed, returning them.
    fn drain_ready(&self) -> Vec<T> {
        let mut heap = self.heap.lock().unwrap();
        let now = Instant::now();
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.ready_at > now {
                break;
            }
            let Reverse(entry) = heap.pop().unwrap();
            ready.push(entry.item);
        }
        ready
    }

    fn next_wait(&self, max_wait: Duration) -> Duration {
        let heap = self.heap.lock().unwrap();
        match heap.peek() {
            Some(Reverse(entry)) => entry.ready_at.saturating_duration_since(Instant::now()).min(max_wait),
            None => max_wait,
        }
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the heartbeat loop: sleeps until the nearest deadline or
/// `max_wait`, whichever comes first, wakes early on a fresh `push`, and
/// moves every now-ready item onto `queue`.
pub async fn run<T: QueueItem>(delay: &DelayQueue<T>, queue: &FairQueue<T>, max_wait: Duration, cancel: CancellationToken) {
    loop {
        let wait = delay.next_wait(max_wait);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
            _ = delay.notify.notified() => {}
        }
        for item in delay.drain_ready() {
            queue.add(item).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwq::FairQueue;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Item(&'static str);

    impl QueueItem for Item {
        fn tenant(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn drain_ready_only_returns_elapsed_entries() {
        let delay: DelayQueue<Item> = DelayQueue::new();
        delay.push(Item("soon"), Duration::from_secs(0));
        delay.push(Item("later"), Duration::from_secs(600));
        let ready = delay.drain_ready();
        assert_eq!(ready, vec![Item("soon")]);
        assert_eq!(delay.drain_ready(), Vec::new());
    }

    #[test]
    fn next_wait_is_bounded_by_max_wait_when_heap_is_empty() {
        let delay: DelayQueue<Item> = DelayQueue::new();
        assert_eq!(delay.next_wait(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn run_moves_ready_items_into_the_fair_queue() {
        let delay: DelayQueue<Item> = DelayQueue::new();
        let queue: FairQueue<Item> = FairQueue::new(Duration::from_secs(60), Duration::from_secs(60));
        delay.push(Item("a"), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_queue = queue.clone();
        let handle = tokio::spawn(async move {
            run(&delay, &run_queue, Duration::from_secs(5), run_cancel).await;
        });
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get()).await.unwrap().unwrap();
        assert_eq!(got, Item("a"));
        cancel.cancel();
        handle.await.unwrap();
    }
}
