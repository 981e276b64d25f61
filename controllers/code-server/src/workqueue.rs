//! Per-key deduplicating work queue.
//!
//! Guarantees that a key is handed to at most one worker at a time. Adding a
//! key that is already queued, or currently being processed, coalesces the
//! payload into a single pending entry; an in-flight key is re-queued when
//! its worker calls [`WorkQueue::done`].
//!
//! All bookkeeping lives behind one mutex that is never held across an await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Merges a newer payload for the same key into a pending one.
pub trait Coalesce {
    fn coalesce(&mut self, newer: Self);
}

#[derive(Debug)]
struct QueueState<K, V> {
    /// Keys ready to be handed out, oldest first
    ready: VecDeque<K>,
    /// Payload per key that still needs a run (ready, or waiting on an in-flight run)
    pending: HashMap<K, V>,
    in_flight: HashSet<K>,
    shutting_down: bool,
}

#[derive(Debug)]
pub struct WorkQueue<K, V> {
    state: Mutex<QueueState<K, V>>,
    notify: Notify,
}

impl<K, V> Default for WorkQueue<K, V>
where
    K: Clone + Eq + Hash,
    V: Coalesce,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WorkQueue<K, V>
where
    K: Clone + Eq + Hash,
    V: Coalesce,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `value` under `key`.
    ///
    /// Returns `false` when the value was merged into an existing entry or the
    /// queue is shutting down.
    pub fn add(&self, key: K, value: V) -> bool {
        let mut state = self.lock();
        if state.shutting_down {
            return false;
        }
        if let Some(existing) = state.pending.get_mut(&key) {
            existing.coalesce(value);
            return false;
        }
        state.pending.insert(key.clone(), value);
        if !state.in_flight.contains(&key) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
        true
    }

    /// Enqueue after `delay` elapses.
    pub fn add_after(self: &Arc<Self>, key: K, value: V, delay: Duration)
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key, value);
        });
    }

    /// Wait for the next ready key; `None` once the queue shuts down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn next(&self) -> Option<(K, V)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.ready.pop_front() {
                    if let Some(value) = state.pending.remove(&key) {
                        state.in_flight.insert(key.clone());
                        return Some((key, value));
                    }
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by [`WorkQueue::next`].
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        if state.pending.contains_key(key) && !state.shutting_down {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out work. In-flight keys may still call `done`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to run, including ones parked behind an in-flight run.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Events(Vec<u32>);

    impl Coalesce for Events {
        fn coalesce(&mut self, newer: Self) {
            self.0.extend(newer.0);
        }
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue: WorkQueue<&str, Events> = WorkQueue::new();
        assert!(queue.add("alice", Events(vec![1])));
        assert!(!queue.add("alice", Events(vec![2])));
        assert!(queue.add("bob", Events(vec![3])));
        assert_eq!(queue.len(), 2);

        let (key, value) = queue.next().await.unwrap();
        assert_eq!(key, "alice");
        assert_eq!(value, Events(vec![1, 2]));
        let (key, _) = queue.next().await.unwrap();
        assert_eq!(key, "bob");
    }

    #[tokio::test]
    async fn test_in_flight_key_is_parked_until_done() {
        let queue: WorkQueue<&str, Events> = WorkQueue::new();
        queue.add("alice", Events(vec![1]));
        let (key, _) = queue.next().await.unwrap();

        // Two events arrive while alice is being processed
        queue.add("alice", Events(vec![2]));
        queue.add("alice", Events(vec![3]));
        queue.add("bob", Events(vec![4]));

        // bob is served; alice is not handed to a second worker
        let (next_key, _) = queue.next().await.unwrap();
        assert_eq!(next_key, "bob");
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(blocked.is_err(), "alice must not be handed out while in flight");

        queue.done(&key);
        let (key, value) = queue.next().await.unwrap();
        assert_eq!(key, "alice");
        assert_eq!(value, Events(vec![2, 3]), "pending events collapse into one re-run");
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue: Arc<WorkQueue<&'static str, Events>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(result.is_none());
        assert!(!queue.add("alice", Events(vec![1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_delivery() {
        let queue: Arc<WorkQueue<&'static str, Events>> = Arc::new(WorkQueue::new());
        queue.add_after("alice", Events(vec![1]), Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let (key, _) = queue.next().await.unwrap();
        assert_eq!(key, "alice");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_processing_of_same_key() {
        let queue: Arc<WorkQueue<u32, Events>> = Arc::new(WorkQueue::new());
        let active: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
        let violations = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let violations = Arc::clone(&violations);
            let processed = Arc::clone(&processed);
            workers.push(tokio::spawn(async move {
                while let Some((key, _)) = queue.next().await {
                    let slot = &active[key as usize];
                    if slot.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    slot.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            }));
        }

        for round in 0..200u32 {
            queue.add(round % 4, Events(vec![round]));
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }

        // Let the pool drain
        for _ in 0..200 {
            if queue.is_empty() && queue.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(processed.load(Ordering::SeqCst) >= 4);
    }
}
