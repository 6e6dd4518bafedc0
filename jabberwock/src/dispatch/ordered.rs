//! Per-key ordered execution of otherwise concurrent tasks.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

/// Runs tasks concurrently across keys but strictly in submission order
/// within a key.
///
/// A key gets a queue and a single executor task lazily on first use; the
/// executor drains the queue and removes the key when it runs dry. The
/// map entry existing is the invariant for "an executor is running", and
/// both the emptiness check and the removal happen under the same lock, so
/// a task enqueued concurrently with executor shutdown is either picked up
/// by the old executor or starts a new one; it can never be stranded.
pub struct AsyncButOrdered<K> {
    queues: Arc<Mutex<HashMap<K, VecDeque<BoxFuture<'static, ()>>>>>,
}

impl<K> Clone for AsyncButOrdered<K> {
    fn clone(&self) -> Self {
        AsyncButOrdered {
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<K> Default for AsyncButOrdered<K> {
    fn default() -> Self {
        AsyncButOrdered {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> AsyncButOrdered<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits `task` for `key`. Must be called from within a tokio
    /// runtime.
    pub fn enqueue(&self, key: K, task: BoxFuture<'static, ()>) {
        let mut queues = self.queues.lock().unwrap();
        match queues.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push_back(task);
            }
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                let queues = Arc::clone(&self.queues);
                tokio::spawn(async move {
                    let mut current = task;
                    loop {
                        current.await;
                        let next = {
                            let mut queues = queues.lock().unwrap();
                            match queues.get_mut(&key).and_then(|queue| queue.pop_front()) {
                                Some(next) => next,
                                None => {
                                    queues.remove(&key);
                                    break;
                                }
                            }
                        };
                        current = next;
                    }
                });
            }
        }
    }

    /// Number of keys with a live executor.
    pub fn active_keys(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_in_submission_order() {
        let ordered = AsyncButOrdered::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10u32 {
            let tx = tx.clone();
            ordered.enqueue(
                "juliet@example.com",
                Box::pin(async move {
                    // Earlier tasks sleep longer; only ordering keeps the
                    // output sorted.
                    tokio::time::sleep(Duration::from_millis(10u64.saturating_sub(i as u64)))
                        .await;
                    tx.send(i).unwrap();
                }),
            );
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_keys_run_concurrently() {
        let ordered = AsyncButOrdered::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();
        for key in ["a", "b", "c", "d"] {
            let tx = tx.clone();
            ordered.enqueue(
                key,
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    tx.send(key).unwrap();
                }),
            );
        }
        drop(tx);
        let mut done = 0;
        while rx.recv().await.is_some() {
            done += 1;
        }
        assert_eq!(done, 4);
        // Serialized execution would need 200ms.
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn idle_keys_are_garbage_collected() {
        let ordered = AsyncButOrdered::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            let tx = tx.clone();
            ordered.enqueue("key", Box::pin(async move {
                tx.send(()).unwrap();
            }));
        }
        drop(tx);
        while rx.recv().await.is_some() {}
        // The executor removes the entry under the lock before exiting;
        // yield until it has.
        for _ in 0..100 {
            if ordered.active_keys() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ordered.active_keys(), 0);
    }
}
