//! Generic call-coalescing, shared by the permission checker
//! and the snapshot service: concurrent callers for the same
//! key await one underlying future instead of each triggering their own.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex as AsyncMutex;

type SharedResult<T> = Shared<BoxFuture<'static, T>>;

/// Coalesces concurrent calls keyed by `K`. `V` must be `Clone` because
/// every waiter receives its own copy of the resolved value (the `Shared`
/// future clones its output).
pub struct SingleFlight<K, V> {
    inflight: AsyncMutex<HashMap<K, SharedResult<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Debug + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Debug + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Runs `make` for `key` unless a call for the same key is already in
    /// flight, in which case the caller awaits that call's result instead.
    pub async fn run<F>(&self, key: K, make: F) -> V
    where
        F: std::future::Future<Output = V> + Send + 'static,
    {
        let mut guard = self.inflight.lock().await;
        if let Some(existing) = guard.get(&key) {
            let fut = existing.clone();
            drop(guard);
            return fut.await;
        }

        let key_for_cleanup = key.clone();
        let shared: SharedResult<V> = make.boxed().shared();
        guard.insert(key.clone(), shared.clone());
        drop(guard);

        let result = shared.await;

        let mut guard = self.inflight.lock().await;
        guard.remove(&key_for_cleanup);
        result
    }

    /// Number of calls currently in flight (diagnostics only).
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_for_same_key_share_one_execution() {
        let sf: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.run("k", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    42
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "only one call should execute");
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let sf: SingleFlight<u32, u32> = SingleFlight::new();
        let a = sf.run(1, async { 10 });
        let b = sf.run(2, async { 20 });
        assert_eq!((a.await, b.await), (10, 20));
    }

    #[tokio::test]
    async fn sequential_calls_for_same_key_each_execute() {
        let sf: SingleFlight<&'static str, u32> = SingleFlight::new();
        assert_eq!(sf.run("k", async { 1 }).await, 1);
        assert_eq!(sf.run("k", async { 2 }).await, 2);
    }
}
