//! Per-key in-flight call deduplication.
//!
//! Concurrent callers for the same key await the leader's result instead of
//! issuing duplicate work. Used by the DNS resolver and the DHCP client.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

type Shared<V> = Arc<std::result::Result<V, String>>;

/// Keyed single-flight group.
pub struct SingleFlight<V: Clone> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<Shared<V>>>>>,
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fut` for `key`, or join an in-flight call for the same key.
    ///
    /// Errors are shared with joiners as strings; the leader's typed error
    /// is preserved for the leader itself.
    pub async fn execute<F>(&self, key: &str, fut: F) -> Result<V>
    where
        F: Future<Output = Result<V>>,
    {
        enum Path<V> {
            Join(watch::Receiver<Option<Shared<V>>>),
            Lead(watch::Sender<Option<Shared<V>>>),
        }

        let path = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => Path::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx);
                    Path::Lead(tx)
                }
            }
        };

        let mut rx = match path {
            Path::Lead(tx) => return self.lead(key, tx, fut).await,
            Path::Join(rx) => rx,
        };

        loop {
            if let Some(shared) = rx.borrow().clone() {
                return match shared.as_ref() {
                    Ok(v) => Ok(v.clone()),
                    Err(msg) => Err(Error::internal(msg.clone())),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::internal("singleflight leader dropped"));
            }
        }
    }

    async fn lead<F>(
        &self,
        key: &str,
        tx: watch::Sender<Option<Shared<V>>>,
        fut: F,
    ) -> Result<V>
    where
        F: Future<Output = Result<V>>,
    {
        let result = fut.await;
        let shared: Shared<V> = Arc::new(match &result {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.to_string()),
        });

        self.calls.lock().remove(key);
        let _ = tx.send(Some(shared));
        result
    }

    /// Number of calls currently in flight
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dedup_concurrent_callers() {
        let sf = Arc::new(SingleFlight::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let hits = hits.clone();
            handles.push(tokio::spawn(async move {
                sf.execute("key", async {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(42)
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        // All callers piled onto a small number of leaders (1 in practice,
        // >1 only if a task finished before the last spawned).
        assert!(hits.load(Ordering::SeqCst) < 8);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let sf = SingleFlight::<String>::new();
        let a = sf.execute("a", async { Ok("a".to_string()) }).await.unwrap();
        let b = sf.execute("b", async { Ok("b".to_string()) }).await.unwrap();
        assert_eq!(a, "a");
        assert_eq!(b, "b");
        assert!(sf.is_empty());
    }

    #[tokio::test]
    async fn test_error_propagates() {
        let sf = SingleFlight::<u32>::new();
        let err = sf
            .execute("k", async { Err(Error::dns("boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
