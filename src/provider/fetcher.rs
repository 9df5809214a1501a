//! Periodic resource fetching with content-hash dedup and atomic persist.

use super::{SubscriptionInfo, Vehicle, VehicleType};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First fetch for proxy-bound vehicles waits this long so proxies are up
const PROXY_BOUND_DELAY: Duration = Duration::from_secs(50);

type Parser<V> = Arc<dyn Fn(&[u8]) -> Result<V> + Send + Sync>;
type OnUpdate<V> = Arc<dyn Fn(V) + Send + Sync>;

/// Pulls a remote resource, parses it, persists it atomically, and skips
/// the update callback when the MD5 of the payload is unchanged.
pub struct Fetcher<V: Send + 'static> {
    name: String,
    vehicle: Arc<dyn Vehicle>,
    interval: Duration,
    updated_at: Mutex<Option<DateTime<Utc>>>,
    hash: Mutex<[u8; 16]>,
    parser: Parser<V>,
    on_update: Option<OnUpdate<V>>,
    subscription: Mutex<Option<SubscriptionInfo>>,
    done_tx: mpsc::Sender<()>,
    done_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl<V: Send + 'static> Fetcher<V> {
    pub fn new(
        name: impl Into<String>,
        vehicle: Arc<dyn Vehicle>,
        interval: Duration,
        parser: Parser<V>,
        on_update: Option<OnUpdate<V>>,
    ) -> Arc<Self> {
        // Single-slot done channel so destroy is idempotent
        let (done_tx, done_rx) = mpsc::channel(1);
        Arc::new(Fetcher {
            name: name.into(),
            vehicle,
            interval,
            updated_at: Mutex::new(None),
            hash: Mutex::new([0u8; 16]),
            parser,
            on_update,
            subscription: Mutex::new(None),
            done_tx,
            done_rx: Mutex::new(Some(done_rx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle.vehicle_type()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        *self.updated_at.lock()
    }

    pub fn subscription_info(&self) -> Option<SubscriptionInfo> {
        self.subscription.lock().clone()
    }

    /// Initial load.
    ///
    /// A local cache younger than the interval is parsed in place. A
    /// proxy-bound vehicle with no usable cache defers its first fetch
    /// (returns None) so proxies can come up first. A stale or corrupt
    /// cache falls back to the network.
    pub async fn initial(self: &Arc<Self>) -> Result<Option<V>> {
        let path = self.vehicle.path().to_path_buf();
        let mut is_local = false;
        let mut immediate_update = false;
        let mut buf = Vec::new();

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                buf = tokio::fs::read(&path).await?;
                is_local = true;
                if let Ok(modified) = meta.modified() {
                    let age = modified.elapsed().unwrap_or_default();
                    *self.updated_at.lock() = Some(DateTime::<Utc>::from(modified));
                    immediate_update = !self.interval.is_zero() && age > self.interval;
                }
            }
            Err(_) => {
                if self.vehicle.proxy_bound() {
                    // No cache and the vehicle needs proxies: defer
                    self.spawn_pull_loop(true);
                    return Ok(None);
                }
                let (fetched, info) = self.vehicle.read().await?;
                *self.subscription.lock() = info;
                buf = fetched;
            }
        }

        let parsed = match (self.parser)(&buf) {
            Ok(parsed) => parsed,
            Err(e) if is_local => {
                if self.vehicle.proxy_bound() {
                    self.spawn_pull_loop(true);
                    return Ok(None);
                }
                // Local cache corrupt: fall back to the network
                debug!("[Provider] {} local cache unusable: {}", self.name, e);
                let (fetched, info) = self.vehicle.read().await?;
                *self.subscription.lock() = info;
                buf = fetched;
                is_local = false;
                (self.parser)(&buf)?
            }
            Err(e) => return Err(e),
        };

        if self.vehicle.vehicle_type() != VehicleType::File && !is_local {
            safe_write(&path, &buf).await?;
            *self.updated_at.lock() = Some(Utc::now());
        }
        *self.hash.lock() = md5::compute(&buf).0;

        self.spawn_pull_loop(immediate_update);
        Ok(Some(parsed))
    }

    /// Fetch now. Returns `(None, true)` when the payload hash is
    /// unchanged (mtime refreshed, nothing re-parsed).
    pub async fn update(&self) -> Result<(Option<V>, bool)> {
        let (buf, info) = self.vehicle.read().await?;
        if info.is_some() {
            *self.subscription.lock() = info;
        }

        let hash = md5::compute(&buf).0;
        if *self.hash.lock() == hash {
            *self.updated_at.lock() = Some(Utc::now());
            // Refresh the cache mtime without re-parsing
            if self.vehicle.vehicle_type() != VehicleType::File {
                safe_write(self.vehicle.path(), &buf).await.ok();
            }
            return Ok((None, true));
        }

        let parsed = (self.parser)(&buf)?;

        if self.vehicle.vehicle_type() != VehicleType::File {
            safe_write(self.vehicle.path(), &buf).await?;
        }
        *self.updated_at.lock() = Some(Utc::now());
        *self.hash.lock() = hash;

        Ok((Some(parsed), false))
    }

    /// Stop the pull loop and any pending delayed first fetch. Idempotent.
    pub fn destroy(&self) {
        let _ = self.done_tx.try_send(());
    }

    fn spawn_pull_loop(self: &Arc<Self>, immediate: bool) {
        if self.vehicle.vehicle_type() == VehicleType::File || self.interval.is_zero() {
            return;
        }
        let Some(mut done_rx) = self.done_rx.lock().take() else {
            return; // loop already running
        };

        let fetcher = self.clone();
        tokio::spawn(async move {
            if immediate {
                tokio::select! {
                    _ = tokio::time::sleep(PROXY_BOUND_DELAY) => fetcher.pull_once().await,
                    _ = done_rx.recv() => return,
                }
            }

            let mut ticker = tokio::time::interval(fetcher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = ticker.tick() => fetcher.pull_once().await,
                    _ = done_rx.recv() => return,
                }
            }
        });
    }

    async fn pull_once(&self) {
        debug!("[Provider] {} updating…", self.name);
        match self.update().await {
            Ok((_, true)) => debug!("[Provider] {} unchanged", self.name),
            Ok((Some(parsed), false)) => {
                info!("[Provider] {} updated", self.name);
                if let Some(ref on_update) = self.on_update {
                    on_update(parsed);
                }
            }
            Ok((None, false)) => {}
            Err(e) => warn!("[Provider] {} pull failed: {}", self.name, e),
        }
    }
}

/// Atomic replace: create parents, write a temp file, rename over.
async fn safe_write(path: &std::path::Path, buf: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, buf).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::provider(format!("persist {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemoryVehicle {
        path: PathBuf,
        payload: Mutex<Vec<u8>>,
        reads: AtomicUsize,
    }

    impl MemoryVehicle {
        fn new(path: PathBuf, payload: &[u8]) -> Arc<Self> {
            Arc::new(MemoryVehicle {
                path,
                payload: Mutex::new(payload.to_vec()),
                reads: AtomicUsize::new(0),
            })
        }

        fn set_payload(&self, payload: &[u8]) {
            *self.payload.lock() = payload.to_vec();
        }
    }

    #[async_trait]
    impl Vehicle for MemoryVehicle {
        fn vehicle_type(&self) -> VehicleType {
            VehicleType::Http
        }

        fn path(&self) -> &Path {
            &self.path
        }

        async fn read(&self) -> Result<(Vec<u8>, Option<SubscriptionInfo>)> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok((self.payload.lock().clone(), None))
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fetcher-{}-{}", tag, std::process::id()))
    }

    fn string_parser() -> Parser<String> {
        Arc::new(|buf: &[u8]| {
            std::str::from_utf8(buf)
                .map(|s| s.to_string())
                .map_err(|e| Error::parse(e.to_string()))
        })
    }

    #[tokio::test]
    async fn test_initial_fetches_and_persists() {
        let path = temp_path("initial");
        tokio::fs::remove_file(&path).await.ok();
        let vehicle = MemoryVehicle::new(path.clone(), b"hello");

        let fetcher = Fetcher::new("test", vehicle.clone(), Duration::ZERO, string_parser(), None);
        let parsed = fetcher.initial().await.unwrap();
        assert_eq!(parsed.as_deref(), Some("hello"));

        // Network payload was persisted
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
        fetcher.destroy();
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_update_dedups_on_hash() {
        let path = temp_path("dedup");
        tokio::fs::remove_file(&path).await.ok();
        let vehicle = MemoryVehicle::new(path.clone(), b"v1");

        let updates = Arc::new(AtomicUsize::new(0));
        let updates_cb = updates.clone();
        let on_update: OnUpdate<String> =
            Arc::new(move |_| {
                updates_cb.fetch_add(1, Ordering::SeqCst);
            });

        let fetcher = Fetcher::new(
            "test",
            vehicle.clone(),
            Duration::ZERO,
            string_parser(),
            Some(on_update),
        );
        fetcher.initial().await.unwrap();

        // Identical payload: same=true, nothing parsed
        let (parsed, same) = fetcher.update().await.unwrap();
        assert!(same);
        assert!(parsed.is_none());

        // New payload: parsed, not same
        vehicle.set_payload(b"v2");
        let (parsed, same) = fetcher.update().await.unwrap();
        assert!(!same);
        assert_eq!(parsed.as_deref(), Some("v2"));

        // The ticker path is what fires on_update; updates stay 0 here
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        fetcher.destroy();
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_fresh_local_cache_skips_network() {
        let path = temp_path("local");
        tokio::fs::write(&path, b"cached").await.unwrap();
        let vehicle = MemoryVehicle::new(path.clone(), b"remote");

        let fetcher = Fetcher::new(
            "test",
            vehicle.clone(),
            Duration::from_secs(3600),
            string_parser(),
            None,
        );
        let parsed = fetcher.initial().await.unwrap();
        assert_eq!(parsed.as_deref(), Some("cached"));
        assert_eq!(vehicle.reads.load(Ordering::SeqCst), 0);

        fetcher.destroy();
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let path = temp_path("destroy");
        let vehicle = MemoryVehicle::new(path.clone(), b"x");
        let fetcher = Fetcher::new("test", vehicle, Duration::ZERO, string_parser(), None);
        fetcher.destroy();
        fetcher.destroy();
        fetcher.destroy();
        tokio::fs::remove_file(&path).await.ok();
    }
}
