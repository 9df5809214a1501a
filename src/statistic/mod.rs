//! Connection records and traffic accounting.

mod tracker;

pub use tracker::{ConnectionInfo, ConnectionRecord, TrackedConnection};

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct ProxyTraffic {
    upload: AtomicU64,
    download: AtomicU64,
}

/// Tracks live connections, global rates, and per-proxy totals.
pub struct StatisticManager {
    connections: DashMap<String, Arc<TrackedConnection>>,
    per_proxy: DashMap<String, Arc<ProxyTraffic>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    upload_temp: AtomicU64,
    download_temp: AtomicU64,
}

impl StatisticManager {
    pub fn new() -> Self {
        StatisticManager {
            connections: DashMap::new(),
            per_proxy: DashMap::new(),
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            upload_temp: AtomicU64::new(0),
            download_temp: AtomicU64::new(0),
        }
    }

    /// Reset the per-second counters once a second.
    pub fn start_ticker(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                this.upload_temp.store(0, Ordering::Relaxed);
                this.download_temp.store(0, Ordering::Relaxed);
            }
        });
    }

    /// Current (upload, download) rate in bytes per second
    pub fn rate(&self) -> (u64, u64) {
        (
            self.upload_temp.load(Ordering::Relaxed),
            self.download_temp.load(Ordering::Relaxed),
        )
    }

    pub fn total(&self) -> (u64, u64) {
        (
            self.upload_total.load(Ordering::Relaxed),
            self.download_total.load(Ordering::Relaxed),
        )
    }

    /// Total (upload, download) carried through a named proxy
    pub fn proxy_total(&self, proxy: &str) -> (u64, u64) {
        self.per_proxy
            .get(proxy)
            .map(|t| {
                (
                    t.upload.load(Ordering::Relaxed),
                    t.download.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }

    pub fn generate_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn track(&self, conn: TrackedConnection) -> Arc<TrackedConnection> {
        let conn = Arc::new(conn);
        self.connections.insert(conn.id.clone(), conn.clone());
        conn
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedConnection>> {
        self.connections.get(id).map(|r| r.value().clone())
    }

    pub fn close(&self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Published connection records for telemetry consumers.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            upload_total: self.upload_total.load(Ordering::Relaxed),
            download_total: self.download_total.load(Ordering::Relaxed),
            connections: self
                .connections
                .iter()
                .map(|r| r.value().to_info())
                .collect(),
        }
    }

    pub fn add_upload(&self, proxy: &str, bytes: u64) {
        self.upload_total.fetch_add(bytes, Ordering::Relaxed);
        self.upload_temp.fetch_add(bytes, Ordering::Relaxed);
        self.proxy_entry(proxy)
            .upload
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, proxy: &str, bytes: u64) {
        self.download_total.fetch_add(bytes, Ordering::Relaxed);
        self.download_temp.fetch_add(bytes, Ordering::Relaxed);
        self.proxy_entry(proxy)
            .download
            .fetch_add(bytes, Ordering::Relaxed);
    }

    fn proxy_entry(&self, proxy: &str) -> Arc<ProxyTraffic> {
        self.per_proxy
            .entry(proxy.to_string())
            .or_default()
            .clone()
    }
}

impl Default for StatisticManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of traffic and connections
#[derive(Debug, Serialize)]
pub struct Snapshot {
    #[serde(rename = "uploadTotal")]
    pub upload_total: u64,
    #[serde(rename = "downloadTotal")]
    pub download_total: u64,
    pub connections: Vec<ConnectionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_accounting() {
        let stats = StatisticManager::new();
        stats.add_upload("ProxyA", 100);
        stats.add_download("ProxyA", 200);
        stats.add_upload("ProxyB", 10);

        assert_eq!(stats.total(), (110, 200));
        assert_eq!(stats.proxy_total("ProxyA"), (100, 200));
        assert_eq!(stats.proxy_total("ProxyB"), (10, 0));
        assert_eq!(stats.proxy_total("missing"), (0, 0));
    }

    #[test]
    fn test_track_and_close() {
        let stats = StatisticManager::new();
        let conn = TrackedConnection::new(
            stats.generate_id(),
            ConnectionRecord::default(),
            vec!["DIRECT".to_string()],
            "MATCH".to_string(),
            String::new(),
        );
        let id = conn.id.clone();
        stats.track(conn);

        assert_eq!(stats.connection_count(), 1);
        assert!(stats.get(&id).is_some());
        assert!(stats.close(&id));
        assert!(!stats.close(&id));
        assert_eq!(stats.connection_count(), 0);
    }
}
