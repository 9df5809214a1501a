//! Per-connection tracking record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Static facts about a tracked connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionRecord {
    pub network: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(rename = "sourcePort")]
    pub source_port: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: String,
    pub host: String,
    #[serde(rename = "dnsMode")]
    pub dns_mode: String,
}

/// A live connection with its counters.
pub struct TrackedConnection {
    pub id: String,
    pub record: ConnectionRecord,
    /// Proxy chain used, outermost first
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub start: DateTime<Utc>,
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrackedConnection {
    pub fn new(
        id: String,
        record: ConnectionRecord,
        chains: Vec<String>,
        rule: String,
        rule_payload: String,
    ) -> Self {
        TrackedConnection {
            id,
            record,
            chains,
            rule,
            rule_payload,
            start: Utc::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            metadata: self.record.clone(),
            upload: self.upload(),
            download: self.download(),
            start: self.start,
            chains: self.chains.clone(),
            rule: self.rule.clone(),
            rule_payload: self.rule_payload.clone(),
        }
    }
}

/// Published record for telemetry
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub metadata: ConnectionRecord,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let conn = TrackedConnection::new(
            "id-1".to_string(),
            ConnectionRecord::default(),
            vec!["Proxy".to_string(), "DIRECT".to_string()],
            "DOMAIN-SUFFIX".to_string(),
            "example.com".to_string(),
        );

        conn.add_upload(100);
        conn.add_download(200);

        let info = conn.to_info();
        assert_eq!(info.upload, 100);
        assert_eq!(info.download, 200);
        assert_eq!(info.chains, vec!["Proxy", "DIRECT"]);
        assert_eq!(info.rule, "DOMAIN-SUFFIX");
    }
}
