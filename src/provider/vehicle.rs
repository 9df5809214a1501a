//! Vehicles: where provider bytes come from.

use super::SubscriptionInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A source of raw provider bytes plus its on-disk cache location.
#[async_trait]
pub trait Vehicle: Send + Sync {
    fn vehicle_type(&self) -> super::VehicleType;

    /// Local cache path
    fn path(&self) -> &Path;

    /// Whether fetching rides through a proxy; such vehicles defer their
    /// first network fetch until proxies are up
    fn proxy_bound(&self) -> bool {
        false
    }

    async fn read(&self) -> Result<(Vec<u8>, Option<SubscriptionInfo>)>;
}

/// Local file vehicle; `read` is the file itself.
pub struct FileVehicle {
    path: PathBuf,
}

impl FileVehicle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileVehicle { path: path.into() }
    }
}

#[async_trait]
impl Vehicle for FileVehicle {
    fn vehicle_type(&self) -> super::VehicleType {
        super::VehicleType::File
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<(Vec<u8>, Option<SubscriptionInfo>)> {
        let buf = tokio::fs::read(&self.path).await?;
        Ok((buf, None))
    }
}

/// HTTP vehicle with a local cache file.
pub struct HttpVehicle {
    url: String,
    path: PathBuf,
    proxy: Option<String>,
    client: reqwest::Client,
}

impl HttpVehicle {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>, proxy: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::provider(format!("http vehicle: {}", e)))?;
        Ok(HttpVehicle {
            url: url.into(),
            path: path.into(),
            proxy,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Vehicle for HttpVehicle {
    fn vehicle_type(&self) -> super::VehicleType {
        super::VehicleType::Http
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn proxy_bound(&self) -> bool {
        self.proxy.is_some()
    }

    async fn read(&self) -> Result<(Vec<u8>, Option<SubscriptionInfo>)> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::provider(format!("fetch {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(Error::provider(format!(
                "fetch {}: status {}",
                self.url,
                response.status()
            )));
        }

        let info = response
            .headers()
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .and_then(SubscriptionInfo::parse);

        let buf = response
            .bytes()
            .await
            .map_err(|e| Error::provider(format!("fetch {}: {}", self.url, e)))?;
        Ok((buf.to_vec(), info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_vehicle_reads_disk() {
        let path = std::env::temp_dir().join(format!("vehicle-test-{}", std::process::id()));
        tokio::fs::write(&path, b"payload: []").await.unwrap();

        let vehicle = FileVehicle::new(&path);
        assert_eq!(vehicle.vehicle_type(), super::super::VehicleType::File);
        let (buf, info) = vehicle.read().await.unwrap();
        assert_eq!(buf, b"payload: []");
        assert!(info.is_none());

        tokio::fs::remove_file(&path).await.ok();
    }

    #[test]
    fn test_http_vehicle_proxy_bound() {
        let plain = HttpVehicle::new("http://example.com/sub", "/tmp/sub.yaml", None).unwrap();
        assert!(!plain.proxy_bound());

        let bound =
            HttpVehicle::new("http://example.com/sub", "/tmp/sub.yaml", Some("Proxy".into()))
                .unwrap();
        assert!(bound.proxy_bound());
    }
}
