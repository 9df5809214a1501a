//! Providers: periodically refreshed sources of proxies and rules.

mod fetcher;
mod healthcheck;
mod proxy;
mod rule;
mod vehicle;

pub use fetcher::Fetcher;
pub use healthcheck::{HealthCheck, MemberSource};
pub use proxy::ProxySetProvider;
pub use rule::{RuleBehavior, RuleSetProvider};
pub use vehicle::{FileVehicle, HttpVehicle, Vehicle};

use crate::common::Metadata;
use crate::outbound::OutboundProxy;
use crate::rule::ProviderMatch;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// How a provider's data is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleType {
    Http,
    File,
    /// Produced internally (script auto-registration)
    Compatible,
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleType::Http => write!(f, "HTTP"),
            VehicleType::File => write!(f, "File"),
            VehicleType::Compatible => write!(f, "Compatible"),
        }
    }
}

/// Subscription quota parsed from the `Subscription-Userinfo` header
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    pub expire: u64,
}

impl SubscriptionInfo {
    /// Parse `upload=…; download=…; total=…; expire=…`
    pub fn parse(header: &str) -> Option<Self> {
        let mut info = SubscriptionInfo::default();
        let mut matched = false;
        for part in header.split(';') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim().to_lowercase().as_str() {
                "upload" => info.upload = value,
                "download" => info.download = value,
                "total" => info.total = value,
                "expire" => info.expire = value,
                _ => continue,
            }
            matched = true;
        }
        matched.then_some(info)
    }
}

/// Proxy-list provider contract.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    fn name(&self) -> &str;

    fn vehicle_type(&self) -> VehicleType;

    /// Current payload; readers see either the old or the new whole
    fn proxies(&self) -> Vec<Arc<dyn OutboundProxy>>;

    fn count(&self) -> usize {
        self.proxies().len()
    }

    /// First load: cache if fresh, otherwise fetch; starts the pull loop
    async fn initial(&self) -> Result<()>;

    /// Force a fetch-and-parse now
    async fn update(&self) -> Result<()>;

    async fn health_check(&self);

    /// Mark recently used (touch-on-use probing)
    fn touch(&self);

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    fn subscription_info(&self) -> Option<SubscriptionInfo>;

    /// Stop the fetcher and probes. Calling twice is a no-op.
    async fn close(&self);
}

/// All providers, plus the read-only view scripts get.
#[derive(Default)]
pub struct ProviderManager {
    proxy_providers: RwLock<HashMap<String, Arc<dyn ProxyProvider>>>,
    rule_providers: RwLock<HashMap<String, Arc<RuleSetProvider>>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proxy_provider(&self, provider: Arc<dyn ProxyProvider>) {
        self.proxy_providers
            .write()
            .insert(provider.name().to_string(), provider);
    }

    pub fn proxy_provider(&self, name: &str) -> Option<Arc<dyn ProxyProvider>> {
        self.proxy_providers.read().get(name).cloned()
    }

    pub fn proxy_providers(&self) -> HashMap<String, Arc<dyn ProxyProvider>> {
        self.proxy_providers.read().clone()
    }

    pub fn add_rule_provider(&self, provider: Arc<RuleSetProvider>) {
        self.rule_providers
            .write()
            .insert(provider.name().to_string(), provider);
    }

    pub fn rule_provider(&self, name: &str) -> Option<Arc<RuleSetProvider>> {
        self.rule_providers.read().get(name).cloned()
    }

    pub fn rule_providers(&self) -> HashMap<String, Arc<RuleSetProvider>> {
        self.rule_providers.read().clone()
    }

    /// Stop every provider exactly once; part of config teardown.
    pub async fn close_all(&self) {
        let proxies: Vec<_> = self.proxy_providers.read().values().cloned().collect();
        for provider in proxies {
            provider.close().await;
        }
        let rules: Vec<_> = self.rule_providers.read().values().cloned().collect();
        for provider in rules {
            provider.close().await;
        }
    }
}

impl ProviderMatch for ProviderManager {
    fn match_metadata(&self, name: &str, metadata: &Metadata) -> Option<bool> {
        let provider = self.rule_provider(name)?;
        Some(provider.match_metadata(metadata))
    }

    fn match_ip(&self, name: &str, ip: IpAddr) -> Option<bool> {
        let provider = self.rule_provider(name)?;
        Some(provider.match_ip(ip))
    }

    fn provider_needs_ip(&self, name: &str) -> bool {
        self.rule_provider(name)
            .map(|p| p.behavior() == RuleBehavior::IpCidr)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_info_parse() {
        let header = "upload=1234; download=5678; total=10000000; expire=1704067200";
        let info = SubscriptionInfo::parse(header).unwrap();
        assert_eq!(info.upload, 1234);
        assert_eq!(info.download, 5678);
        assert_eq!(info.total, 10000000);
        assert_eq!(info.expire, 1704067200);

        assert!(SubscriptionInfo::parse("garbage").is_none());
    }

    #[test]
    fn test_vehicle_type_display() {
        assert_eq!(VehicleType::Http.to_string(), "HTTP");
        assert_eq!(VehicleType::Compatible.to_string(), "Compatible");
    }
}
