//! Proxy-list provider: a fetched subscription parsed into adapters.

use super::{
    Fetcher, HealthCheck, MemberSource, ProxyProvider, SubscriptionInfo, Vehicle, VehicleType,
};
use crate::config::ProxyConfig;
use crate::dns::Resolver;
use crate::outbound::{build_proxy, OutboundProxy};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Deserialize)]
struct ProxyListDocument {
    proxies: Vec<ProxyConfig>,
}

/// Shared payload; swapped atomically on update so readers always see a
/// whole list.
struct Payload {
    proxies: ArcSwap<Vec<Arc<dyn OutboundProxy>>>,
}

impl MemberSource for Payload {
    fn members(&self) -> Vec<Arc<dyn OutboundProxy>> {
        self.proxies.load().as_ref().clone()
    }
}

/// HTTP or file backed proxy provider.
pub struct ProxySetProvider {
    name: String,
    payload: Arc<Payload>,
    fetcher: Arc<Fetcher<Vec<Arc<dyn OutboundProxy>>>>,
    health_check: Arc<HealthCheck>,
}

impl ProxySetProvider {
    pub fn new(
        name: String,
        vehicle: Arc<dyn Vehicle>,
        interval: Duration,
        health_check_url: String,
        health_check_interval: Duration,
        lazy: bool,
        resolver: Arc<Resolver>,
    ) -> Arc<Self> {
        let payload = Arc::new(Payload {
            proxies: ArcSwap::from_pointee(Vec::new()),
        });

        let parser_resolver = resolver.clone();
        let parser_name = name.clone();
        let parser = Arc::new(move |buf: &[u8]| parse_proxies(&parser_name, buf, &parser_resolver));

        let update_payload = payload.clone();
        let update_name = name.clone();
        let on_update = Arc::new(move |proxies: Vec<Arc<dyn OutboundProxy>>| {
            info!("[Provider] {} now carries {} proxies", update_name, proxies.len());
            update_payload.proxies.store(Arc::new(proxies));
        });

        let fetcher = Fetcher::new(name.clone(), vehicle, interval, parser, Some(on_update));

        let health_check = Arc::new(HealthCheck::new(
            health_check_url,
            health_check_interval,
            lazy,
            payload.clone() as Arc<dyn MemberSource>,
        ));

        Arc::new(ProxySetProvider {
            name,
            payload,
            fetcher,
            health_check,
        })
    }
}

fn parse_proxies(
    name: &str,
    buf: &[u8],
    resolver: &Arc<Resolver>,
) -> Result<Vec<Arc<dyn OutboundProxy>>> {
    let doc: ProxyListDocument = serde_yaml::from_slice(buf)
        .map_err(|e| Error::provider(format!("provider {}: {}", name, e)))?;
    if doc.proxies.is_empty() {
        return Err(Error::provider(format!("provider {}: empty proxy list", name)));
    }

    let mut proxies = Vec::with_capacity(doc.proxies.len());
    for config in &doc.proxies {
        config.validate()?;
        proxies.push(build_proxy(config, resolver.clone())?);
    }
    Ok(proxies)
}

#[async_trait]
impl ProxyProvider for ProxySetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        self.fetcher.vehicle_type()
    }

    fn proxies(&self) -> Vec<Arc<dyn OutboundProxy>> {
        self.payload.members()
    }

    async fn initial(&self) -> Result<()> {
        if let Some(proxies) = self.fetcher.initial().await? {
            self.payload.proxies.store(Arc::new(proxies));
        }

        if self.health_check.is_auto() {
            let hc = self.health_check.clone();
            tokio::spawn(hc.start());
        }
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        let (parsed, same) = self.fetcher.update().await?;
        if let (Some(proxies), false) = (parsed, same) {
            self.payload.proxies.store(Arc::new(proxies));
        }
        Ok(())
    }

    async fn health_check(&self) {
        self.health_check.check().await;
    }

    fn touch(&self) {
        self.health_check.touch();
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.fetcher.updated_at()
    }

    fn subscription_info(&self) -> Option<SubscriptionInfo> {
        self.fetcher.subscription_info()
    }

    async fn close(&self) {
        self.fetcher.destroy();
        self.health_check.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use crate::geodata::GeoData;
    use std::collections::HashMap;

    fn resolver() -> Arc<Resolver> {
        Arc::new(
            Resolver::new(
                &DnsConfig::default(),
                &HashMap::new(),
                Arc::new(GeoData::default()),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_parse_proxy_list() {
        let yaml = br#"
proxies:
  - name: up-1
    type: socks5
    server: 10.0.0.1
    port: 1080
  - name: up-2
    type: http
    server: 10.0.0.2
    port: 8080
"#;
        let proxies = parse_proxies("sub", yaml, &resolver()).unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].name(), "up-1");
        assert_eq!(proxies[1].name(), "up-2");
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(parse_proxies("sub", b"proxies: []", &resolver()).is_err());
        assert!(parse_proxies("sub", b"not yaml: [", &resolver()).is_err());
    }
}
