//! Rule-set provider: a refreshed list of match entries.

use super::{Fetcher, ProxyProvider, SubscriptionInfo, Vehicle, VehicleType};
use crate::common::Metadata;
use crate::geodata::GeoSiteMatcher;
use crate::rule::{DomainTrie, Rule};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// What the provider's entries mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleBehavior {
    /// Domain patterns through the shared trie
    Domain,
    /// CIDR entries matched against the destination address
    IpCidr,
    /// Full `TYPE,payload` rule lines
    Classical,
}

impl RuleBehavior {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "domain" => Ok(RuleBehavior::Domain),
            "ipcidr" => Ok(RuleBehavior::IpCidr),
            "classical" => Ok(RuleBehavior::Classical),
            other => Err(Error::config(format!("unknown rule behavior: {}", other))),
        }
    }
}

enum RulePayload {
    Domain(DomainTrie<()>),
    IpCidr(Vec<IpNet>),
    Classical(Vec<Rule>),
    GeoSite(Arc<GeoSiteMatcher>),
}

impl RulePayload {
    fn len(&self) -> usize {
        match self {
            RulePayload::Domain(trie) => trie.len(),
            RulePayload::IpCidr(nets) => nets.len(),
            RulePayload::Classical(rules) => rules.len(),
            RulePayload::GeoSite(matcher) => matcher.len(),
        }
    }
}

#[derive(Deserialize)]
struct PayloadDocument {
    payload: Vec<String>,
}

/// A rule provider. Classical entries get the full rule matcher; domain
/// and ipcidr behaviors match on the host or destination address alone.
pub struct RuleSetProvider {
    name: String,
    behavior: RuleBehavior,
    payload: Arc<ArcSwap<RulePayload>>,
    fetcher: Option<Arc<Fetcher<RulePayload>>>,
    vehicle_type: VehicleType,
}

impl RuleSetProvider {
    pub fn new(
        name: String,
        behavior: RuleBehavior,
        vehicle: Arc<dyn Vehicle>,
        interval: Duration,
    ) -> Arc<Self> {
        let payload = Arc::new(ArcSwap::from_pointee(RulePayload::Domain(DomainTrie::new())));

        let parser_behavior = behavior;
        let parser_name = name.clone();
        let parser =
            Arc::new(move |buf: &[u8]| parse_payload(&parser_name, parser_behavior, buf));

        let update_payload = payload.clone();
        let on_update = Arc::new(move |parsed: RulePayload| {
            update_payload.store(Arc::new(parsed));
        });

        let vehicle_type = vehicle.vehicle_type();
        let fetcher = Fetcher::new(name.clone(), vehicle, interval, parser, Some(on_update));

        Arc::new(RuleSetProvider {
            name,
            behavior,
            payload,
            fetcher: Some(fetcher),
            vehicle_type,
        })
    }

    /// Internal provider backed by a GeoSite list, created when scripts
    /// reference a provider that is not configured.
    pub fn from_geosite(name: String, matcher: Arc<GeoSiteMatcher>) -> Arc<Self> {
        Arc::new(RuleSetProvider {
            name,
            behavior: RuleBehavior::Domain,
            payload: Arc::new(ArcSwap::from_pointee(RulePayload::GeoSite(matcher))),
            fetcher: None,
            vehicle_type: VehicleType::Compatible,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> RuleBehavior {
        self.behavior
    }

    pub fn rule_count(&self) -> usize {
        self.payload.load().len()
    }

    pub async fn initial(&self) -> Result<()> {
        if let Some(ref fetcher) = self.fetcher {
            if let Some(parsed) = fetcher.initial().await? {
                self.payload.store(Arc::new(parsed));
            }
        }
        Ok(())
    }

    pub async fn update(&self) -> Result<()> {
        if let Some(ref fetcher) = self.fetcher {
            let (parsed, same) = fetcher.update().await?;
            if let (Some(payload), false) = (parsed, same) {
                self.payload.store(Arc::new(payload));
            }
        }
        Ok(())
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.fetcher.as_ref().and_then(|f| f.updated_at())
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    pub async fn close(&self) {
        if let Some(ref fetcher) = self.fetcher {
            fetcher.destroy();
        }
    }

    /// Match the metadata against this set.
    ///
    /// Classical rules get the host/port matcher without resolution or
    /// script helpers (side-effect free by construction).
    pub fn match_metadata(&self, metadata: &Metadata) -> bool {
        match self.payload.load().as_ref() {
            RulePayload::Domain(trie) => {
                !metadata.host.is_empty() && trie.contains(&metadata.host)
            }
            RulePayload::GeoSite(matcher) => {
                !metadata.host.is_empty() && matcher.matches(&metadata.host)
            }
            RulePayload::IpCidr(nets) => metadata
                .dst_ip
                .map(|ip| nets.iter().any(|net| net.contains(&ip)))
                .unwrap_or(false),
            RulePayload::Classical(rules) => {
                rules.iter().any(|rule| classical_matches(rule, metadata))
            }
        }
    }

    /// Membership test for `in_ipset`.
    pub fn match_ip(&self, ip: IpAddr) -> bool {
        match self.payload.load().as_ref() {
            RulePayload::IpCidr(nets) => nets.iter().any(|net| net.contains(&ip)),
            _ => false,
        }
    }
}

/// Synchronous subset of rule matching used for classical payload entries.
fn classical_matches(rule: &Rule, metadata: &Metadata) -> bool {
    let host = metadata.host.to_lowercase();
    match rule {
        Rule::Domain { domain, .. } => !host.is_empty() && host == *domain,
        Rule::DomainSuffix { suffix, .. } => {
            !host.is_empty() && (host == *suffix || host.ends_with(&format!(".{}", suffix)))
        }
        Rule::DomainKeyword { keyword, .. } => !host.is_empty() && host.contains(keyword),
        Rule::IpCidr { net, src, .. } => {
            let ip = if *src { Some(metadata.src_ip) } else { metadata.dst_ip };
            ip.map(|ip| net.contains(&ip)).unwrap_or(false)
        }
        Rule::Port { range, src, .. } => {
            let port = if *src { metadata.src_port } else { metadata.dst_port };
            range.contains(port)
        }
        Rule::Network { network, .. } => metadata.network == *network,
        Rule::ProcessName { name, path, .. } => {
            let value = if *path {
                metadata.process_path.as_deref()
            } else {
                metadata.process.as_deref()
            };
            value
                .map(|v| {
                    let v = v.to_lowercase();
                    v == *name || v.ends_with(name)
                })
                .unwrap_or(false)
        }
        // Nested providers, scripts, and geo rules are not allowed inside
        // classical payloads
        _ => false,
    }
}

fn parse_payload(name: &str, behavior: RuleBehavior, buf: &[u8]) -> Result<RulePayload> {
    let doc: PayloadDocument = serde_yaml::from_slice(buf)
        .map_err(|e| Error::provider(format!("rule provider {}: {}", name, e)))?;

    match behavior {
        RuleBehavior::Domain => {
            let mut trie = DomainTrie::new();
            for entry in &doc.payload {
                trie.insert(entry, ());
            }
            Ok(RulePayload::Domain(trie))
        }
        RuleBehavior::IpCidr => {
            let mut nets = Vec::with_capacity(doc.payload.len());
            for entry in &doc.payload {
                let net = entry
                    .parse()
                    .map_err(|e| Error::provider(format!("rule provider {}: {}: {}", name, entry, e)))?;
                nets.push(net);
            }
            Ok(RulePayload::IpCidr(nets))
        }
        RuleBehavior::Classical => {
            let shortcuts = HashMap::new();
            let mut rules = Vec::with_capacity(doc.payload.len());
            for entry in &doc.payload {
                // Payload lines carry no target; reuse the rule parser with
                // a placeholder
                let line = format!("{},{}", entry.trim_end_matches(','), "__PROVIDER__");
                rules.push(Rule::parse(&line, &shortcuts)?);
            }
            Ok(RulePayload::Classical(rules))
        }
    }
}

// The trait objects below keep rule providers listable next to proxy
// providers in management surfaces.
#[async_trait]
impl ProxyProvider for RuleSetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    fn proxies(&self) -> Vec<Arc<dyn crate::outbound::OutboundProxy>> {
        Vec::new()
    }

    async fn initial(&self) -> Result<()> {
        RuleSetProvider::initial(self).await
    }

    async fn update(&self) -> Result<()> {
        RuleSetProvider::update(self).await
    }

    async fn health_check(&self) {}

    fn touch(&self) {}

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        RuleSetProvider::updated_at(self)
    }

    fn subscription_info(&self) -> Option<SubscriptionInfo> {
        None
    }

    async fn close(&self) {
        RuleSetProvider::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;

    fn meta(host: &str, port: u16) -> Metadata {
        Metadata::tcp(SourceType::Socks)
            .with_host(host)
            .with_dst_port(port)
    }

    #[test]
    fn test_domain_behavior() {
        let payload = parse_payload(
            "t",
            RuleBehavior::Domain,
            b"payload:\n  - '+.example.com'\n  - 'exact.net'\n",
        )
        .unwrap();
        let provider = RuleSetProvider {
            name: "t".to_string(),
            behavior: RuleBehavior::Domain,
            payload: Arc::new(ArcSwap::from_pointee(payload)),
            fetcher: None,
            vehicle_type: VehicleType::File,
        };

        assert!(provider.match_metadata(&meta("cdn.example.com", 443)));
        assert!(provider.match_metadata(&meta("exact.net", 443)));
        assert!(!provider.match_metadata(&meta("other.org", 443)));
    }

    #[test]
    fn test_ipcidr_behavior() {
        let payload = parse_payload(
            "t",
            RuleBehavior::IpCidr,
            b"payload:\n  - '10.0.0.0/8'\n  - '203.0.113.0/24'\n",
        )
        .unwrap();
        let provider = RuleSetProvider {
            name: "t".to_string(),
            behavior: RuleBehavior::IpCidr,
            payload: Arc::new(ArcSwap::from_pointee(payload)),
            fetcher: None,
            vehicle_type: VehicleType::File,
        };

        let mut m = meta("", 443);
        m.dst_ip = Some("10.4.5.6".parse().unwrap());
        assert!(provider.match_metadata(&m));
        assert!(provider.match_ip("203.0.113.9".parse().unwrap()));
        assert!(!provider.match_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_classical_behavior() {
        let payload = parse_payload(
            "t",
            RuleBehavior::Classical,
            b"payload:\n  - 'DOMAIN-SUFFIX,tracker.io'\n  - 'DST-PORT,6881-6889'\n",
        )
        .unwrap();
        let provider = RuleSetProvider {
            name: "t".to_string(),
            behavior: RuleBehavior::Classical,
            payload: Arc::new(ArcSwap::from_pointee(payload)),
            fetcher: None,
            vehicle_type: VehicleType::File,
        };

        assert!(provider.match_metadata(&meta("a.tracker.io", 443)));
        assert!(provider.match_metadata(&meta("x.com", 6882)));
        assert!(!provider.match_metadata(&meta("x.com", 80)));
    }

    #[test]
    fn test_bad_cidr_surfaces() {
        assert!(parse_payload("t", RuleBehavior::IpCidr, b"payload: ['not-a-cidr']").is_err());
    }
}
