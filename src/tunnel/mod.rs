//! The dispatcher: metadata in, classified and piped connection out.

mod connection;

pub use connection::{relay, TrackedStream, RELAY_BUFFER_SIZE};

use crate::common::{DnsMode, Metadata};
use crate::config::Mode;
use crate::dns::Resolver;
use crate::outbound::{BoxedPacketConn, DialContext, OutboundProxy, ProxyRegistry};
use crate::rule::RuleEngine;
use crate::statistic::{ConnectionRecord, StatisticManager, TrackedConnection};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// A dialed outbound with its tracking attached.
pub struct OutboundHandle {
    pub stream: TrackedStream,
    pub proxy: String,
    pub rule: String,
    pub rule_payload: String,
}

/// Routes connections: synthesize metadata, classify, dial, account.
pub struct Tunnel {
    registry: Arc<ProxyRegistry>,
    engine: Arc<RuleEngine>,
    resolver: Arc<Resolver>,
    statistic: Arc<StatisticManager>,
    mode: RwLock<Mode>,
    udp_fallback_policy: Option<String>,
    udp_fallback_match: bool,
}

impl Tunnel {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        engine: Arc<RuleEngine>,
        resolver: Arc<Resolver>,
        statistic: Arc<StatisticManager>,
        mode: Mode,
        udp_fallback_policy: Option<String>,
        udp_fallback_match: bool,
    ) -> Self {
        Tunnel {
            registry,
            engine,
            resolver,
            statistic,
            mode: RwLock::new(mode),
            udp_fallback_policy,
            udp_fallback_match,
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.write() = mode;
        info!("mode changed to {}", mode);
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn statistic(&self) -> &Arc<StatisticManager> {
        &self.statistic
    }

    /// Recover the original host behind a synthetic destination address.
    fn preprocess(&self, metadata: &mut Metadata) {
        if let Some(ip) = metadata.dst_ip {
            if let Some(host) = self.resolver.fakeip_to_host(ip) {
                debug!("fake-ip {} recovered as {}", ip, host);
                metadata.host = host;
                metadata.dst_ip = None;
                metadata.dns_mode = DnsMode::FakeIp;
            }
        }
    }

    /// Classify metadata into (proxy-name, rule-kind, rule-payload, chain).
    async fn classify(&self, metadata: &mut Metadata) -> (String, String, String, Vec<String>) {
        if let Some(special) = metadata.special_proxy.clone() {
            return (special, "SPECIAL".to_string(), String::new(), Vec::new());
        }

        match self.mode() {
            Mode::Direct => ("DIRECT".into(), "MODE".into(), "direct".into(), Vec::new()),
            Mode::Global => ("GLOBAL".into(), "MODE".into(), "global".into(), Vec::new()),
            Mode::Script => match self.engine.run_main_script(metadata).await {
                Ok(target) => (target, "SCRIPT".into(), "main".into(), Vec::new()),
                Err(e) => {
                    // A script failure is a classification failure: DIRECT
                    warn!("script classification failed: {}", e);
                    ("DIRECT".into(), "SCRIPT".into(), "error".into(), Vec::new())
                }
            },
            Mode::Rule => match self.engine.match_rules(metadata).await {
                Some(matched) => (matched.target, matched.kind, matched.payload, matched.chain),
                None => {
                    debug!("no rule matched {}, defaulting to DIRECT", metadata);
                    ("DIRECT".into(), "MATCH".into(), "default".into(), Vec::new())
                }
            },
        }
    }

    fn record_of(metadata: &Metadata) -> ConnectionRecord {
        ConnectionRecord {
            network: metadata.network.to_string().to_lowercase(),
            source_type: metadata.source_type.to_string(),
            source_ip: metadata.src_ip.to_string(),
            source_port: metadata.src_port.to_string(),
            destination_ip: metadata
                .dst_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            destination_port: metadata.dst_port.to_string(),
            host: metadata.host.clone(),
            dns_mode: format!("{:?}", metadata.dns_mode).to_lowercase(),
        }
    }

    /// Classify and dial a TCP-ish outbound for `metadata`.
    pub async fn connect(&self, metadata: &mut Metadata) -> Result<OutboundHandle> {
        self.preprocess(metadata);
        if !metadata.valid() {
            return Err(Error::address(format!("incomplete metadata: {}", metadata)));
        }

        let (proxy_name, rule, rule_payload, rule_chain) = self.classify(metadata).await;
        let proxy = self
            .registry
            .get(&proxy_name)
            .ok_or_else(|| Error::proxy(format!("proxy not found: {}", proxy_name)))?;

        let ctx = DialContext::default();
        let stream = match proxy.dial(&ctx, metadata).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "dial {} via {} failed: {}",
                    metadata.remote_address(),
                    proxy_name,
                    e
                );
                return Err(e);
            }
        };

        let mut chains = vec![proxy_name.clone()];
        chains.extend(rule_chain);

        let tracked = self.statistic.track(TrackedConnection::new(
            self.statistic.generate_id(),
            Self::record_of(metadata),
            chains,
            rule.clone(),
            rule_payload.clone(),
        ));

        info!(
            "[{}] {} --> {} via {} ({},{})",
            tracked.id,
            metadata.source_detail(),
            metadata.remote_address(),
            proxy_name,
            rule,
            rule_payload
        );

        Ok(OutboundHandle {
            stream: TrackedStream::new(stream, proxy_name.clone(), self.statistic.clone(), tracked),
            proxy: proxy_name,
            rule,
            rule_payload,
        })
    }

    /// Classify, dial, and pump a client stream to completion.
    pub async fn handle_stream<S>(&self, mut metadata: Metadata, client: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handle = match self.connect(&mut metadata).await {
            Ok(handle) => handle,
            Err(_) => return, // already logged; client side closes
        };

        if let Err(e) = relay(client, handle.stream).await {
            debug!("relay {} ended: {}", metadata.remote_address(), e);
        }
    }

    /// UDP dispatch. Adapters without UDP re-route to the configured
    /// fallback policy group when enabled, else the flow is dropped.
    pub async fn connect_packet(
        &self,
        metadata: &mut Metadata,
    ) -> Result<(BoxedPacketConn, String)> {
        self.preprocess(metadata);

        let (proxy_name, ..) = self.classify(metadata).await;
        let proxy = self
            .registry
            .get(&proxy_name)
            .ok_or_else(|| Error::proxy(format!("proxy not found: {}", proxy_name)))?;

        let ctx = DialContext::default();
        match proxy.listen_packet(&ctx, metadata).await {
            Ok(conn) => Ok((conn, proxy_name)),
            Err(Error::UdpNotSupported(name)) => {
                if self.udp_fallback_match {
                    if let Some(ref policy) = self.udp_fallback_policy {
                        debug!("udp re-dispatch {} -> {}", name, policy);
                        let fallback = self.registry.get(policy).ok_or_else(|| {
                            Error::proxy(format!("udp-fallback-policy not found: {}", policy))
                        })?;
                        let conn = fallback.listen_packet(&ctx, metadata).await?;
                        return Ok((conn, policy.clone()));
                    }
                }
                Err(Error::UdpNotSupported(name))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a destination for adapters that need a concrete address.
    pub async fn resolve_metadata(&self, metadata: &mut Metadata) -> Result<()> {
        if metadata.dst_ip.is_none() && !metadata.host.is_empty() {
            let ip = self.resolver.resolve_ip(&metadata.host).await?;
            metadata.dst_ip = Some(ip);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;
    use crate::config::{DnsConfig, RuleConfig, ScriptConfig};
    use crate::geodata::GeoData;
    use crate::outbound::{Direct, Reject};
    use crate::provider::ProviderManager;
    use crate::rule::ScriptEnv;
    use std::collections::HashMap;

    fn fixture(rules: &[&str], mode: Mode) -> Tunnel {
        let geodata = Arc::new(GeoData::default());
        let resolver = Arc::new(
            Resolver::new(&DnsConfig::default(), &HashMap::new(), geodata.clone(), None).unwrap(),
        );
        let providers = Arc::new(ProviderManager::new());

        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(Direct::new())).unwrap();
        registry
            .insert(Arc::new(Reject::new("REJECT", false)))
            .unwrap();

        let configs: Vec<RuleConfig> = rules
            .iter()
            .map(|r| RuleConfig::Line(r.to_string()))
            .collect();
        let env = ScriptEnv {
            resolver: resolver.clone(),
            geodata,
            providers,
        };
        let engine = Arc::new(RuleEngine::build(&configs, &ScriptConfig::default(), env).unwrap());

        Tunnel::new(
            registry,
            engine,
            resolver,
            Arc::new(StatisticManager::new()),
            mode,
            None,
            false,
        )
    }

    #[tokio::test]
    async fn test_classify_rule_mode() {
        let tunnel = fixture(&["DOMAIN-SUFFIX,blocked.io,REJECT", "MATCH,DIRECT"], Mode::Rule);

        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host("api.blocked.io")
            .with_dst_port(443);
        let (target, kind, ..) = tunnel.classify(&mut m).await;
        assert_eq!(target, "REJECT");
        assert_eq!(kind, "DOMAIN-SUFFIX");

        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host("fine.io")
            .with_dst_port(443);
        let (target, ..) = tunnel.classify(&mut m).await;
        assert_eq!(target, "DIRECT");
    }

    #[tokio::test]
    async fn test_classify_without_match_defaults_direct() {
        let tunnel = fixture(&["DOMAIN,specific.io,REJECT"], Mode::Rule);
        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host("other.io")
            .with_dst_port(80);
        let (target, kind, payload, _) = tunnel.classify(&mut m).await;
        assert_eq!(target, "DIRECT");
        assert_eq!(kind, "MATCH");
        assert_eq!(payload, "default");
    }

    #[tokio::test]
    async fn test_classify_mode_overrides() {
        let tunnel = fixture(&["MATCH,REJECT"], Mode::Direct);
        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host("x.io")
            .with_dst_port(80);
        let (target, ..) = tunnel.classify(&mut m).await;
        assert_eq!(target, "DIRECT");

        tunnel.set_mode(Mode::Rule);
        let (target, ..) = tunnel.classify(&mut m).await;
        assert_eq!(target, "REJECT");
    }

    #[tokio::test]
    async fn test_special_proxy_bypasses_rules() {
        let tunnel = fixture(&["MATCH,REJECT"], Mode::Rule);
        let mut m = Metadata::tcp(SourceType::Inner)
            .with_host("x.io")
            .with_dst_port(80);
        m.special_proxy = Some("DIRECT".to_string());
        let (target, kind, ..) = tunnel.classify(&mut m).await;
        assert_eq!(target, "DIRECT");
        assert_eq!(kind, "SPECIAL");
    }

    #[tokio::test]
    async fn test_connect_rejected_surfaces_error() {
        let tunnel = fixture(&["MATCH,REJECT"], Mode::Rule);
        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host("blocked.example")
            .with_dst_port(443);
        assert!(tunnel.connect(&mut m).await.is_err());
        // Failed dials leave no tracked connection behind
        assert_eq!(tunnel.statistic().connection_count(), 0);
    }
}
