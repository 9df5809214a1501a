//! Multi-upstream resolver: pool routing, nameserver policy, fallback
//! arbitration, caching, and enhanced modes.

use super::dhcp::DhcpUpstream;
use super::doh::DohUpstream;
use super::upstream::{
    answer_ips, batch_exchange, build_query, Bootstrap, DotUpstream, TcpUpstream, UdpUpstream,
};
use super::{DnsCache, DnsContext, DnsDialer, DnsUpstream, FakeIpPool, NameServer, UpstreamKind};
use crate::common::{CacheFile, SingleFlight};
use crate::config::DnsConfig;
use crate::geodata::{GeoData, GeoSiteMatcher};
use crate::outbound::ProxyDialer;
use crate::rule::DomainTrie;
use crate::{Error, Result};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::svcb::SvcParamValue;
use hickory_proto::rr::{RData, RecordType};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How client A/AAAA queries are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancedMode {
    #[default]
    Normal,
    FakeIp,
    RedirHost,
}

/// Suspect-answer arbitration between the main and fallback pools.
struct FallbackFilter {
    geoip: bool,
    geoip_code: String,
    cidrs: Vec<IpNet>,
    domains: DomainTrie<()>,
    geosites: Vec<Arc<GeoSiteMatcher>>,
}

impl FallbackFilter {
    fn new(config: &crate::config::FallbackFilterConfig, geodata: &GeoData) -> Self {
        let mut cidrs = Vec::new();
        for cidr in &config.ipcidr {
            match cidr.parse() {
                Ok(net) => cidrs.push(net),
                Err(e) => warn!("fallback-filter ipcidr {:?}: {}", cidr, e),
            }
        }

        let mut domains = DomainTrie::new();
        for pattern in &config.domain {
            domains.insert(pattern, ());
        }

        let geosites = config
            .geosite
            .iter()
            .map(|code| geodata.geosite.matcher(code))
            .collect();

        FallbackFilter {
            geoip: config.geoip,
            geoip_code: config.geoip_code.clone(),
            cidrs,
            domains,
            geosites,
        }
    }

    /// Domains listed in the filter always take the fallback path.
    fn forced_domain(&self, qname: &str) -> bool {
        self.domains.contains(qname) || self.geosites.iter().any(|m| m.matches(qname))
    }

    /// A main-pool answer is suspect when any address trips the filter.
    fn suspect(&self, geodata: &GeoData, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| {
            if self.geoip && geodata.geoip.matches(*ip, &self.geoip_code) {
                return true;
            }
            self.cidrs.iter().any(|net| net.contains(ip))
        })
    }
}

/// The embedded resolver.
pub struct Resolver {
    main: Vec<Arc<dyn DnsUpstream>>,
    fallback: Vec<Arc<dyn DnsUpstream>>,
    proxy_server: Vec<Arc<dyn DnsUpstream>>,
    remote: Vec<Arc<dyn DnsUpstream>>,
    policy: DomainTrie<Vec<Arc<dyn DnsUpstream>>>,
    fallback_filter: FallbackFilter,
    hosts: DomainTrie<IpAddr>,
    cache: DnsCache,
    inflight: SingleFlight<Message>,
    fakeip: Option<Arc<FakeIpPool>>,
    mode: EnhancedMode,
    ipv6: bool,
    geodata: Arc<GeoData>,
    dialer: Arc<DnsDialer>,
}

impl Resolver {
    pub fn new(
        config: &DnsConfig,
        host_entries: &HashMap<String, String>,
        geodata: Arc<GeoData>,
        cache_file: Option<Arc<CacheFile>>,
    ) -> Result<Self> {
        let dialer = Arc::new(DnsDialer::new());

        let default_specs = parse_specs(&config.default_nameserver)?;
        let default_pool = build_clients(&default_specs, None, &dialer, false)?;
        let bootstrap = Arc::new(Bootstrap::new(default_pool));

        let main_specs = parse_specs(&config.nameserver)?;
        let main = build_clients(&main_specs, Some(&bootstrap), &dialer, true)?;

        let fallback_specs = parse_specs(&config.fallback)?;
        let fallback = build_clients(&fallback_specs, Some(&bootstrap), &dialer, true)?;

        let proxy_specs = parse_specs(&config.proxy_server_nameserver)?;
        let proxy_server = build_clients(&proxy_specs, Some(&bootstrap), &dialer, true)?;

        let remote_specs = parse_specs(&config.remote_nameserver)?;
        let remote = build_clients(&remote_specs, Some(&bootstrap), &dialer, true)?;

        let mut policy = DomainTrie::new();
        for (pattern, spec) in &config.nameserver_policy {
            let ns = NameServer::parse(spec)?;
            let clients = build_clients(std::slice::from_ref(&ns), Some(&bootstrap), &dialer, true)?;
            policy.insert(pattern, clients);
        }

        let mut hosts = DomainTrie::new();
        if config.use_hosts {
            for (pattern, ip) in host_entries {
                match ip.parse() {
                    Ok(ip) => {
                        hosts.insert(pattern, ip);
                    }
                    Err(e) => warn!("hosts entry {:?}: {}", pattern, e),
                }
            }
        }

        let mode = match config.enhanced_mode.as_deref() {
            Some("fake-ip") => EnhancedMode::FakeIp,
            Some("redir-host") => EnhancedMode::RedirHost,
            _ => EnhancedMode::Normal,
        };

        let fakeip = if mode == EnhancedMode::FakeIp {
            // Upstream hostnames must never receive synthetic answers
            let mut filters = config.fake_ip_filter.clone();
            for spec in main_specs
                .iter()
                .chain(&fallback_specs)
                .chain(&proxy_specs)
                .chain(&remote_specs)
            {
                if spec.needs_bootstrap() {
                    filters.push(spec.host.clone());
                }
            }
            let store = if config.store_fake_ip { cache_file } else { None };
            Some(Arc::new(FakeIpPool::new(
                &config.fake_ip_range,
                &filters,
                store,
            )?))
        } else {
            None
        };

        Ok(Resolver {
            main,
            fallback,
            proxy_server,
            remote,
            policy,
            fallback_filter: FallbackFilter::new(&config.fallback_filter, &geodata),
            hosts,
            cache: DnsCache::default(),
            inflight: SingleFlight::new(),
            fakeip,
            mode,
            ipv6: config.ipv6,
            geodata,
            dialer,
        })
    }

    /// Bind the proxy-dial hook once the adapter registry exists.
    pub fn set_proxy_dialer(&self, dialer: Arc<dyn ProxyDialer>) {
        self.dialer.set_proxy_dialer(dialer);
    }

    pub fn enhanced_mode(&self) -> EnhancedMode {
        self.mode
    }

    pub fn fakeip_pool(&self) -> Option<Arc<FakeIpPool>> {
        self.fakeip.clone()
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    /// Static hosts-table lookup.
    pub fn host_entry(&self, host: &str) -> Option<IpAddr> {
        self.hosts.search(host).copied()
    }

    /// Drop cached answers for `host`, e.g. after a policy change.
    pub fn remove_cache(&self, host: &str) {
        self.cache.remove_host(host);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Exchange a query through the configured pools.
    ///
    /// Cache first; then the nameserver policy exclusively; then a race
    /// over the chosen pool with fallback arbitration.
    pub async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        let query = msg
            .queries()
            .first()
            .ok_or_else(|| Error::dns("empty question section"))?;
        let qname = query.name().to_utf8();
        let qname = qname.trim_end_matches('.').to_string();
        let qtype = query.query_type();

        if let Some(mut cached) = self.cache.get(&qname, qtype) {
            cached.set_id(msg.id());
            return Ok(cached);
        }

        let key = format!("{}:{}:{}", qname, qtype, ctx.proxy.as_deref().unwrap_or(""));
        let msg_clone = msg.clone();
        let answer = self
            .inflight
            .execute(&key, self.route(qname.clone(), qtype, msg_clone, ctx.clone()))
            .await?;

        let mut answer = answer;
        answer.set_id(msg.id());
        Ok(answer)
    }

    async fn route(
        &self,
        qname: String,
        qtype: RecordType,
        msg: Message,
        ctx: DnsContext,
    ) -> Result<Message> {
        // Policy override dispatches exclusively
        if let Some(clients) = self.policy.search(&qname) {
            debug!("dns policy hit for {}", qname);
            let answer = batch_exchange(clients, &msg, &ctx).await?;
            self.cache.put(&qname, qtype, answer.clone());
            return Ok(answer);
        }

        let pool = if ctx.proxy_server && !self.proxy_server.is_empty() {
            &self.proxy_server
        } else {
            &self.main
        };

        let answer = if self.fallback.is_empty() || !matches!(qtype, RecordType::A | RecordType::AAAA)
        {
            batch_exchange(pool, &msg, &ctx).await?
        } else if self.fallback_filter.forced_domain(&qname) {
            batch_exchange(&self.fallback, &msg, &ctx).await?
        } else {
            use futures::future::Either;

            // Both pools race, but the main pool's answer decides: a clean
            // main answer returns without waiting on fallback.
            let main_fut = Box::pin(batch_exchange(pool, &msg, &ctx));
            let fallback_fut = Box::pin(batch_exchange(&self.fallback, &msg, &ctx));

            let (main_res, fallback_pending) =
                match futures::future::select(main_fut, fallback_fut).await {
                    Either::Left((main_res, fallback_fut)) => (main_res, Either::Left(fallback_fut)),
                    Either::Right((fallback_res, main_fut)) => {
                        (main_fut.await, Either::Right(fallback_res))
                    }
                };

            match main_res {
                Ok(main_answer) => {
                    let ips = answer_ips(&main_answer);
                    if self.fallback_filter.suspect(&self.geodata, &ips) {
                        debug!("main answer for {} is suspect, preferring fallback", qname);
                        let fallback_res = match fallback_pending {
                            Either::Left(fut) => fut.await,
                            Either::Right(res) => res,
                        };
                        fallback_res.unwrap_or(main_answer)
                    } else {
                        main_answer
                    }
                }
                Err(main_err) => {
                    let fallback_res = match fallback_pending {
                        Either::Left(fut) => fut.await,
                        Either::Right(res) => res,
                    };
                    fallback_res.map_err(|_| main_err)?
                }
            }
        };

        self.cache.put(&qname, qtype, answer.clone());
        Ok(answer)
    }

    async fn lookup_pool(
        &self,
        host: &str,
        ctx: &DnsContext,
        pool_override: Option<&[Arc<dyn DnsUpstream>]>,
    ) -> Result<Vec<IpAddr>> {
        let query = build_query(host, RecordType::A)?;
        let answer = match pool_override {
            Some(pool) => batch_exchange(pool, &query, ctx).await?,
            None => self.exchange(&query, ctx).await?,
        };

        if answer.response_code() == ResponseCode::NXDomain {
            return Err(Error::DnsNotFound(host.to_string()));
        }

        let mut ips = answer_ips(&answer);

        if ips.is_empty() && self.ipv6 {
            let query = build_query(host, RecordType::AAAA)?;
            if let Ok(answer) = self.exchange(&query, ctx).await {
                ips = answer_ips(&answer);
            }
        }

        if ips.is_empty() {
            return Err(Error::DnsNotFound(host.to_string()));
        }
        Ok(ips)
    }

    /// Resolve `host` to a single real address (never a synthetic one).
    /// Used by classification and adapters.
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        if let Some(ip) = self.host_entry(host) {
            return Ok(ip);
        }
        let ips = self.lookup_pool(host, &DnsContext::default(), None).await?;
        Ok(ips[0])
    }

    /// Resolve an outbound proxy endpoint through the proxy-server pool.
    pub async fn resolve_proxy_server(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        if let Some(ip) = self.host_entry(host) {
            return Ok(ip);
        }
        let ctx = DnsContext {
            proxy: None,
            proxy_server: true,
        };
        let ips = self.lookup_pool(host, &ctx, None).await?;
        Ok(ips[0])
    }

    /// Resolve on behalf of a remote-DNS-resolve adapter.
    pub async fn resolve_remote(&self, host: &str, proxy: Option<String>) -> Result<IpAddr> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        let ctx = DnsContext {
            proxy,
            proxy_server: false,
        };
        let pool = if self.remote.is_empty() {
            None
        } else {
            Some(self.remote.as_slice())
        };
        let ips = self.lookup_pool(host, &ctx, pool).await?;
        Ok(ips[0])
    }

    /// Fetch an EncryptedClientHello config list via an HTTPS (type 65)
    /// query. Failures degrade gracefully: TLS proceeds without ECH.
    pub async fn lookup_ech_configs(&self, host: &str) -> Option<Vec<u8>> {
        let query = build_query(host, RecordType::HTTPS).ok()?;
        let answer = self.exchange(&query, &DnsContext::default()).await.ok()?;

        for record in answer.answers() {
            if let Some(RData::HTTPS(https)) = record.data() {
                for (_, value) in https.0.svc_params() {
                    if let SvcParamValue::EchConfig(ech) = value {
                        return Some(ech.0.clone());
                    }
                }
            }
        }
        None
    }

    /// Reverse fake-IP mapping, when the pool owns `ip`.
    pub fn fakeip_to_host(&self, ip: IpAddr) -> Option<String> {
        self.fakeip.as_ref()?.lookup_host(ip)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
impl Resolver {
    /// Bare resolver with injected pools, for arbitration tests.
    fn with_pools(
        main: Vec<Arc<dyn DnsUpstream>>,
        fallback: Vec<Arc<dyn DnsUpstream>>,
        filter: &crate::config::FallbackFilterConfig,
    ) -> Self {
        let geodata = Arc::new(GeoData::default());
        Resolver {
            main,
            fallback,
            proxy_server: Vec::new(),
            remote: Vec::new(),
            policy: DomainTrie::new(),
            fallback_filter: FallbackFilter::new(filter, &geodata),
            hosts: DomainTrie::new(),
            cache: DnsCache::default(),
            inflight: SingleFlight::new(),
            fakeip: None,
            mode: EnhancedMode::Normal,
            ipv6: false,
            geodata,
            dialer: Arc::new(DnsDialer::new()),
        }
    }
}

fn parse_specs(specs: &[String]) -> Result<Vec<NameServer>> {
    specs.iter().map(|s| NameServer::parse(s)).collect()
}

fn build_clients(
    specs: &[NameServer],
    bootstrap: Option<&Arc<Bootstrap>>,
    dialer: &Arc<DnsDialer>,
    allow_ech: bool,
) -> Result<Vec<Arc<dyn DnsUpstream>>> {
    let mut clients: Vec<Arc<dyn DnsUpstream>> = Vec::with_capacity(specs.len());
    for ns in specs {
        let bootstrap = if ns.needs_bootstrap() {
            Some(
                bootstrap
                    .ok_or_else(|| {
                        Error::config(format!("{} requires a default-nameserver", ns.host))
                    })?
                    .clone(),
            )
        } else {
            None
        };

        let client: Arc<dyn DnsUpstream> = match ns.kind {
            UpstreamKind::Udp => Arc::new(UdpUpstream::new(ns, bootstrap, dialer.clone(), allow_ech)),
            UpstreamKind::Tcp => Arc::new(TcpUpstream::new(ns, bootstrap, dialer.clone())),
            UpstreamKind::Tls => Arc::new(DotUpstream::new(ns, bootstrap, dialer.clone())),
            UpstreamKind::Https | UpstreamKind::Http3 => {
                Arc::new(DohUpstream::new(ns, bootstrap, dialer.clone()))
            }
            UpstreamKind::Dhcp => Arc::new(DhcpUpstream::new(
                ns.interface.clone().unwrap_or_default(),
                dialer.clone(),
            )),
        };
        clients.push(client);
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackFilterConfig;

    fn test_resolver(config: DnsConfig) -> Resolver {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        Resolver::new(&config, &HashMap::new(), Arc::new(GeoData::default()), None).unwrap()
    }

    #[test]
    fn test_enhanced_mode_selection() {
        let mut config = DnsConfig::default();
        assert_eq!(test_resolver(config.clone()).enhanced_mode(), EnhancedMode::Normal);

        config.enhanced_mode = Some("fake-ip".to_string());
        let resolver = test_resolver(config.clone());
        assert_eq!(resolver.enhanced_mode(), EnhancedMode::FakeIp);
        assert!(resolver.fakeip_pool().is_some());

        config.enhanced_mode = Some("redir-host".to_string());
        let resolver = test_resolver(config);
        assert_eq!(resolver.enhanced_mode(), EnhancedMode::RedirHost);
        assert!(resolver.fakeip_pool().is_none());
    }

    #[test]
    fn test_upstream_hostnames_enter_fakeip_filter() {
        let mut config = DnsConfig::default();
        config.enhanced_mode = Some("fake-ip".to_string());
        config.nameserver = vec!["tls://dns.google".to_string()];
        config.default_nameserver = vec!["8.8.8.8".to_string()];

        let resolver = test_resolver(config);
        let pool = resolver.fakeip_pool().unwrap();
        assert!(pool.should_skip("dns.google"));
        assert!(!pool.should_skip("example.com"));
    }

    #[test]
    fn test_hosts_lookup() {
        let mut hosts = HashMap::new();
        hosts.insert("router.local".to_string(), "192.168.1.1".to_string());
        let config = DnsConfig::default();
        let resolver =
            Resolver::new(&config, &hosts, Arc::new(GeoData::default()), None).unwrap();

        assert_eq!(
            resolver.host_entry("router.local"),
            Some("192.168.1.1".parse().unwrap())
        );
        assert_eq!(resolver.host_entry("other.local"), None);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_passthrough() {
        let resolver = test_resolver(DnsConfig::default());
        let ip = resolver.resolve_ip("10.0.0.7").await.unwrap();
        assert_eq!(ip, "10.0.0.7".parse::<IpAddr>().unwrap());
    }

    struct FixedAnswer(IpAddr);

    #[async_trait::async_trait]
    impl DnsUpstream for FixedAnswer {
        fn address(&self) -> String {
            format!("fixed://{}", self.0)
        }

        async fn exchange(
            &self,
            msg: &hickory_proto::op::Message,
            _ctx: &DnsContext,
        ) -> crate::Result<hickory_proto::op::Message> {
            use hickory_proto::rr::rdata::A;
            use hickory_proto::rr::Record;

            let mut answer = hickory_proto::op::Message::new();
            answer.set_id(msg.id());
            let query = msg.queries().first().cloned().unwrap();
            if let IpAddr::V4(v4) = self.0 {
                answer.add_answer(Record::from_rdata(query.name().clone(), 300, RData::A(A(v4))));
            }
            answer.add_query(query);
            Ok(answer)
        }
    }

    fn arbitration_resolver() -> Resolver {
        let filter = crate::config::FallbackFilterConfig {
            geoip: false,
            geoip_code: "CN".to_string(),
            ipcidr: vec!["203.0.113.0/24".to_string()],
            domain: Vec::new(),
            geosite: Vec::new(),
        };
        Resolver::with_pools(
            vec![Arc::new(FixedAnswer("203.0.113.5".parse().unwrap()))],
            vec![Arc::new(FixedAnswer("198.51.100.9".parse().unwrap()))],
            &filter,
        )
    }

    #[tokio::test]
    async fn test_suspect_main_answer_prefers_fallback() {

        let resolver = arbitration_resolver();
        let query = build_query("banned.example", RecordType::A).unwrap();
        let answer = resolver
            .exchange(&query, &DnsContext::default())
            .await
            .unwrap();
        // Main returned a filtered address, so the fallback answer wins
        assert_eq!(
            answer_ips(&answer),
            vec!["198.51.100.9".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(answer.id(), query.id());
    }

    #[tokio::test]
    async fn test_clean_main_answer_is_kept() {

        let filter = crate::config::FallbackFilterConfig {
            geoip: false,
            geoip_code: "CN".to_string(),
            ipcidr: vec!["203.0.113.0/24".to_string()],
            domain: Vec::new(),
            geosite: Vec::new(),
        };
        let resolver = Resolver::with_pools(
            vec![Arc::new(FixedAnswer("198.51.100.9".parse().unwrap()))],
            vec![Arc::new(FixedAnswer("192.0.2.1".parse().unwrap()))],
            &filter,
        );

        let query = build_query("free.example", RecordType::A).unwrap();
        let answer = resolver
            .exchange(&query, &DnsContext::default())
            .await
            .unwrap();
        assert_eq!(
            answer_ips(&answer),
            vec!["198.51.100.9".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_exchange_caches_answers() {

        let resolver = arbitration_resolver();
        let query = build_query("cached.example", RecordType::A).unwrap();
        resolver.exchange(&query, &DnsContext::default()).await.unwrap();
        assert_eq!(resolver.cache_len(), 1);

        resolver.remove_cache("cached.example");
        assert_eq!(resolver.cache_len(), 0);
    }

    #[test]
    fn test_fallback_filter_suspect() {
        let geodata = GeoData::default();
        let config = FallbackFilterConfig {
            geoip: false,
            geoip_code: "CN".to_string(),
            ipcidr: vec!["203.0.113.0/24".to_string()],
            domain: vec!["+.forced.example".to_string()],
            geosite: Vec::new(),
        };
        let filter = FallbackFilter::new(&config, &geodata);

        assert!(filter.suspect(&geodata, &["203.0.113.5".parse().unwrap()]));
        assert!(!filter.suspect(&geodata, &["198.51.100.9".parse().unwrap()]));
        assert!(filter.forced_domain("a.forced.example"));
        assert!(!filter.forced_domain("free.example"));
    }
}
