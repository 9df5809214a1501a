//! Shunt - rule-based traffic classification and dispatch gateway
//!
//! Accepts local client connections, classifies each against a
//! user-defined policy, selects an outbound (direct, reject, or a remote
//! proxy transport), and shuttles bytes while maintaining liveness,
//! telemetry, and an embedded DNS resolver.
//!
//! ```text
//!  client --> inbound --> Metadata --> rule engine --> adapter --> remote
//!                                 ^                        ^
//!                  DNS resolver --+      health checks ----+
//!                  (fake-ip, policy)     providers (fetcher)
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod geodata;
pub mod group;
pub mod inbound;
pub mod outbound;
pub mod provider;
pub mod rule;
pub mod statistic;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use arc_swap::ArcSwap;
use common::CacheFile;
use dns::{DnsServer, Resolver};
use geodata::GeoData;
use group::build_groups;
use inbound::{listen_addr, InboundListener};
use outbound::{build_proxy, Direct, ProxyRegistry, Reject};
use provider::{
    FileVehicle, HealthCheck, HttpVehicle, ProviderManager, ProxySetProvider, RuleBehavior,
    RuleSetProvider, Vehicle,
};
use rule::{RuleEngine, ScriptEnv};
use statistic::StatisticManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tunnel::Tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One built configuration graph: proxies, rules, resolver, dispatcher.
/// Replaced wholesale on reload; old adapters linger only while in-flight
/// connections still hold them.
pub struct RuntimeState {
    pub config: Config,
    pub tunnel: Arc<Tunnel>,
    pub registry: Arc<ProxyRegistry>,
    pub providers: Arc<ProviderManager>,
    pub resolver: Arc<Resolver>,
    health_checks: Vec<Arc<HealthCheck>>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState").finish_non_exhaustive()
    }
}

impl RuntimeState {
    /// Build the full graph from a validated config.
    pub async fn build(
        config: Config,
        home: &PathBuf,
        cache_file: Arc<CacheFile>,
        statistic: Arc<StatisticManager>,
    ) -> Result<Self> {
        let geodata = Arc::new(GeoData::new(
            &home.join("Country.mmdb").to_string_lossy(),
            &home.join("geosite.dat").to_string_lossy(),
        ));

        let resolver = Arc::new(Resolver::new(
            &config.dns,
            &config.hosts,
            geodata.clone(),
            Some(cache_file.clone()),
        )?);

        // Providers first: groups reference them by name
        let providers = Arc::new(ProviderManager::new());
        for (name, pc) in &config.rule_providers {
            let vehicle = make_vehicle(
                &pc.vehicle_type,
                pc.url.as_deref(),
                &pc.path,
                pc.proxy.clone(),
                &cache_file,
            )?;
            let provider = RuleSetProvider::new(
                name.clone(),
                RuleBehavior::parse(&pc.behavior)?,
                vehicle,
                Duration::from_secs(pc.interval),
            );
            providers.add_rule_provider(provider);
        }
        for (name, pc) in &config.proxy_providers {
            let vehicle = make_vehicle(
                &pc.vehicle_type,
                pc.url.as_deref(),
                &pc.path,
                pc.proxy.clone(),
                &cache_file,
            )?;
            let (hc_url, hc_interval, hc_lazy) = match &pc.health_check {
                Some(hc) if hc.enable => (hc.url.clone(), hc.interval, hc.lazy),
                _ => (group::DEFAULT_TEST_URL.to_string(), 0, true),
            };
            let provider = ProxySetProvider::new(
                name.clone(),
                vehicle,
                Duration::from_secs(pc.interval),
                hc_url,
                Duration::from_secs(hc_interval),
                hc_lazy,
                resolver.clone(),
            );
            providers.add_proxy_provider(provider);
        }

        // Adapters: sentinels, leaves, groups, then the GLOBAL selector
        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(Direct::with_resolver(
            "DIRECT",
            resolver.clone(),
        )))?;
        registry.insert(Arc::new(Reject::new("REJECT", false)))?;
        registry.insert(Arc::new(Reject::new("REJECT-DROP", true)))?;

        for pc in &config.proxies {
            registry.insert(build_proxy(pc, resolver.clone())?)?;
        }

        let proxy_providers = providers.proxy_providers();
        let health_checks = build_groups(
            &config.proxy_groups,
            &registry,
            &proxy_providers,
            Some(cache_file.clone()),
        )?;

        let global_members = Arc::new(group::GroupMembers::new(
            registry.clone(),
            registry.names(),
            Vec::new(),
            None,
            None,
        ));
        let global_option = group::GroupOption {
            name: "GLOBAL".to_string(),
            url: group::DEFAULT_TEST_URL.to_string(),
            interval: Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        };
        registry.insert(Arc::new(group::Selector::new(
            global_option,
            global_members,
            Some(cache_file.clone()),
        )))?;

        // DNS proxy binding becomes available once adapters exist
        resolver.set_proxy_dialer(registry.clone());

        // Rules and scripts
        let env = ScriptEnv {
            resolver: resolver.clone(),
            geodata: geodata.clone(),
            providers: providers.clone(),
        };
        let engine = Arc::new(RuleEngine::build(&config.rules, &config.script, env)?);

        // Script references to unconfigured providers pre-register GeoSite
        // sets; load errors surface as config errors
        for name in engine.referenced_providers() {
            if providers.rule_provider(name).is_none() {
                let matcher = geodata.geosite.try_matcher(name).map_err(|e| {
                    Error::config(format!("script provider {}: {}", name, e))
                })?;
                providers.add_rule_provider(RuleSetProvider::from_geosite(
                    name.clone(),
                    matcher,
                ));
                info!("auto-registered geosite rule provider {}", name);
            }
        }

        let tunnel = Arc::new(Tunnel::new(
            registry.clone(),
            engine,
            resolver.clone(),
            statistic,
            config.mode,
            config.experimental.udp_fallback_policy.clone(),
            config.experimental.udp_fallback_match,
        ));

        // Initial provider loads; a provider that cannot load at all is a
        // config error, later failures keep the last good payload
        for (name, provider) in providers.rule_providers() {
            provider
                .initial()
                .await
                .map_err(|e| Error::config(format!("rule provider {}: {}", name, e)))?;
        }
        for (name, provider) in providers.proxy_providers() {
            provider
                .initial()
                .await
                .map_err(|e| Error::config(format!("proxy provider {}: {}", name, e)))?;
        }

        Ok(RuntimeState {
            config,
            tunnel,
            registry,
            providers,
            resolver,
            health_checks,
        })
    }

    fn start_health_checks(&self) {
        for hc in &self.health_checks {
            if hc.is_auto() {
                tokio::spawn(hc.clone().start());
            }
        }
    }

    /// Stop fetchers and probes. Safe to call once per state.
    async fn cleanup(&self) {
        self.providers.close_all().await;
        for hc in &self.health_checks {
            hc.close();
        }
        for proxy in self.registry.all() {
            let _ = proxy.close().await;
        }
    }
}

fn make_vehicle(
    vehicle_type: &str,
    url: Option<&str>,
    path: &str,
    proxy: Option<String>,
    cache_file: &Arc<CacheFile>,
) -> Result<Arc<dyn Vehicle>> {
    let abs = cache_file.safe_path(path)?;
    match vehicle_type {
        "file" => Ok(Arc::new(FileVehicle::new(abs))),
        "http" => {
            let url = url.ok_or_else(|| Error::config("http provider needs a url"))?;
            Ok(Arc::new(HttpVehicle::new(url, abs, proxy)?))
        }
        other => Err(Error::config(format!("unknown provider type: {}", other))),
    }
}

/// The running application: current state handle plus listener tasks.
pub struct App {
    state: ArcSwap<RuntimeState>,
    cache_file: Arc<CacheFile>,
    statistic: Arc<StatisticManager>,
    home: PathBuf,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    pub async fn new(config: Config, home: PathBuf) -> Result<Self> {
        info!("initializing shunt v{}", VERSION);
        let cache_file = Arc::new(CacheFile::open(&home));
        let statistic = Arc::new(StatisticManager::new());
        statistic.start_ticker();

        let state =
            RuntimeState::build(config, &home, cache_file.clone(), statistic.clone()).await?;

        Ok(App {
            state: ArcSwap::from_pointee(state),
            cache_file,
            statistic,
            home,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> Arc<RuntimeState> {
        self.state.load_full()
    }

    pub fn statistic(&self) -> &Arc<StatisticManager> {
        &self.statistic
    }

    /// Verify every configured listen address is bindable, so startup can
    /// fail fast with a bind error before serving.
    async fn preflight_bind(&self, state: &RuntimeState) -> Result<()> {
        let config = &state.config;
        let mut addrs = Vec::new();
        if let Some(port) = config.port {
            addrs.push(listen_addr(port, config.allow_lan));
        }
        if let Some(port) = config.socks_port {
            addrs.push(listen_addr(port, config.allow_lan));
        }
        if let Some(port) = config.mixed_port {
            addrs.push(listen_addr(port, config.allow_lan));
        }
        for tunnel in &config.tunnels {
            addrs.push(tunnel.parsed()?.address);
        }
        if let Some(ref listen) = config.dns.listen {
            addrs.push(listen.clone());
        }

        for addr in addrs {
            let probe = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|e| Error::connection(format!("bind {}: {}", addr, e)))?;
            drop(probe);
        }
        Ok(())
    }

    fn spawn_listeners(&self, state: &Arc<RuntimeState>) {
        let config = &state.config;
        let tunnel = state.tunnel.clone();
        let mut listeners: Vec<Arc<dyn InboundListener>> = Vec::new();

        if let Some(port) = config.port {
            listeners.push(Arc::new(inbound::HttpListener::new(
                listen_addr(port, config.allow_lan),
                tunnel.clone(),
            )));
        }
        if let Some(port) = config.socks_port {
            listeners.push(Arc::new(inbound::Socks5Listener::new(
                listen_addr(port, config.allow_lan),
                true,
                tunnel.clone(),
            )));
        }
        if let Some(port) = config.mixed_port {
            listeners.push(Arc::new(inbound::MixedListener::new(
                listen_addr(port, config.allow_lan),
                true,
                tunnel.clone(),
            )));
        }
        for spec in &config.tunnels {
            if let Ok(parsed) = spec.parsed() {
                listeners.push(Arc::new(inbound::TunnelListener::new(parsed, tunnel.clone())));
            }
        }

        let mut tasks = self.tasks.lock();
        for listener in listeners {
            let task = tokio::spawn(async move {
                if let Err(e) = listener.start().await {
                    warn!("{} listener stopped: {}", listener.name(), e);
                }
            });
            tasks.push(task);
        }

        if let Some(ref listen) = config.dns.listen {
            let server = DnsServer::new(state.resolver.clone(), listen.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!("dns server stopped: {}", e);
                }
            }));
        }

        state.start_health_checks();
    }

    /// Serve until interrupted, then tear down.
    pub async fn run(&self) -> Result<()> {
        let state = self.state();
        self.preflight_bind(&state).await?;
        self.spawn_listeners(&state);

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Swap in a freshly-built graph. The outgoing graph is cleaned up
    /// exactly once; in-flight connections finish against the old adapters
    /// they hold.
    pub async fn reload(&self, config: Config) -> Result<()> {
        let new_state = Arc::new(
            RuntimeState::build(
                config,
                &self.home,
                self.cache_file.clone(),
                self.statistic.clone(),
            )
            .await?,
        );

        let old = self.state.swap(new_state.clone());

        // Restart listeners against the new graph
        {
            let mut tasks = self.tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.spawn_listeners(&new_state);

        old.cleanup().await;
        info!("configuration reloaded");
        Ok(())
    }

    pub async fn shutdown(&self) {
        {
            let mut tasks = self.tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let state = self.state();
        state.cleanup().await;
        if let Some(pool) = state.resolver.fakeip_pool() {
            if let Err(e) = pool.flush() {
                warn!("fake-ip flush: {}", e);
            }
        }
        if let Err(e) = self.cache_file.flush() {
            warn!("cache flush: {}", e);
        }
        info!("gateway stopped");
    }
}
