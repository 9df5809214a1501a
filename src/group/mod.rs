//! Proxy groups: composite adapters that choose an inner adapter per
//! request.
//!
//! Five policies: select, url-test, fallback, load-balance, relay. Member
//! enumeration is the direct list union the referenced providers; lookup is
//! late-bound through the registry so groups may reference groups. The
//! composition graph must be acyclic, verified at load.

mod fallback;
mod loadbalance;
mod relay;
mod selector;
mod urltest;

pub use fallback::Fallback;
pub use loadbalance::LoadBalance;
pub use relay::Relay;
pub use selector::Selector;
pub use urltest::UrlTest;

use crate::common::CacheFile;
use crate::config::GroupConfig;
use crate::outbound::{OutboundProxy, ProxyRegistry};
use crate::provider::{HealthCheck, MemberSource, ProxyProvider};
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

/// Default probe endpoint
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Normalized group options
#[derive(Debug, Clone)]
pub struct GroupOption {
    pub name: String,
    pub url: String,
    pub interval: Duration,
    pub tolerance: u16,
    pub lazy: bool,
    pub disable_udp: bool,
    pub hidden: bool,
    pub icon: Option<String>,
    pub strategy: String,
}

impl GroupOption {
    pub fn from_config(config: &GroupConfig) -> Self {
        GroupOption {
            name: config.name.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_TEST_URL.to_string()),
            interval: Duration::from_secs(config.interval.unwrap_or(300)),
            tolerance: config.tolerance.unwrap_or(150),
            lazy: config.lazy,
            disable_udp: config.disable_udp,
            hidden: config.hidden,
            icon: config.icon.clone(),
            strategy: config
                .strategy
                .clone()
                .unwrap_or_else(|| "consistent-hashing".to_string()),
        }
    }
}

/// Member enumeration: direct names resolved through the registry, union
/// provider payloads filtered by the configured regexes.
pub struct GroupMembers {
    registry: Arc<ProxyRegistry>,
    names: Vec<String>,
    providers: Vec<Arc<dyn ProxyProvider>>,
    filter: Option<Regex>,
    exclude: Option<Regex>,
    /// Owning group's health check, for touch-on-use probing
    health: OnceCell<Weak<HealthCheck>>,
}

impl GroupMembers {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        names: Vec<String>,
        providers: Vec<Arc<dyn ProxyProvider>>,
        filter: Option<Regex>,
        exclude: Option<Regex>,
    ) -> Self {
        GroupMembers {
            registry,
            names,
            providers,
            filter,
            exclude,
            health: OnceCell::new(),
        }
    }

    pub fn bind_health_check(&self, hc: &Arc<HealthCheck>) {
        let _ = self.health.set(Arc::downgrade(hc));
    }

    fn accepts(&self, name: &str) -> bool {
        if let Some(ref filter) = self.filter {
            if !filter.is_match(name) {
                return false;
            }
        }
        if let Some(ref exclude) = self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        true
    }

    /// Current members in declaration order.
    pub fn resolve(&self) -> Vec<Arc<dyn OutboundProxy>> {
        let mut members = Vec::new();
        for name in &self.names {
            match self.registry.get(name) {
                Some(proxy) => members.push(proxy),
                None => warn!("group member {} not found in registry", name),
            }
        }
        for provider in &self.providers {
            for proxy in provider.proxies() {
                if self.accepts(proxy.name()) {
                    members.push(proxy);
                }
            }
        }
        members
    }

    pub fn names(&self) -> Vec<String> {
        self.resolve().iter().map(|p| p.name().to_string()).collect()
    }

    /// Mark this group and its providers as recently used (touch-on-use
    /// health checking).
    pub fn touch(&self) {
        if let Some(hc) = self.health.get().and_then(Weak::upgrade) {
            hc.touch();
        }
        for provider in &self.providers {
            provider.touch();
        }
    }
}

impl MemberSource for GroupMembers {
    fn members(&self) -> Vec<Arc<dyn OutboundProxy>> {
        self.resolve()
    }
}

/// Verify the group graph is acyclic with a Kahn topological sort over the
/// member edges. An attempted cycle aborts config load.
pub fn detect_cycles(configs: &[GroupConfig]) -> Result<()> {
    let group_names: HashSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();

    // Edges group -> member-group; leaves are ignored
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for config in configs {
        indegree.entry(config.name.as_str()).or_insert(0);
        for member in &config.proxies {
            if group_names.contains(member.as_str()) {
                edges
                    .entry(config.name.as_str())
                    .or_default()
                    .push(member.as_str());
                *indegree.entry(member.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(children) = edges.get(node) {
            for &child in children {
                let degree = indegree.get_mut(child).map(|d| {
                    *d -= 1;
                    *d
                });
                if degree == Some(0) {
                    queue.push_back(child);
                }
            }
        }
    }

    if visited != indegree.len() {
        let cyclic: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        return Err(Error::Cycle(cyclic.join(", ")));
    }
    Ok(())
}

/// Build every configured group into the registry and return their health
/// checks (started by the caller).
pub fn build_groups(
    configs: &[GroupConfig],
    registry: &Arc<ProxyRegistry>,
    providers: &HashMap<String, Arc<dyn ProxyProvider>>,
    cache_file: Option<Arc<CacheFile>>,
) -> Result<Vec<Arc<HealthCheck>>> {
    detect_cycles(configs)?;

    // Direct member names must exist somewhere: leaf, sentinel, or group
    let mut known: HashSet<String> = registry.names().into_iter().collect();
    for config in configs {
        known.insert(config.name.clone());
    }
    for config in configs {
        for member in &config.proxies {
            if !known.contains(member) {
                return Err(Error::config(format!(
                    "group {}: unknown member {}",
                    config.name, member
                )));
            }
        }
    }

    let mut checks = Vec::new();
    for config in configs {
        let mut group_providers = Vec::new();
        for name in &config.use_providers {
            let provider = providers.get(name).ok_or_else(|| {
                Error::config(format!("group {}: unknown provider {}", config.name, name))
            })?;
            group_providers.push(provider.clone());
        }

        let filter = compile_filter(&config.name, config.filter.as_deref())?;
        let exclude = compile_filter(&config.name, config.exclude_filter.as_deref())?;

        let members = Arc::new(GroupMembers::new(
            registry.clone(),
            config.proxies.clone(),
            group_providers,
            filter,
            exclude,
        ));
        let option = GroupOption::from_config(config);

        let health_check = Arc::new(HealthCheck::new(
            option.url.clone(),
            option.interval,
            option.lazy,
            members.clone() as Arc<dyn MemberSource>,
        ));
        members.bind_health_check(&health_check);

        let group: Arc<dyn OutboundProxy> = match config.group_type.as_str() {
            "select" => Arc::new(Selector::new(option, members, cache_file.clone())),
            "url-test" => Arc::new(UrlTest::new(option, members)),
            "fallback" => Arc::new(Fallback::new(option, members)),
            "load-balance" => Arc::new(LoadBalance::new(option, members)?),
            "relay" => Arc::new(Relay::new(option, members)),
            other => {
                return Err(Error::config(format!(
                    "group {}: unknown type {}",
                    config.name, other
                )))
            }
        };

        registry.insert(group)?;
        checks.push(health_check);
    }

    Ok(checks)
}

fn compile_filter(group: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(|e| Error::config(format!("group {}: bad filter {:?}: {}", group, pattern, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, members: &[&str]) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            group_type: "select".to_string(),
            proxies: members.iter().map(|s| s.to_string()).collect(),
            use_providers: Vec::new(),
            url: None,
            interval: None,
            tolerance: None,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            filter: None,
            exclude_filter: None,
            strategy: None,
        }
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let configs = vec![
            group("A", &["B", "DIRECT"]),
            group("B", &["C"]),
            group("C", &["DIRECT"]),
        ];
        assert!(detect_cycles(&configs).is_ok());
    }

    #[test]
    fn test_direct_cycle_detected() {
        let configs = vec![group("A", &["B"]), group("B", &["A"])];
        assert!(matches!(detect_cycles(&configs), Err(Error::Cycle(_))));
    }

    #[test]
    fn test_self_cycle_detected() {
        let configs = vec![group("A", &["A"])];
        assert!(matches!(detect_cycles(&configs), Err(Error::Cycle(_))));
    }

    #[test]
    fn test_long_cycle_detected() {
        let configs = vec![
            group("A", &["B"]),
            group("B", &["C"]),
            group("C", &["A"]),
        ];
        assert!(matches!(detect_cycles(&configs), Err(Error::Cycle(_))));
    }
}
