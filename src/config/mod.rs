//! Configuration model: YAML in, validated in-memory model out.
//!
//! The core consumes this model; parsing stays at the edge. Unknown
//! top-level keys are rejected.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// Routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Rule,
    Global,
    Direct,
    Script,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Rule => write!(f, "rule"),
            Mode::Global => write!(f, "global"),
            Mode::Direct => write!(f, "direct"),
            Mode::Script => write!(f, "script"),
        }
    }
}

impl TryFrom<&str> for Mode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rule" => Ok(Mode::Rule),
            "global" => Ok(Mode::Global),
            "direct" => Ok(Mode::Direct),
            "script" => Ok(Mode::Script),
            _ => Err(Error::config(format!("unknown mode: {}", s))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP proxy port
    pub port: Option<u16>,

    /// SOCKS5 proxy port
    #[serde(rename = "socks-port")]
    pub socks_port: Option<u16>,

    /// Mixed HTTP+SOCKS5 port
    #[serde(rename = "mixed-port")]
    pub mixed_port: Option<u16>,

    /// Accept connections from the LAN, not just loopback
    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,

    pub mode: Mode,

    #[serde(rename = "log-level")]
    pub log_level: String,

    pub dns: DnsConfig,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<GroupConfig>,

    #[serde(rename = "proxy-providers")]
    pub proxy_providers: HashMap<String, ProxyProviderConfig>,

    pub rules: Vec<RuleConfig>,

    #[serde(rename = "rule-providers")]
    pub rule_providers: HashMap<String, RuleProviderConfig>,

    /// Static host mappings; patterns go through the shared domain trie
    pub hosts: HashMap<String, String>,

    /// Accepted for interface compatibility; interception is not built here
    pub mitm: Option<MitmConfig>,

    /// Accepted for interface compatibility; the TUN stack is external
    pub tun: Option<TunConfig>,

    pub tunnels: Vec<TunnelConfig>,

    pub experimental: ExperimentalConfig,

    pub script: ScriptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: None,
            socks_port: None,
            mixed_port: None,
            allow_lan: false,
            mode: Mode::Rule,
            log_level: "info".to_string(),
            dns: DnsConfig::default(),
            proxies: Vec::new(),
            proxy_groups: Vec::new(),
            proxy_providers: HashMap::new(),
            rules: Vec::new(),
            rule_providers: HashMap::new(),
            hosts: HashMap::new(),
            mitm: None,
            tun: None,
            tunnels: Vec::new(),
            experimental: ExperimentalConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn render(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.render()?).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for proxy in &self.proxies {
            proxy.validate()?;
        }

        for name in self.proxy_providers.keys().chain(self.rule_providers.keys()) {
            if name == "default" {
                return Err(Error::config(
                    "provider name `default` is reserved".to_string(),
                ));
            }
        }

        for group in &self.proxy_groups {
            group.validate()?;
        }

        for tunnel in &self.tunnels {
            tunnel.parsed()?;
        }

        self.dns.validate()?;
        Ok(())
    }
}

/// DNS subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enable: bool,

    /// Plain UDP+TCP listen address, e.g. "127.0.0.1:5353"
    pub listen: Option<String>,

    pub ipv6: bool,

    /// "fake-ip" or "redir-host"
    #[serde(rename = "enhanced-mode")]
    pub enhanced_mode: Option<String>,

    #[serde(rename = "fake-ip-range")]
    pub fake_ip_range: String,

    #[serde(rename = "fake-ip-filter")]
    pub fake_ip_filter: Vec<String>,

    /// Persist the fake-IP table across restarts
    #[serde(rename = "store-fake-ip")]
    pub store_fake_ip: bool,

    /// Bootstrap servers: plain IPs only
    #[serde(rename = "default-nameserver")]
    pub default_nameserver: Vec<String>,

    pub nameserver: Vec<String>,

    pub fallback: Vec<String>,

    #[serde(rename = "fallback-filter")]
    pub fallback_filter: FallbackFilterConfig,

    /// Per-domain upstream override
    #[serde(rename = "nameserver-policy")]
    pub nameserver_policy: HashMap<String, String>,

    /// Resolves outbound proxy endpoint hostnames
    #[serde(rename = "proxy-server-nameserver")]
    pub proxy_server_nameserver: Vec<String>,

    /// Resolves on behalf of remote-DNS-resolve adapters
    #[serde(rename = "remote-nameserver")]
    pub remote_nameserver: Vec<String>,

    #[serde(rename = "use-hosts")]
    pub use_hosts: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            enable: false,
            listen: None,
            ipv6: false,
            enhanced_mode: None,
            fake_ip_range: "198.18.0.1/16".to_string(),
            fake_ip_filter: Vec::new(),
            store_fake_ip: false,
            default_nameserver: Vec::new(),
            nameserver: Vec::new(),
            fallback: Vec::new(),
            fallback_filter: FallbackFilterConfig::default(),
            nameserver_policy: HashMap::new(),
            proxy_server_nameserver: Vec::new(),
            remote_nameserver: Vec::new(),
            use_hosts: true,
        }
    }
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(ref mode) = self.enhanced_mode {
            match mode.as_str() {
                "fake-ip" | "redir-host" => {}
                other => {
                    return Err(Error::config(format!("unknown enhanced-mode: {}", other)))
                }
            }
        }

        // Bootstrap upstreams must be reachable without any resolution
        for ns in &self.default_nameserver {
            let host = ns
                .rsplit_once("://")
                .map(|(_, rest)| rest)
                .unwrap_or(ns.as_str());
            let host = host.split(':').next().unwrap_or(host);
            if host.parse::<std::net::IpAddr>().is_err() {
                return Err(Error::config(format!(
                    "default-nameserver must be a plain IP: {}",
                    ns
                )));
            }
        }

        Ok(())
    }
}

/// Fallback filter: when a main-pool answer looks suspect, prefer fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackFilterConfig {
    pub geoip: bool,

    #[serde(rename = "geoip-code")]
    pub geoip_code: String,

    pub ipcidr: Vec<String>,

    pub domain: Vec<String>,

    pub geosite: Vec<String>,
}

impl Default for FallbackFilterConfig {
    fn default() -> Self {
        FallbackFilterConfig {
            geoip: true,
            geoip_code: "CN".to_string(),
            ipcidr: Vec::new(),
            domain: Vec::new(),
            geosite: Vec::new(),
        }
    }
}

/// A single proxy definition; protocol-specific fields stay opaque
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub proxy_type: String,

    pub server: String,

    pub port: u16,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("proxy name cannot be empty"));
        }
        if self.server.is_empty() {
            return Err(Error::config(format!("proxy {}: server is empty", self.name)));
        }
        if self.port == 0 {
            return Err(Error::config(format!("proxy {}: port is 0", self.name)));
        }
        Ok(())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_i64())
    }
}

/// Proxy group definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub group_type: String,

    #[serde(default)]
    pub proxies: Vec<String>,

    #[serde(default, rename = "use")]
    pub use_providers: Vec<String>,

    pub url: Option<String>,

    /// Probe interval in seconds
    pub interval: Option<u64>,

    /// url-test hysteresis in milliseconds
    pub tolerance: Option<u16>,

    #[serde(default = "default_true")]
    pub lazy: bool,

    #[serde(default, rename = "disable-udp")]
    pub disable_udp: bool,

    #[serde(default)]
    pub hidden: bool,

    pub icon: Option<String>,

    /// Regex over provider member names
    pub filter: Option<String>,

    #[serde(rename = "exclude-filter")]
    pub exclude_filter: Option<String>,

    /// load-balance: "consistent-hashing" or "round-robin"
    pub strategy: Option<String>,
}

impl GroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("group name cannot be empty"));
        }
        match self.group_type.as_str() {
            "select" | "url-test" | "fallback" | "load-balance" | "relay" => {}
            other => {
                return Err(Error::config(format!(
                    "group {}: unknown type {}",
                    self.name, other
                )))
            }
        }
        if self.proxies.is_empty() && self.use_providers.is_empty() {
            return Err(Error::config(format!(
                "group {}: no proxies or providers",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Proxy provider definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyProviderConfig {
    #[serde(rename = "type")]
    pub vehicle_type: String,

    pub url: Option<String>,

    pub path: String,

    /// Update interval in seconds; 0 disables the ticker
    #[serde(default)]
    pub interval: u64,

    pub filter: Option<String>,

    /// Fetch through this proxy; delays the first pull until proxies are up
    pub proxy: Option<String>,

    #[serde(rename = "health-check")]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    pub url: String,

    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    #[serde(default = "default_true")]
    pub lazy: bool,
}

fn default_hc_interval() -> u64 {
    600
}

/// Rule provider definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleProviderConfig {
    #[serde(rename = "type")]
    pub vehicle_type: String,

    /// "domain", "ipcidr" or "classical"
    pub behavior: String,

    pub url: Option<String>,

    pub path: String,

    #[serde(default)]
    pub interval: u64,

    /// Fetch through this proxy; delays the first pull until proxies are up
    pub proxy: Option<String>,
}

/// A rule entry: a classic `TYPE,payload,target` line or a nested group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Line(String),
    Group(GroupRuleConfig),
}

/// Nested rule group: sub-rules gated by a matcher expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRuleConfig {
    pub name: String,

    #[serde(rename = "if")]
    pub condition: String,

    /// "expr" (default) or "starlark"
    pub engine: Option<String>,

    pub rules: Vec<RuleConfig>,
}

/// Static tunnel: shorthand line or object form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunnelConfig {
    Line(String),
    Object {
        network: Vec<String>,
        address: String,
        target: String,
        proxy: String,
    },
}

/// Normalized tunnel description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTunnel {
    pub networks: Vec<String>,
    pub address: String,
    pub target: String,
    pub proxy: String,
}

impl TunnelConfig {
    /// Parse `udp/tcp,address,target,proxy` shorthand or pass the object through.
    pub fn parsed(&self) -> Result<ParsedTunnel> {
        match self {
            TunnelConfig::Object {
                network,
                address,
                target,
                proxy,
            } => Ok(ParsedTunnel {
                networks: network.clone(),
                address: address.clone(),
                target: target.clone(),
                proxy: proxy.clone(),
            }),
            TunnelConfig::Line(line) => {
                let parts: Vec<&str> = line.split(',').map(str::trim).collect();
                if parts.len() != 4 {
                    return Err(Error::config(format!("invalid tunnel: {}", line)));
                }
                let networks: Vec<String> =
                    parts[0].split('/').map(|s| s.trim().to_lowercase()).collect();
                for net in &networks {
                    if net != "tcp" && net != "udp" {
                        return Err(Error::config(format!(
                            "invalid tunnel network {:?} in {}",
                            net, line
                        )));
                    }
                }
                Ok(ParsedTunnel {
                    networks,
                    address: parts[1].to_string(),
                    target: parts[2].to_string(),
                    proxy: parts[3].to_string(),
                })
            }
        }
    }
}

/// MITM interface surface; interception lives outside this crate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MitmConfig {
    pub hosts: Vec<String>,
}

/// TUN interface surface; the device driver lives outside this crate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TunConfig {
    pub enable: bool,
    pub device: Option<String>,
    pub stack: Option<String>,
    #[serde(rename = "dns-hijack")]
    pub dns_hijack: Vec<String>,
    #[serde(rename = "auto-route")]
    pub auto_route: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExperimentalConfig {
    /// Group re-dispatched to when an adapter cannot carry UDP
    #[serde(rename = "udp-fallback-policy")]
    pub udp_fallback_policy: Option<String>,

    /// Re-dispatch on UDP-unsupported instead of dropping
    #[serde(rename = "udp-fallback-match")]
    pub udp_fallback_match: bool,
}

/// Script matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScriptConfig {
    /// Source of `def main(ctx, metadata)` for script mode
    pub code: Option<String>,

    /// Named boolean expressions usable as SCRIPT rule payloads
    pub shortcuts: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Rule);
        assert_eq!(config.log_level, "info");
        assert!(!config.allow_lan);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
port: 7890
socks-port: 7891
mode: rule
log-level: debug
dns:
  enable: true
  nameserver:
    - 8.8.8.8
    - tls://1.1.1.1
proxies:
  - name: up
    type: socks5
    server: 127.0.0.1
    port: 1080
proxy-groups:
  - name: Proxy
    type: select
    proxies: [up, DIRECT]
rules:
  - DOMAIN-SUFFIX,example.com,Proxy
  - name: inner
    if: network == "tcp"
    rules:
      - DST-PORT,22,DIRECT
  - MATCH,DIRECT
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.port, Some(7890));
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.rules.len(), 3);
        assert!(matches!(config.rules[1], RuleConfig::Group(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = "mode: rule\nbogus-key: 1\n";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_render_roundtrip() {
        let yaml = r#"
mixed-port: 7890
mode: global
rules:
  - MATCH,DIRECT
"#;
        let config = Config::from_str(yaml).unwrap();
        let rendered = config.render().unwrap();
        let reparsed = Config::from_str(&rendered).unwrap();
        assert_eq!(reparsed.mixed_port, Some(7890));
        assert_eq!(reparsed.mode, Mode::Global);
        assert_eq!(reparsed.rules.len(), 1);
    }

    #[test]
    fn test_tunnel_shorthand() {
        let t = TunnelConfig::Line("udp/tcp,127.0.0.1:6553,8.8.8.8:53,Proxy".to_string());
        let parsed = t.parsed().unwrap();
        assert_eq!(parsed.networks, vec!["udp", "tcp"]);
        assert_eq!(parsed.proxy, "Proxy");

        let bad = TunnelConfig::Line("icmp,a,b,c".to_string());
        assert!(bad.parsed().is_err());
    }

    #[test]
    fn test_reserved_provider_name() {
        let yaml = r#"
proxy-providers:
  default:
    type: http
    url: http://example.com/sub
    path: providers/default.yaml
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_default_nameserver_must_be_ip() {
        let yaml = r#"
dns:
  enable: true
  default-nameserver: [dns.google]
"#;
        assert!(Config::from_str(yaml).is_err());
    }
}
