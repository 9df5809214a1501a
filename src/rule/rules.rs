//! Rule variants: every kind exposes the same match contract over Metadata.

use super::script::{CompiledExpr, ScriptEnv};
use crate::common::{Metadata, Network};
use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::Arc;

/// Inclusive port range; single ports are `(p, p)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange(pub u16, pub u16);

impl PortRange {
    pub fn parse(payload: &str) -> Result<Self> {
        if let Some((low, high)) = payload.split_once('-') {
            let low = low
                .trim()
                .parse()
                .map_err(|_| Error::rule(format!("bad port: {}", payload)))?;
            let high = high
                .trim()
                .parse()
                .map_err(|_| Error::rule(format!("bad port: {}", payload)))?;
            if low > high {
                return Err(Error::rule(format!("inverted port range: {}", payload)));
            }
            Ok(PortRange(low, high))
        } else {
            let port = payload
                .trim()
                .parse()
                .map_err(|_| Error::rule(format!("bad port: {}", payload)))?;
            Ok(PortRange(port, port))
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.0 && port <= self.1
    }
}

/// A leaf rule.
#[derive(Clone)]
pub enum Rule {
    Domain {
        domain: String,
        target: String,
    },
    DomainSuffix {
        suffix: String,
        target: String,
    },
    DomainKeyword {
        keyword: String,
        target: String,
    },
    GeoSite {
        code: String,
        target: String,
    },
    IpCidr {
        net: IpNet,
        target: String,
        no_resolve: bool,
        src: bool,
    },
    GeoIp {
        code: String,
        target: String,
        no_resolve: bool,
    },
    Port {
        range: PortRange,
        target: String,
        src: bool,
    },
    ProcessName {
        name: String,
        target: String,
        path: bool,
    },
    Network {
        network: Network,
        target: String,
    },
    RuleSet {
        provider: String,
        target: String,
        no_resolve: bool,
    },
    Script {
        name: String,
        expr: Arc<CompiledExpr>,
        target: String,
    },
    Match {
        target: String,
    },
}

impl Rule {
    /// Parse a classic `TYPE,payload,target[,params…]` line. SCRIPT rules
    /// resolve their shortcut at parse time.
    pub fn parse(line: &str, shortcuts: &HashMap<String, Arc<CompiledExpr>>) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(Error::rule(format!("invalid rule: {}", line)));
        }

        let kind = parts[0].to_uppercase();
        if kind == "MATCH" || kind == "FINAL" {
            return Ok(Rule::Match {
                target: parts[1].to_string(),
            });
        }

        if parts.len() < 3 {
            return Err(Error::rule(format!("invalid rule: {}", line)));
        }
        let payload = parts[1].to_string();
        let target = parts[2].to_string();
        let params = &parts[3..];
        let no_resolve = params.iter().any(|p| p.eq_ignore_ascii_case("no-resolve"));
        let src = params.iter().any(|p| p.eq_ignore_ascii_case("src"));

        let rule = match kind.as_str() {
            "DOMAIN" => Rule::Domain {
                domain: payload.to_lowercase(),
                target,
            },
            "DOMAIN-SUFFIX" => Rule::DomainSuffix {
                suffix: payload.to_lowercase(),
                target,
            },
            "DOMAIN-KEYWORD" => Rule::DomainKeyword {
                keyword: payload.to_lowercase(),
                target,
            },
            "GEOSITE" => Rule::GeoSite {
                code: payload.to_lowercase(),
                target,
            },
            "IP-CIDR" | "IP-CIDR6" => Rule::IpCidr {
                net: payload
                    .parse()
                    .map_err(|e| Error::rule(format!("bad cidr {}: {}", payload, e)))?,
                target,
                no_resolve,
                src: false,
            },
            "SRC-IP-CIDR" => Rule::IpCidr {
                net: payload
                    .parse()
                    .map_err(|e| Error::rule(format!("bad cidr {}: {}", payload, e)))?,
                target,
                no_resolve: true,
                src: true,
            },
            "GEOIP" => Rule::GeoIp {
                code: payload.to_uppercase(),
                target,
                no_resolve,
            },
            "DST-PORT" => Rule::Port {
                range: PortRange::parse(&payload)?,
                target,
                src: false,
            },
            "SRC-PORT" => Rule::Port {
                range: PortRange::parse(&payload)?,
                target,
                src: true,
            },
            "PROCESS-NAME" => Rule::ProcessName {
                name: payload.to_lowercase(),
                target,
                path: false,
            },
            "PROCESS-PATH" => Rule::ProcessName {
                name: payload.to_lowercase(),
                target,
                path: true,
            },
            "NETWORK" => Rule::Network {
                network: match payload.to_lowercase().as_str() {
                    "tcp" => Network::Tcp,
                    "udp" => Network::Udp,
                    other => return Err(Error::rule(format!("bad network: {}", other))),
                },
                target,
            },
            "RULE-SET" => Rule::RuleSet {
                provider: payload,
                target,
                no_resolve,
            },
            "SCRIPT" => {
                let expr = shortcuts
                    .get(&payload)
                    .ok_or_else(|| Error::rule(format!("unknown script shortcut: {}", payload)))?
                    .clone();
                Rule::Script {
                    name: payload,
                    expr,
                    target,
                }
            }
            other => return Err(Error::rule(format!("unknown rule type: {}", other))),
        };
        Ok(rule)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Domain { .. } => "DOMAIN",
            Rule::DomainSuffix { .. } => "DOMAIN-SUFFIX",
            Rule::DomainKeyword { .. } => "DOMAIN-KEYWORD",
            Rule::GeoSite { .. } => "GEOSITE",
            Rule::IpCidr { src: false, .. } => "IP-CIDR",
            Rule::IpCidr { src: true, .. } => "SRC-IP-CIDR",
            Rule::GeoIp { .. } => "GEOIP",
            Rule::Port { src: false, .. } => "DST-PORT",
            Rule::Port { src: true, .. } => "SRC-PORT",
            Rule::ProcessName { path: false, .. } => "PROCESS-NAME",
            Rule::ProcessName { path: true, .. } => "PROCESS-PATH",
            Rule::Network { .. } => "NETWORK",
            Rule::RuleSet { .. } => "RULE-SET",
            Rule::Script { .. } => "SCRIPT",
            Rule::Match { .. } => "MATCH",
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Rule::Domain { domain, .. } => domain.clone(),
            Rule::DomainSuffix { suffix, .. } => suffix.clone(),
            Rule::DomainKeyword { keyword, .. } => keyword.clone(),
            Rule::GeoSite { code, .. } => code.clone(),
            Rule::IpCidr { net, .. } => net.to_string(),
            Rule::GeoIp { code, .. } => code.clone(),
            Rule::Port { range, .. } => {
                if range.0 == range.1 {
                    range.0.to_string()
                } else {
                    format!("{}-{}", range.0, range.1)
                }
            }
            Rule::ProcessName { name, .. } => name.clone(),
            Rule::Network { network, .. } => network.to_string(),
            Rule::RuleSet { provider, .. } => provider.clone(),
            Rule::Script { name, .. } => name.clone(),
            Rule::Match { .. } => String::new(),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Rule::Domain { target, .. }
            | Rule::DomainSuffix { target, .. }
            | Rule::DomainKeyword { target, .. }
            | Rule::GeoSite { target, .. }
            | Rule::IpCidr { target, .. }
            | Rule::GeoIp { target, .. }
            | Rule::Port { target, .. }
            | Rule::ProcessName { target, .. }
            | Rule::Network { target, .. }
            | Rule::RuleSet { target, .. }
            | Rule::Script { target, .. }
            | Rule::Match { target } => target,
        }
    }

    /// Whether matching wants a resolved destination IP. The engine
    /// resolves on demand unless the rule opted out with `no-resolve`.
    pub fn needs_resolved_ip(&self, env: &ScriptEnv) -> bool {
        match self {
            Rule::IpCidr {
                src: false,
                no_resolve,
                ..
            } => !no_resolve,
            Rule::GeoIp { no_resolve, .. } => !no_resolve,
            Rule::RuleSet {
                provider,
                no_resolve,
                ..
            } => !no_resolve && env.providers.provider_needs_ip(provider),
            _ => false,
        }
    }

    /// Evaluate this rule against the metadata. Script failures are errors
    /// the engine logs once and treats as a non-match.
    pub async fn matches(&self, metadata: &Metadata, env: &ScriptEnv) -> Result<bool> {
        let host = metadata.host.to_lowercase();
        let hit = match self {
            Rule::Domain { domain, .. } => !host.is_empty() && host == *domain,
            Rule::DomainSuffix { suffix, .. } => {
                !host.is_empty()
                    && (host == *suffix || host.ends_with(&format!(".{}", suffix)))
            }
            Rule::DomainKeyword { keyword, .. } => !host.is_empty() && host.contains(keyword),
            Rule::GeoSite { code, .. } => {
                !host.is_empty() && env.geodata.geosite.matcher(code).matches(&host)
            }
            Rule::IpCidr { net, src, .. } => {
                let ip = if *src {
                    Some(metadata.src_ip)
                } else {
                    metadata.dst_ip
                };
                ip.map(|ip| net.contains(&ip)).unwrap_or(false)
            }
            Rule::GeoIp { code, .. } => metadata
                .dst_ip
                .map(|ip| env.geodata.geoip.matches(ip, code))
                .unwrap_or(false),
            Rule::Port { range, src, .. } => {
                let port = if *src {
                    metadata.src_port
                } else {
                    metadata.dst_port
                };
                range.contains(port)
            }
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
            Rule::Network { network, .. } => metadata.network == *network,
            Rule::RuleSet { provider, .. } => env
                .providers
                .match_metadata(provider, metadata)
                .unwrap_or(false),
            Rule::Script { expr, .. } => expr.evaluate(metadata, env).await?,
            Rule::Match { .. } => true,
        };
        Ok(hit)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}) -> {}", self.kind(), self.payload(), self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Rule {
        Rule::parse(line, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(parse("DOMAIN-SUFFIX,google.com,Proxy").kind(), "DOMAIN-SUFFIX");
        assert_eq!(parse("IP-CIDR,10.0.0.0/8,LAN,no-resolve").kind(), "IP-CIDR");
        assert_eq!(parse("GEOIP,CN,DIRECT").kind(), "GEOIP");
        assert_eq!(parse("FINAL,DIRECT").kind(), "MATCH");
        assert_eq!(parse("DST-PORT,8000-9000,Proxy").payload(), "8000-9000");
        assert_eq!(parse("RULE-SET,ads,REJECT").target(), "REJECT");
    }

    #[test]
    fn test_parse_params() {
        let rule = parse("IP-CIDR,10.0.0.0/8,LAN,no-resolve");
        assert!(matches!(rule, Rule::IpCidr { no_resolve: true, .. }));

        let rule = parse("GEOIP,CN,DIRECT");
        assert!(matches!(rule, Rule::GeoIp { no_resolve: false, .. }));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(Rule::parse("DOMAIN,only-two", &HashMap::new()).is_err());
        assert!(Rule::parse("WAT,x,y", &HashMap::new()).is_err());
        assert!(Rule::parse("SCRIPT,missing,Proxy", &HashMap::new()).is_err());
        assert!(Rule::parse("DST-PORT,9000-8000,Proxy", &HashMap::new()).is_err());
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::parse("8000-9000").unwrap();
        assert!(range.contains(8000));
        assert!(range.contains(9000));
        assert!(!range.contains(7999));

        let single = PortRange::parse("443").unwrap();
        assert!(single.contains(443));
        assert!(!single.contains(444));
    }
}
