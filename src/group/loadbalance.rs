//! `load-balance` group: consistent hash or round-robin over alive members.

use super::{GroupMembers, GroupOption};
use crate::common::Metadata;
use crate::outbound::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, ProxyType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ConsistentHashing,
    RoundRobin,
}

/// Spreads connections across alive members. Consistent hashing keys on
/// (src-ip, host) so one flow sticks to one member.
pub struct LoadBalance {
    option: GroupOption,
    members: Arc<GroupMembers>,
    strategy: Strategy,
    round_robin: AtomicUsize,
    state: AdapterState,
}

impl LoadBalance {
    pub fn new(option: GroupOption, members: Arc<GroupMembers>) -> Result<Self> {
        let strategy = match option.strategy.as_str() {
            "consistent-hashing" => Strategy::ConsistentHashing,
            "round-robin" => Strategy::RoundRobin,
            other => {
                return Err(Error::config(format!(
                    "group {}: unknown strategy {}",
                    option.name, other
                )))
            }
        };
        Ok(LoadBalance {
            option,
            members,
            strategy,
            round_robin: AtomicUsize::new(0),
            state: AdapterState::default(),
        })
    }

    fn flow_key(metadata: &Metadata) -> u64 {
        let mut hasher = DefaultHasher::new();
        metadata.src_ip.hash(&mut hasher);
        if !metadata.host.is_empty() {
            metadata.host.hash(&mut hasher);
        } else if let Some(ip) = metadata.dst_ip {
            ip.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Alive members ordered by preference for this flow.
    fn ordered(&self, metadata: &Metadata) -> Vec<Arc<dyn OutboundProxy>> {
        let alive: Vec<_> = self
            .members
            .resolve()
            .into_iter()
            .filter(|p| p.alive())
            .collect();
        if alive.is_empty() {
            return alive;
        }

        let start = match self.strategy {
            Strategy::ConsistentHashing => (Self::flow_key(metadata) % alive.len() as u64) as usize,
            Strategy::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % alive.len(),
        };

        // Rotate so the preferred member comes first; failures re-hash onto
        // the next member without the dead one
        let mut ordered = Vec::with_capacity(alive.len());
        for i in 0..alive.len() {
            ordered.push(alive[(start + i) % alive.len()].clone());
        }
        ordered
    }

    pub fn now(&self) -> String {
        self.option.name.clone()
    }

    pub fn all(&self) -> Vec<String> {
        self.members.names()
    }
}

#[async_trait]
impl OutboundProxy for LoadBalance {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::LoadBalance
    }

    fn support_udp(&self) -> bool {
        !self.option.disable_udp
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        self.members.touch();
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());

        let mut last_err = None;
        for member in self.ordered(metadata) {
            match member.dial(&ctx, metadata).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("{}: member {} failed: {}", self.option.name, member.name(), e);
                    member.state().mark_dead();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::proxy(format!("{}: no members alive", self.option.name))))
    }

    async fn listen_packet(
        &self,
        ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<BoxedPacketConn> {
        if self.option.disable_udp {
            return Err(Error::UdpNotSupported(self.option.name.clone()));
        }
        self.members.touch();
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());

        let mut last_err = None;
        for member in self.ordered(metadata) {
            if !member.support_udp() {
                continue;
            }
            match member.listen_packet(&ctx, metadata).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    member.state().mark_dead();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::UdpNotSupported(self.option.name.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;
    use crate::outbound::{Direct, ProxyRegistry};

    fn fixture(strategy: &str) -> LoadBalance {
        let registry = Arc::new(ProxyRegistry::new());
        for name in ["A", "B", "C"] {
            registry.insert(Arc::new(Direct::with_name(name))).unwrap();
        }
        let members = Arc::new(GroupMembers::new(
            registry,
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            Vec::new(),
            None,
            None,
        ));
        let option = GroupOption {
            name: "LB".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: strategy.to_string(),
        };
        LoadBalance::new(option, members).unwrap()
    }

    fn meta(src: &str, host: &str) -> Metadata {
        let mut m = Metadata::tcp(SourceType::Socks)
            .with_host(host)
            .with_dst_port(443);
        m.src_ip = src.parse().unwrap();
        m
    }

    #[test]
    fn test_consistent_hash_is_sticky() {
        let lb = fixture("consistent-hashing");
        let m = meta("192.168.1.5", "example.com");
        let first = lb.ordered(&m)[0].name().to_string();
        for _ in 0..10 {
            assert_eq!(lb.ordered(&m)[0].name(), first);
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let lb = fixture("round-robin");
        let m = meta("192.168.1.5", "example.com");
        let a = lb.ordered(&m)[0].name().to_string();
        let b = lb.ordered(&m)[0].name().to_string();
        let c = lb.ordered(&m)[0].name().to_string();
        let d = lb.ordered(&m)[0].name().to_string();
        assert_ne!(a, b);
        assert_eq!(a, d); // wraps after three members
        assert_ne!(b, c);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let registry = Arc::new(ProxyRegistry::new());
        let members = Arc::new(GroupMembers::new(registry, Vec::new(), Vec::new(), None, None));
        let mut option = GroupOption {
            name: "LB".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "best-effort".to_string(),
        };
        option.strategy = "best-effort".to_string();
        assert!(LoadBalance::new(option, members).is_err());
    }
}
