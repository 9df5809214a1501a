//! `relay` group: an ordered chain where each member tunnels through the
//! previous one.

use super::{GroupMembers, GroupOption};
use crate::common::Metadata;
use crate::outbound::{AdapterState, BoxedStream, DialContext, OutboundProxy, ProxyType};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Chained dial: the first member opens the transport toward the second
/// member's server, each following member runs its protocol handshake over
/// the stream, and the last handshake targets the real destination. Any
/// hop failing aborts the chain.
pub struct Relay {
    option: GroupOption,
    members: Arc<GroupMembers>,
    state: AdapterState,
}

impl Relay {
    pub fn new(option: GroupOption, members: Arc<GroupMembers>) -> Self {
        Relay {
            option,
            members,
            state: AdapterState::default(),
        }
    }

    pub fn now(&self) -> String {
        self.option.name.clone()
    }

    pub fn all(&self) -> Vec<String> {
        self.members.names()
    }

    fn hop_metadata(base: &Metadata, hop: &Arc<dyn OutboundProxy>) -> Result<Metadata> {
        let (server, port) = hop.server_addr().ok_or_else(|| {
            Error::proxy(format!(
                "{} cannot be an inner relay hop (no server endpoint)",
                hop.name()
            ))
        })?;
        let mut meta = base.pure();
        meta.host = server;
        meta.dst_ip = None;
        meta.dst_port = port;
        Ok(meta)
    }
}

#[async_trait]
impl OutboundProxy for Relay {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Relay
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        self.members.touch();
        let members = self.members.resolve();
        if members.is_empty() {
            return Err(Error::proxy(format!("{}: relay has no members", self.option.name)));
        }

        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());
        for member in &members {
            ctx.chain.push(member.name().to_string());
        }

        if members.len() == 1 {
            return members[0].dial(&ctx, metadata).await;
        }

        // First hop dials toward the second hop's server
        let first_target = Self::hop_metadata(metadata, &members[1])?;
        let mut stream = members[0].dial(&ctx, &first_target).await?;

        // Middle hops handshake toward their successor's server
        for window in members[1..].windows(2) {
            let hop_target = Self::hop_metadata(metadata, &window[1])?;
            stream = window[0].handshake(stream, &hop_target).await?;
        }

        // Last hop carries the real destination
        let last = members
            .last()
            .ok_or_else(|| Error::internal("relay members vanished"))?;
        last.handshake(stream, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;
    use crate::outbound::{Direct, ProxyRegistry};

    #[tokio::test]
    async fn test_sentinel_hop_rejected() {
        // DIRECT has no server endpoint, so it cannot be an inner hop
        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(Direct::new())).unwrap();
        registry
            .insert(Arc::new(Direct::with_name("exit")))
            .unwrap();

        let members = Arc::new(GroupMembers::new(
            registry,
            vec!["DIRECT".to_string(), "exit".to_string()],
            Vec::new(),
            None,
            None,
        ));
        let option = GroupOption {
            name: "Chain".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        };
        let relay = Relay::new(option, members);

        let meta = Metadata::tcp(SourceType::Socks)
            .with_host("example.com")
            .with_dst_port(443);
        let err = relay.dial(&DialContext::default(), &meta).await.unwrap_err();
        assert!(err.to_string().contains("relay hop"));
    }

    #[test]
    fn test_relay_has_no_udp() {
        let registry = Arc::new(ProxyRegistry::new());
        let members = Arc::new(GroupMembers::new(registry, Vec::new(), Vec::new(), None, None));
        let option = GroupOption {
            name: "Chain".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        };
        assert!(!Relay::new(option, members).support_udp());
    }
}
