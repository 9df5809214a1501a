//! `fallback` group: first alive member wins.

use super::{GroupMembers, GroupOption};
use crate::common::Metadata;
use crate::outbound::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, ProxyType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Ordered fail-over group.
pub struct Fallback {
    option: GroupOption,
    members: Arc<GroupMembers>,
    state: AdapterState,
}

impl Fallback {
    pub fn new(option: GroupOption, members: Arc<GroupMembers>) -> Self {
        Fallback {
            option,
            members,
            state: AdapterState::default(),
        }
    }

    fn first_alive(&self) -> Option<Arc<dyn OutboundProxy>> {
        self.members.resolve().into_iter().find(|p| p.alive())
    }

    pub fn now(&self) -> String {
        self.first_alive()
            .map(|p| p.name().to_string())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<String> {
        self.members.names()
    }
}

#[async_trait]
impl OutboundProxy for Fallback {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Fallback
    }

    fn support_udp(&self) -> bool {
        if self.option.disable_udp {
            return false;
        }
        self.first_alive().map(|p| p.support_udp()).unwrap_or(false)
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        self.members.touch();
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());

        // Advance past members that fail to dial, marking them dead
        let mut last_err = None;
        for member in self.members.resolve() {
            if !member.alive() {
                continue;
            }
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
        let member = self
            .first_alive()
            .ok_or_else(|| Error::proxy(format!("{}: no members alive", self.option.name)))?;
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());
        member.listen_packet(&ctx, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{Direct, ProxyRegistry};

    #[test]
    fn test_first_alive_selection() {
        let registry = Arc::new(ProxyRegistry::new());
        let a = Arc::new(Direct::with_name("A"));
        let b = Arc::new(Direct::with_name("B"));
        registry.insert(a.clone()).unwrap();
        registry.insert(b).unwrap();

        let members = Arc::new(GroupMembers::new(
            registry,
            vec!["A".to_string(), "B".to_string()],
            Vec::new(),
            None,
            None,
        ));
        let option = GroupOption {
            name: "FB".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        };
        let group = Fallback::new(option, members);

        assert_eq!(group.now(), "A");
        a.state().mark_dead();
        assert_eq!(group.now(), "B");
        a.state().record_delay(20);
        assert_eq!(group.now(), "A");
    }
}
