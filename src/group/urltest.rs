//! `url-test` group: lowest-RTT member with stable hysteresis.

use super::{GroupMembers, GroupOption};
use crate::common::Metadata;
use crate::outbound::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, ProxyType,
    DELAY_INFINITE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Auto-selecting group that tracks probe latencies. The current member is
/// kept while it stays within `tolerance` milliseconds of the best, which
/// stops flapping between near-equal members.
pub struct UrlTest {
    option: GroupOption,
    members: Arc<GroupMembers>,
    current: RwLock<Option<String>>,
    state: AdapterState,
}

impl UrlTest {
    pub fn new(option: GroupOption, members: Arc<GroupMembers>) -> Self {
        UrlTest {
            option,
            members,
            current: RwLock::new(None),
            state: AdapterState::default(),
        }
    }

    /// Pick using last probe delays, applying hysteresis against the
    /// currently selected member.
    fn pick(&self) -> Option<Arc<dyn OutboundProxy>> {
        let members = self.members.resolve();
        let best = members
            .iter()
            .filter(|p| p.alive())
            .min_by_key(|p| p.last_delay())?
            .clone();

        let current_name = self.current.read().clone();
        if let Some(current_name) = current_name {
            if let Some(current) = members
                .iter()
                .find(|p| p.name() == current_name && p.alive())
            {
                let current_delay = current.last_delay();
                let best_delay = best.last_delay();
                if current_delay != DELAY_INFINITE
                    && current_delay.saturating_sub(best_delay) <= self.option.tolerance
                {
                    return Some(current.clone());
                }
            }
        }

        let changed = {
            let current = self.current.read();
            current.as_deref() != Some(best.name())
        };
        if changed {
            debug!("{} switches to {}", self.option.name, best.name());
            *self.current.write() = Some(best.name().to_string());
        }
        Some(best)
    }

    pub fn now(&self) -> String {
        self.pick().map(|p| p.name().to_string()).unwrap_or_default()
    }

    pub fn all(&self) -> Vec<String> {
        self.members.names()
    }

    /// Candidates ordered by preference for fail-over dialing.
    fn candidates(&self) -> Vec<Arc<dyn OutboundProxy>> {
        let mut members: Vec<_> = self
            .members
            .resolve()
            .into_iter()
            .filter(|p| p.alive())
            .collect();
        members.sort_by_key(|p| p.last_delay());

        if let Some(first) = self.pick() {
            members.retain(|p| p.name() != first.name());
            members.insert(0, first);
        }
        members
    }
}

#[async_trait]
impl OutboundProxy for UrlTest {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::UrlTest
    }

    fn support_udp(&self) -> bool {
        if self.option.disable_udp {
            return false;
        }
        self.pick().map(|p| p.support_udp()).unwrap_or(false)
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        self.members.touch();
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());

        let mut last_err = None;
        for member in self.candidates() {
            match member.dial(&ctx, metadata).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("{}: member {} failed: {}", self.option.name, member.name(), e);
                    member.state().mark_dead();
                    *self.current.write() = None;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::proxy(format!("{}: no members alive", self.option.name))))
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
            .pick()
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

    fn fixture(delays: &[(&str, u16)]) -> (Arc<ProxyRegistry>, UrlTest) {
        let registry = Arc::new(ProxyRegistry::new());
        let mut names = Vec::new();
        for (name, delay) in delays {
            let proxy = Arc::new(Direct::with_name(*name));
            proxy.state().record_delay(*delay);
            registry.insert(proxy).unwrap();
            names.push(name.to_string());
        }

        let members = Arc::new(GroupMembers::new(
            registry.clone(),
            names,
            Vec::new(),
            None,
            None,
        ));
        let option = GroupOption {
            name: "Auto".to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 50,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        };
        let group = UrlTest::new(option, members);
        (registry, group)
    }

    #[test]
    fn test_switches_beyond_tolerance() {
        // A=120ms current, best B=30ms: |120-30| = 90 > 50 so switch
        let (registry, group) = fixture(&[("A", 120), ("B", 30), ("C", 35)]);
        *group.current.write() = Some("A".to_string());

        assert_eq!(group.now(), "B");

        // Next tick: A=80, B=70, C=75; current B stays (|70-70| = 0)
        for (name, delay) in [("A", 80u16), ("B", 70), ("C", 75)] {
            registry.get(name).unwrap().state().record_delay(delay);
        }
        assert_eq!(group.now(), "B");
    }

    #[test]
    fn test_keeps_current_within_tolerance() {
        // A=60 current, best B=30: |60-30| = 30 <= 50 so keep A
        let (_registry, group) = fixture(&[("A", 60), ("B", 30)]);
        *group.current.write() = Some("A".to_string());
        assert_eq!(group.now(), "A");
    }

    #[test]
    fn test_dead_members_skipped() {
        let (registry, group) = fixture(&[("A", 10), ("B", 90)]);
        registry.get("A").unwrap().state().mark_dead();
        assert_eq!(group.now(), "B");
    }
}
