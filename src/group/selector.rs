//! `select` group: user-pinned member.

use super::{GroupMembers, GroupOption};
use crate::common::{CacheFile, Metadata};
use crate::outbound::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, ProxyType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Manual selector. The pick defaults to the first member and survives
/// restarts through the cache file.
pub struct Selector {
    option: GroupOption,
    members: Arc<GroupMembers>,
    selected: RwLock<Option<String>>,
    cache: Option<Arc<CacheFile>>,
    state: AdapterState,
}

impl Selector {
    pub fn new(
        option: GroupOption,
        members: Arc<GroupMembers>,
        cache: Option<Arc<CacheFile>>,
    ) -> Self {
        let restored = cache.as_ref().and_then(|c| c.selected(&option.name));
        Selector {
            option,
            members,
            selected: RwLock::new(restored),
            cache,
            state: AdapterState::default(),
        }
    }

    /// Current selection, falling back to the first member.
    pub fn now(&self) -> String {
        let selected = self.selected.read().clone();
        let names = self.members.names();
        match selected {
            Some(name) if names.contains(&name) => name,
            _ => names.first().cloned().unwrap_or_default(),
        }
    }

    /// Pin a member by name.
    pub fn set(&self, name: &str) -> Result<()> {
        if !self.members.names().iter().any(|n| n == name) {
            return Err(Error::proxy(format!(
                "{} is not a member of {}",
                name, self.option.name
            )));
        }
        *self.selected.write() = Some(name.to_string());
        if let Some(ref cache) = self.cache {
            cache.set_selected(&self.option.name, name);
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<String> {
        self.members.names()
    }

    fn current(&self) -> Result<Arc<dyn OutboundProxy>> {
        let now = self.now();
        self.members
            .resolve()
            .into_iter()
            .find(|p| p.name() == now)
            .ok_or_else(|| Error::proxy(format!("{} has no members", self.option.name)))
    }
}

#[async_trait]
impl OutboundProxy for Selector {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Selector
    }

    fn support_udp(&self) -> bool {
        if self.option.disable_udp {
            return false;
        }
        self.current().map(|p| p.support_udp()).unwrap_or(false)
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        self.members.touch();
        let member = self.current()?;
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());
        // A pinned member that fails is an error, not a fail-over
        member.dial(&ctx, metadata).await
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
        let member = self.current()?;
        let mut ctx = ctx.clone();
        ctx.chain.push(self.option.name.clone());
        member.listen_packet(&ctx, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{Direct, ProxyRegistry, Reject};

    fn members(registry: &Arc<ProxyRegistry>, names: &[&str]) -> Arc<GroupMembers> {
        Arc::new(GroupMembers::new(
            registry.clone(),
            names.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
            None,
            None,
        ))
    }

    fn option(name: &str) -> GroupOption {
        GroupOption {
            name: name.to_string(),
            url: super::super::DEFAULT_TEST_URL.to_string(),
            interval: std::time::Duration::from_secs(300),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            hidden: false,
            icon: None,
            strategy: "consistent-hashing".to_string(),
        }
    }

    #[test]
    fn test_default_is_first_member() {
        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(Direct::new())).unwrap();
        registry.insert(Arc::new(Reject::new("REJECT", false))).unwrap();

        let selector = Selector::new(option("Pick"), members(&registry, &["DIRECT", "REJECT"]), None);
        assert_eq!(selector.now(), "DIRECT");
    }

    #[test]
    fn test_set_validates_membership() {
        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(Direct::new())).unwrap();
        registry.insert(Arc::new(Reject::new("REJECT", false))).unwrap();

        let selector = Selector::new(option("Pick"), members(&registry, &["DIRECT", "REJECT"]), None);
        selector.set("REJECT").unwrap();
        assert_eq!(selector.now(), "REJECT");
        assert!(selector.set("nonexistent").is_err());
    }
}
