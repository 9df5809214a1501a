//! Fake-IP pool: a bounded bijection between synthetic IPv4 addresses and
//! hostnames inside a configured CIDR.
//!
//! The first two addresses (gateway and its neighbor) and the broadcast
//! address are never handed out. Eviction is LRU on the host map; evicted
//! addresses are recycled through a free list, keeping the bijection exact.

use crate::common::CacheFile;
use crate::rule::DomainTrie;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1000;

struct PoolState {
    /// Next fresh offset from the first usable address
    offset: u32,
    host_to_ip: LruCache<String, Ipv4Addr>,
    ip_to_host: std::collections::HashMap<Ipv4Addr, String>,
    free: Vec<Ipv4Addr>,
}

/// Fake-IP allocator.
pub struct FakeIpPool {
    network: Ipv4Net,
    first: u32,
    usable: u32,
    filter: DomainTrie<()>,
    state: Mutex<PoolState>,
    store: Option<Arc<CacheFile>>,
}

impl FakeIpPool {
    pub fn new(
        cidr: &str,
        filter_patterns: &[String],
        store: Option<Arc<CacheFile>>,
    ) -> Result<Self> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| Error::config(format!("invalid fake-ip-range {}: {}", cidr, e)))?;

        let total = 1u64 << (32 - network.prefix_len());
        if total < 8 {
            return Err(Error::config(format!(
                "fake-ip-range {} is too small",
                cidr
            )));
        }
        // Skip network address, gateway, and broadcast
        let usable = (total - 3) as u32;
        let capacity = (DEFAULT_CAPACITY as u32).min(usable) as usize;
        let first = u32::from(network.network()) + 2;

        let mut filter = DomainTrie::new();
        for pattern in filter_patterns {
            filter.insert(pattern, ());
        }

        let mut pool = FakeIpPool {
            network,
            first,
            usable,
            filter,
            state: Mutex::new(PoolState {
                offset: 0,
                host_to_ip: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
                ),
                ip_to_host: std::collections::HashMap::new(),
                free: Vec::new(),
            }),
            store,
        };
        pool.restore();
        Ok(pool)
    }

    /// Reload persisted assignments; discarded wholesale if the CIDR changed.
    fn restore(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = store.fakeip_snapshot(&self.network.to_string());
        let mut state = self.state.lock();
        for (host, ip) in snapshot {
            let IpAddr::V4(ip) = ip else { continue };
            if !self.network.contains(&ip) {
                continue;
            }
            let index = u32::from(ip).saturating_sub(self.first);
            state.offset = state.offset.max(index + 1);
            if let Some((_, old_ip)) = state.host_to_ip.push(host.clone(), ip) {
                if old_ip != ip {
                    state.ip_to_host.remove(&old_ip);
                }
            }
            state.ip_to_host.insert(ip, host);
        }
        if !state.host_to_ip.is_empty() {
            debug!("restored {} fake-ip assignments", state.host_to_ip.len());
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.network
    }

    /// Gateway address of the range (never assigned)
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()) + 1)
    }

    /// Whether `host` is excluded from fake-IP answering.
    pub fn should_skip(&self, host: &str) -> bool {
        self.filter.contains(host)
    }

    /// Whether `ip` falls inside the synthetic range.
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.network.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Stable synthetic address for `host`, allocating on first use.
    pub fn lookup_ip(&self, host: &str) -> Ipv4Addr {
        let host = host.trim_end_matches('.').to_lowercase();
        let mut state = self.state.lock();

        if let Some(ip) = state.host_to_ip.get(&host) {
            return *ip;
        }

        let full = state.host_to_ip.len() == usize::from(state.host_to_ip.cap());
        let ip = if let Some(ip) = state.free.pop() {
            ip
        } else if let Some((old_host, old_ip)) = full.then(|| state.host_to_ip.pop_lru()).flatten()
        {
            // Pool exhausted: evict the least-recently-used assignment
            // and reuse its address
            state.ip_to_host.remove(&old_ip);
            if let Some(ref store) = self.store {
                store.remove_fakeip(&old_host);
            }
            old_ip
        } else {
            let ip = Ipv4Addr::from(self.first + (state.offset % self.usable));
            state.offset += 1;
            ip
        };

        if let Some((evicted_host, evicted_ip)) = state.host_to_ip.push(host.clone(), ip) {
            // Capacity was checked above, so this only fires on re-insert
            if evicted_host != host {
                state.ip_to_host.remove(&evicted_ip);
                state.free.push(evicted_ip);
            }
        }
        state.ip_to_host.insert(ip, host.clone());

        if let Some(ref store) = self.store {
            store.put_fakeip(&host, IpAddr::V4(ip));
        }

        debug!("fake-ip {} -> {}", host, ip);
        ip
    }

    /// Reverse mapping used on outbound dial to recover the real host.
    pub fn lookup_host(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else { return None };
        let mut state = self.state.lock();
        let host = state.ip_to_host.get(&v4).cloned()?;
        // Touch the LRU so active mappings stay resident
        state.host_to_ip.get(&host);
        Some(host)
    }

    pub fn len(&self) -> usize {
        self.state.lock().host_to_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush assignments through the persistent store, when configured.
    pub fn flush(&self) -> Result<()> {
        match self.store {
            Some(ref store) => store.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FakeIpPool {
        FakeIpPool::new("198.18.0.0/16", &["+.lan".to_string()], None).unwrap()
    }

    #[test]
    fn test_first_assignment_skips_gateway() {
        let p = pool();
        assert_eq!(p.gateway(), "198.18.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(p.lookup_ip("foo.com"), "198.18.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(p.lookup_ip("bar.com"), "198.18.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_bijection() {
        let p = pool();
        let ip = p.lookup_ip("foo.com");
        assert_eq!(p.lookup_host(IpAddr::V4(ip)).as_deref(), Some("foo.com"));
        // Stable across repeated lookups
        assert_eq!(p.lookup_ip("foo.com"), ip);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_filter() {
        let p = pool();
        assert!(p.should_skip("printer.lan"));
        assert!(!p.should_skip("foo.com"));
    }

    #[test]
    fn test_range_membership() {
        let p = pool();
        assert!(p.is_fake_ip("198.18.44.7".parse().unwrap()));
        assert!(!p.is_fake_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_lru_eviction_recycles() {
        // /29 has 8 addresses, 5 usable; capacity is clamped to 5
        let p = FakeIpPool::new("10.0.0.0/29", &[], None).unwrap();

        let first = p.lookup_ip("h0");
        for i in 1..5 {
            p.lookup_ip(&format!("h{}", i));
        }
        // Sixth host evicts the oldest (h0) and reuses its address
        let recycled = p.lookup_ip("h5");
        assert_eq!(recycled, first);
        assert!(p.lookup_host(IpAddr::V4(first)).as_deref() == Some("h5"));
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fakeip-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(CacheFile::open(&dir));

        let p = FakeIpPool::new("198.18.0.0/16", &[], Some(store.clone())).unwrap();
        let ip = p.lookup_ip("persist.me");
        p.flush().unwrap();

        let store2 = Arc::new(CacheFile::open(&dir));
        let p2 = FakeIpPool::new("198.18.0.0/16", &[], Some(store2)).unwrap();
        assert_eq!(p2.lookup_host(IpAddr::V4(ip)).as_deref(), Some("persist.me"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
