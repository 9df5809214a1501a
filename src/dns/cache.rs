//! DNS answer cache keyed by (qname, qtype).

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Answers are kept at least this long regardless of upstream TTL
pub const MIN_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct CacheEntry {
    msg: Message,
    expires: Instant,
}

/// LRU answer cache. TTLs below the floor are raised to it; invalidation is
/// explicit via `remove_host` on policy changes.
pub struct DnsCache {
    cache: Mutex<LruCache<(String, RecordType), CacheEntry>>,
}

impl DnsCache {
    pub fn new(max_size: usize) -> Self {
        DnsCache {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::new(4096).unwrap()),
            )),
        }
    }

    fn key(qname: &str, qtype: RecordType) -> (String, RecordType) {
        (qname.trim_end_matches('.').to_lowercase(), qtype)
    }

    pub fn get(&self, qname: &str, qtype: RecordType) -> Option<Message> {
        let key = Self::key(qname, qtype);
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&key) {
            if entry.expires > Instant::now() {
                return Some(entry.msg.clone());
            }
            cache.pop(&key);
        }
        None
    }

    /// Store an answer under its lowest record TTL, floored to `MIN_TTL`.
    pub fn put(&self, qname: &str, qtype: RecordType, msg: Message) {
        let ttl = msg
            .answers()
            .iter()
            .map(|r| r.ttl() as u64)
            .min()
            .map(Duration::from_secs)
            .unwrap_or(MIN_TTL)
            .max(MIN_TTL);

        let entry = CacheEntry {
            msg,
            expires: Instant::now() + ttl,
        };
        self.cache.lock().put(Self::key(qname, qtype), entry);
    }

    /// Drop every cached qtype for `host`.
    pub fn remove_host(&self, host: &str) {
        let host = host.trim_end_matches('.').to_lowercase();
        let mut cache = self.cache.lock();
        let keys: Vec<(String, RecordType)> = cache
            .iter()
            .filter(|((name, _), _)| *name == host)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn answer(qname: &str, ip: [u8; 4], ttl: u32) -> Message {
        let mut msg = Message::new();
        let name = Name::from_str(qname).unwrap();
        msg.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(hickory_proto::rr::rdata::A(ip.into())),
        ));
        msg
    }

    #[test]
    fn test_put_get_keyed_by_type() {
        let cache = DnsCache::new(16);
        cache.put("example.com", RecordType::A, answer("example.com.", [1, 2, 3, 4], 300));

        assert!(cache.get("example.com", RecordType::A).is_some());
        assert!(cache.get("example.com.", RecordType::A).is_some());
        assert!(cache.get("example.com", RecordType::AAAA).is_none());
    }

    #[test]
    fn test_remove_host_drops_all_types() {
        let cache = DnsCache::new(16);
        cache.put("a.com", RecordType::A, answer("a.com.", [1, 1, 1, 1], 300));
        cache.put("a.com", RecordType::AAAA, answer("a.com.", [1, 1, 1, 1], 300));
        cache.put("b.com", RecordType::A, answer("b.com.", [2, 2, 2, 2], 300));

        cache.remove_host("a.com");
        assert!(cache.get("a.com", RecordType::A).is_none());
        assert!(cache.get("a.com", RecordType::AAAA).is_none());
        assert!(cache.get("b.com", RecordType::A).is_some());
    }

    #[test]
    fn test_ttl_floor() {
        // A 1-second upstream TTL must not expire the entry immediately;
        // the floor keeps it for at least 60s.
        let cache = DnsCache::new(16);
        cache.put("low.com", RecordType::A, answer("low.com.", [9, 9, 9, 9], 1));
        assert!(cache.get("low.com", RecordType::A).is_some());
    }
}
