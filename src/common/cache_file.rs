//! On-disk cache (`cache.db`): fake-IP assignments and selected-group memory.
//!
//! Writes are atomic (temp file + rename) and path components are confined
//! to the configured home directory so provider-supplied names cannot
//! escape it.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

const CACHE_FILE: &str = "cache.db";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CacheData {
    #[serde(default)]
    fakeip: HashMap<String, IpAddr>,
    #[serde(default)]
    fakeip_cidr: Option<String>,
    #[serde(default)]
    selected: HashMap<String, String>,
}

/// Persistent gateway cache rooted at the home directory.
pub struct CacheFile {
    home: PathBuf,
    data: Mutex<CacheData>,
}

impl CacheFile {
    /// Open (or initialize) the cache under `home`.
    pub fn open(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let data = match std::fs::read(home.join(CACHE_FILE)) {
            Ok(buf) => serde_json::from_slice(&buf).unwrap_or_else(|e| {
                warn!("cache.db is corrupt, starting empty: {}", e);
                CacheData::default()
            }),
            Err(_) => CacheData::default(),
        };

        CacheFile {
            home,
            data: Mutex::new(data),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Resolve `rel` under the home directory, rejecting traversal.
    pub fn safe_path(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        let mut out = self.home.clone();
        for comp in rel_path.components() {
            match comp {
                Component::Normal(c) => out.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(Error::config(format!(
                        "path escapes home directory: {}",
                        rel
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Atomically write `buf` to `rel` under home, creating directories.
    pub fn safe_write(&self, rel: &str, buf: &[u8]) -> Result<()> {
        let path = self.safe_path(rel)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, buf)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Record a fake-IP assignment.
    pub fn put_fakeip(&self, host: &str, ip: IpAddr) {
        self.data.lock().fakeip.insert(host.to_string(), ip);
    }

    pub fn remove_fakeip(&self, host: &str) {
        self.data.lock().fakeip.remove(host);
    }

    /// Stored assignments iff they were taken from `cidr`; a changed range
    /// invalidates the whole table.
    pub fn fakeip_snapshot(&self, cidr: &str) -> Vec<(String, IpAddr)> {
        let mut data = self.data.lock();
        if data.fakeip_cidr.as_deref() != Some(cidr) {
            data.fakeip.clear();
            data.fakeip_cidr = Some(cidr.to_string());
            return Vec::new();
        }
        data.fakeip.iter().map(|(h, ip)| (h.clone(), *ip)).collect()
    }

    /// Remember the user's pick for a selector group.
    pub fn set_selected(&self, group: &str, proxy: &str) {
        self.data
            .lock()
            .selected
            .insert(group.to_string(), proxy.to_string());
    }

    pub fn selected(&self, group: &str) -> Option<String> {
        self.data.lock().selected.get(group).cloned()
    }

    /// Flush the in-memory cache to disk.
    pub fn flush(&self) -> Result<()> {
        let buf = {
            let data = self.data.lock();
            serde_json::to_vec(&*data)?
        };
        self.safe_write(CACHE_FILE, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_path_rejects_traversal() {
        let cache = CacheFile::open(std::env::temp_dir());
        assert!(cache.safe_path("providers/rules.yaml").is_ok());
        assert!(cache.safe_path("../escape").is_err());
        assert!(cache.safe_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_fakeip_snapshot_invalidated_on_cidr_change() {
        let cache = CacheFile::open(std::env::temp_dir());
        cache.put_fakeip("foo.com", "198.18.0.2".parse().unwrap());
        assert_eq!(cache.fakeip_snapshot("198.18.0.0/16").len(), 1);
        // New range drops the table
        assert!(cache.fakeip_snapshot("10.0.0.0/8").is_empty());
    }

    #[test]
    fn test_selected_roundtrip() {
        let cache = CacheFile::open(std::env::temp_dir());
        cache.set_selected("Proxy", "node-a");
        assert_eq!(cache.selected("Proxy").as_deref(), Some("node-a"));
        assert!(cache.selected("Other").is_none());
    }
}
