//! GeoSite database: domain sets decoded lazily per list code.

use crate::rule::DomainTrie;
use crate::{Error, Result};
use parking_lot::RwLock;
use prost::Message;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Domain entry kind, mirroring the geosite.dat wire format
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum DomainType {
    /// Substring match
    Plain = 0,
    /// Regular expression
    Regex = 1,
    /// Domain and subdomains
    RootDomain = 2,
    /// Exact match
    Full = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct DomainEntry {
    #[prost(enumeration = "DomainType", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SiteGroup {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub domain: Vec<DomainEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SiteGroupList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<SiteGroup>,
}

/// Compiled matcher for a single list code.
pub struct GeoSiteMatcher {
    code: String,
    trie: DomainTrie<()>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
}

impl GeoSiteMatcher {
    fn compile(code: &str, group: &SiteGroup) -> Self {
        let mut trie = DomainTrie::new();
        let mut keywords = Vec::new();
        let mut regexes = Vec::new();

        for entry in &group.domain {
            match DomainType::try_from(entry.kind).unwrap_or(DomainType::Plain) {
                DomainType::Full => {
                    trie.insert(&entry.value, ());
                }
                DomainType::RootDomain => {
                    trie.insert_suffix(&entry.value, ());
                }
                DomainType::Plain => keywords.push(entry.value.to_lowercase()),
                DomainType::Regex => match Regex::new(&entry.value) {
                    Ok(re) => regexes.push(re),
                    Err(e) => warn!("geosite:{} bad regex {:?}: {}", code, entry.value, e),
                },
            }
        }

        GeoSiteMatcher {
            code: code.to_string(),
            trie,
            keywords,
            regexes,
        }
    }

    /// Empty matcher used when the database or code is missing.
    fn empty(code: &str) -> Self {
        GeoSiteMatcher {
            code: code.to_string(),
            trie: DomainTrie::new(),
            keywords: Vec::new(),
            regexes: Vec::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        if self.trie.contains(&host) {
            return true;
        }
        if self.keywords.iter().any(|kw| host.contains(kw)) {
            return true;
        }
        self.regexes.iter().any(|re| re.is_match(&host))
    }

    pub fn len(&self) -> usize {
        self.trie.len() + self.keywords.len() + self.regexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazy GeoSite loader: the file is decoded once, matchers compiled per code
/// on first use and cached.
pub struct GeoSiteReader {
    path: String,
    list: RwLock<Option<Arc<SiteGroupList>>>,
    matchers: RwLock<HashMap<String, Arc<GeoSiteMatcher>>>,
}

impl GeoSiteReader {
    pub fn new(path: &str) -> Self {
        GeoSiteReader {
            path: path.to_string(),
            list: RwLock::new(None),
            matchers: RwLock::new(HashMap::new()),
        }
    }

    fn load_list(&self) -> Result<Arc<SiteGroupList>> {
        if let Some(list) = self.list.read().clone() {
            return Ok(list);
        }

        if !Path::new(&self.path).exists() {
            return Err(Error::config(format!(
                "geosite database not found: {}",
                self.path
            )));
        }

        let buf = std::fs::read(&self.path)?;
        let list = SiteGroupList::decode(buf.as_slice())
            .map_err(|e| Error::parse(format!("geosite decode: {}", e)))?;
        let list = Arc::new(list);
        *self.list.write() = Some(list.clone());
        Ok(list)
    }

    /// Matcher for `code`. Missing database or unknown code yields an empty
    /// matcher so GEOSITE rules simply never match.
    pub fn matcher(&self, code: &str) -> Arc<GeoSiteMatcher> {
        let code = code.to_lowercase();
        if let Some(m) = self.matchers.read().get(&code) {
            return m.clone();
        }

        let matcher = match self.load_list() {
            Ok(list) => match list
                .entry
                .iter()
                .find(|g| g.country_code.eq_ignore_ascii_case(&code))
            {
                Some(group) => {
                    let m = GeoSiteMatcher::compile(&code, group);
                    debug!("geosite:{} compiled with {} entries", code, m.len());
                    m
                }
                None => {
                    warn!("geosite code {:?} not present in {}", code, self.path);
                    GeoSiteMatcher::empty(&code)
                }
            },
            Err(e) => {
                warn!("geosite load failed: {}", e);
                GeoSiteMatcher::empty(&code)
            }
        };

        let matcher = Arc::new(matcher);
        self.matchers
            .write()
            .insert(code.to_string(), matcher.clone());
        matcher
    }

    /// Strict variant used by provider pre-population: load errors surface.
    pub fn try_matcher(&self, code: &str) -> Result<Arc<GeoSiteMatcher>> {
        let list = self.load_list()?;
        let code_lc = code.to_lowercase();
        let group = list
            .entry
            .iter()
            .find(|g| g.country_code.eq_ignore_ascii_case(&code_lc))
            .ok_or_else(|| Error::provider(format!("geosite code not found: {}", code)))?;

        let matcher = Arc::new(GeoSiteMatcher::compile(&code_lc, group));
        self.matchers
            .write()
            .insert(code_lc, matcher.clone());
        Ok(matcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group() -> SiteGroup {
        SiteGroup {
            country_code: "TEST".to_string(),
            domain: vec![
                DomainEntry {
                    kind: DomainType::Full as i32,
                    value: "exact.example.com".to_string(),
                },
                DomainEntry {
                    kind: DomainType::RootDomain as i32,
                    value: "example.org".to_string(),
                },
                DomainEntry {
                    kind: DomainType::Plain as i32,
                    value: "tracker".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_matcher_kinds() {
        let m = GeoSiteMatcher::compile("test", &sample_group());

        assert!(m.matches("exact.example.com"));
        assert!(!m.matches("sub.exact.example.com"));
        assert!(m.matches("example.org"));
        assert!(m.matches("cdn.example.org"));
        assert!(m.matches("my-tracker.net"));
        assert!(!m.matches("clean.net"));
    }

    #[test]
    fn test_missing_database_yields_empty_matcher() {
        let reader = GeoSiteReader::new("nonexistent.dat");
        let m = reader.matcher("cn");
        assert!(m.is_empty());
        assert!(!m.matches("example.cn"));
        // Strict path surfaces the error instead
        assert!(reader.try_matcher("cn").is_err());
    }

    #[test]
    fn test_roundtrip_decode() {
        let list = SiteGroupList {
            entry: vec![sample_group()],
        };
        let mut buf = Vec::new();
        list.encode(&mut buf).unwrap();

        let decoded = SiteGroupList::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded.entry.len(), 1);
        assert_eq!(decoded.entry[0].country_code, "TEST");
    }
}
