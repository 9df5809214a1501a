//! Domain trie for O(|host|) domain matching.
//!
//! Backs DOMAIN/DOMAIN-SUFFIX rules, the hosts table, the fake-IP filter,
//! the nameserver policy, and GeoSite domain sets.
//!
//! Patterns:
//! - `example.com`    exact match
//! - `*.example.com`  any subdomain, not the base
//! - `+.example.com`  the base and any subdomain (suffix)
//! - `.example.com`   same as `+.example.com`
//! - `+` / `*`        everything

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct TrieNode<T: Clone> {
    children: HashMap<String, TrieNode<T>>,
    /// Exact value terminating at this node
    value: Option<T>,
    /// `*.` value: subdomains only
    wildcard: Option<T>,
    /// `+.` value: this domain and all subdomains
    suffix: Option<T>,
}

impl<T: Clone> Default for TrieNode<T> {
    fn default() -> Self {
        TrieNode {
            children: HashMap::new(),
            value: None,
            wildcard: None,
            suffix: None,
        }
    }
}

/// Domain trie keyed on reversed dot-separated labels.
#[derive(Debug, Clone)]
pub struct DomainTrie<T: Clone> {
    root: TrieNode<T>,
    full_wildcard: Option<T>,
    count: usize,
}

impl<T: Clone> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> DomainTrie<T> {
    pub fn new() -> Self {
        DomainTrie {
            root: TrieNode::default(),
            full_wildcard: None,
            count: 0,
        }
    }

    /// Insert a pattern. Returns false for an empty pattern.
    pub fn insert(&mut self, pattern: &str, value: T) -> bool {
        let pattern = pattern.trim().trim_end_matches('.').to_lowercase();

        if pattern == "+" || pattern == "*" {
            self.full_wildcard = Some(value);
            self.count += 1;
            return true;
        }

        enum Kind {
            Exact,
            Wildcard,
            Suffix,
        }

        let (kind, rest) = if let Some(rest) = pattern.strip_prefix("*.") {
            (Kind::Wildcard, rest)
        } else if let Some(rest) = pattern.strip_prefix("+.") {
            (Kind::Suffix, rest)
        } else if let Some(rest) = pattern.strip_prefix('.') {
            (Kind::Suffix, rest)
        } else {
            (Kind::Exact, pattern.as_str())
        };

        if rest.is_empty() {
            return false;
        }

        let mut node = &mut self.root;
        for label in rest.rsplit('.') {
            node = node
                .children
                .entry(label.to_string())
                .or_insert_with(TrieNode::default);
        }

        match kind {
            Kind::Exact => node.value = Some(value),
            Kind::Wildcard => node.wildcard = Some(value),
            Kind::Suffix => node.suffix = Some(value),
        }

        self.count += 1;
        true
    }

    /// Insert a DOMAIN-SUFFIX payload: the base and all subdomains.
    pub fn insert_suffix(&mut self, domain: &str, value: T) -> bool {
        let domain = domain.trim_start_matches('.');
        if domain.is_empty() {
            return false;
        }
        self.insert(&format!("+.{}", domain), value)
    }

    /// Best match for `domain`. Exact beats wildcard beats shorter suffix.
    pub fn search(&self, domain: &str) -> Option<&T> {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if domain.is_empty() {
            return self.full_wildcard.as_ref();
        }

        let labels: Vec<&str> = domain.rsplit('.').collect();
        let mut node = &self.root;
        let mut best: Option<&T> = self.full_wildcard.as_ref();

        for (i, label) in labels.iter().enumerate() {
            let last = i == labels.len() - 1;

            // A suffix stored at the current node covers everything below it
            if let Some(ref v) = node.suffix {
                best = Some(v);
            }

            match node.children.get(*label) {
                Some(child) => {
                    node = child;
                    if last {
                        if let Some(ref v) = node.value {
                            return Some(v);
                        }
                        // `+.x` matches x itself
                        if let Some(ref v) = node.suffix {
                            return Some(v);
                        }
                        return best;
                    }
                }
                None => {
                    // `*.x` matches any remaining labels below x
                    if let Some(ref v) = node.wildcard {
                        return Some(v);
                    }
                    return best;
                }
            }

            // Descended one level under x: `*.x` applies
            if let Some(ref v) = node.wildcard {
                best = Some(v);
            }
        }

        best
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.search(domain).is_some()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com", 1);

        assert_eq!(trie.search("example.com"), Some(&1));
        assert_eq!(trie.search("www.example.com"), None);
        assert_eq!(trie.search("example.org"), None);
    }

    #[test]
    fn test_wildcard_excludes_base() {
        let mut trie = DomainTrie::new();
        trie.insert("*.example.com", 1);

        assert_eq!(trie.search("www.example.com"), Some(&1));
        assert_eq!(trie.search("a.b.example.com"), Some(&1));
        assert_eq!(trie.search("example.com"), None);
    }

    #[test]
    fn test_suffix_includes_base() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("example.com", 1);

        assert_eq!(trie.search("example.com"), Some(&1));
        assert_eq!(trie.search("deep.sub.example.com"), Some(&1));
        assert_eq!(trie.search("notexample.com"), None);
    }

    #[test]
    fn test_dot_prefix_is_suffix() {
        let mut trie = DomainTrie::new();
        trie.insert(".lan", 1);

        assert_eq!(trie.search("printer.lan"), Some(&1));
        assert_eq!(trie.search("lan"), Some(&1));
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let mut trie = DomainTrie::new();
        trie.insert("*.example.com", 1);
        trie.insert("www.example.com", 2);

        assert_eq!(trie.search("www.example.com"), Some(&2));
        assert_eq!(trie.search("api.example.com"), Some(&1));
    }

    #[test]
    fn test_longer_suffix_wins() {
        let mut trie = DomainTrie::new();
        trie.insert("+.com", 1);
        trie.insert("+.example.com", 2);

        assert_eq!(trie.search("a.example.com"), Some(&2));
        assert_eq!(trie.search("other.com"), Some(&1));
    }

    #[test]
    fn test_full_wildcard() {
        let mut trie = DomainTrie::new();
        trie.insert("+", 1);
        trie.insert("special.io", 2);

        assert_eq!(trie.search("anything.net"), Some(&1));
        assert_eq!(trie.search("special.io"), Some(&2));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let mut trie = DomainTrie::new();
        trie.insert("Example.COM", 1);

        assert_eq!(trie.search("EXAMPLE.com."), Some(&1));
    }
}
