//! Host blacklist: patterns, immutable snapshots and the live handle.
//!
//! A pattern is either an exact host name (`ads.example.com`) or a wildcard
//! domain (`*.example.com`). A wildcard matches the bare domain and every
//! subdomain at any depth.
//!
//! ```text
//! control plane ──replace()──▶ Blacklist ──snapshot()──▶ reactor
//!                               (ArcSwap<Snapshot>)
//! ```
//!
//! Updates never mutate a published snapshot; they build a new one and swap
//! the reference, so a reader always sees either the old or the new set.
//! Readers never take a lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::PatternError;

/// Prefix marking a wildcard pattern.
pub const WILDCARD_PREFIX: &str = "*.";

/// A normalised host pattern (lowercase, no trailing dot).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostPattern {
    pattern: String,
}

impl HostPattern {
    /// Parses and normalises a pattern.
    ///
    /// # Examples
    ///
    /// ```
    /// use egress_core::HostPattern;
    ///
    /// let p = HostPattern::parse(" *.Example.COM ").unwrap();
    /// assert_eq!(p.as_str(), "*.example.com");
    /// assert!(p.is_wildcard());
    /// assert!(HostPattern::parse("bad host").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let lowered = normalize_host(trimmed);
        let host_part = lowered.strip_prefix(WILDCARD_PREFIX).unwrap_or(&lowered);

        if !is_valid_host(host_part) {
            return Err(PatternError::Invalid(raw.trim().to_string()));
        }

        Ok(Self { pattern: lowered })
    }

    /// Returns the normalised pattern text.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Checks if this is a `*.`-prefixed wildcard pattern.
    pub fn is_wildcard(&self) -> bool {
        self.pattern.starts_with(WILDCARD_PREFIX)
    }

    /// Returns the domain a wildcard applies to, or the exact host.
    pub fn base_domain(&self) -> &str {
        self.pattern
            .strip_prefix(WILDCARD_PREFIX)
            .unwrap_or(&self.pattern)
    }

    /// Checks if a (normalised) host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        if self.is_wildcard() {
            let base = self.base_domain();
            host == base
                || (host.len() > base.len()
                    && host.ends_with(base)
                    && host.as_bytes()[host.len() - base.len() - 1] == b'.')
        } else {
            host == self.pattern
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl TryFrom<String> for HostPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HostPattern> for String {
    fn from(value: HostPattern) -> Self {
        value.pattern
    }
}

/// Lowercases a host and strips a trailing root dot.
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.starts_with('.') || host.contains("..") {
        return false;
    }

    // Bracketed IPv6 literal as it appears in URLs.
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return !inner.is_empty() && inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':');
    }

    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == ':')
}

/// An immutable point-in-time view of blocked host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistSnapshot {
    /// Exact host names.
    exact: HashSet<String>,
    /// Base domains of wildcard patterns.
    wildcards: HashSet<String>,
}

impl BlacklistSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from already-parsed patterns.
    pub fn from_patterns<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = HostPattern>,
    {
        let mut snapshot = Self::new();
        for pattern in patterns {
            snapshot.insert(pattern);
        }
        snapshot
    }

    /// Parses raw pattern strings into a snapshot.
    pub fn parse_all<I, S>(raw: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = raw
            .into_iter()
            .map(|s| HostPattern::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_patterns(patterns))
    }

    fn insert(&mut self, pattern: HostPattern) {
        if pattern.is_wildcard() {
            self.wildcards.insert(pattern.base_domain().to_string());
        } else {
            self.exact.insert(pattern.pattern);
        }
    }

    /// Returns a copy of this snapshot with `pattern` added.
    pub fn with(&self, pattern: HostPattern) -> Self {
        let mut next = self.clone();
        next.insert(pattern);
        next
    }

    /// Returns a copy of this snapshot with `pattern` removed.
    pub fn without(&self, pattern: &HostPattern) -> Self {
        let mut next = self.clone();
        if pattern.is_wildcard() {
            next.wildcards.remove(pattern.base_domain());
        } else {
            next.exact.remove(pattern.as_str());
        }
        next
    }

    /// Checks whether the snapshot holds exactly this pattern.
    pub fn contains(&self, pattern: &HostPattern) -> bool {
        if pattern.is_wildcard() {
            self.wildcards.contains(pattern.base_domain())
        } else {
            self.exact.contains(pattern.as_str())
        }
    }

    /// Checks if `host` is blocked.
    ///
    /// A host is blocked when it appears verbatim, or when a wildcard's base
    /// domain equals the host or is one of its dot-separated suffixes.
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.exact.contains(&host) {
            return true;
        }
        if self.wildcards.is_empty() {
            return false;
        }

        let mut candidate = host.as_str();
        loop {
            if self.wildcards.contains(candidate) {
                return true;
            }
            match candidate.find('.') {
                Some(idx) => candidate = &candidate[idx + 1..],
                None => return false,
            }
        }
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// Returns true when nothing is blocked.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    /// Returns every pattern, sorted by its text.
    pub fn patterns(&self) -> Vec<HostPattern> {
        let mut patterns: Vec<HostPattern> = self
            .exact
            .iter()
            .map(|h| HostPattern { pattern: h.clone() })
            .chain(self.wildcards.iter().map(|d| HostPattern {
                pattern: format!("{WILDCARD_PREFIX}{d}"),
            }))
            .collect();
        patterns.sort();
        patterns
    }
}

/// The live blacklist: a swappable reference to the current snapshot.
///
/// Cloning shares the same underlying reference.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    current: Arc<ArcSwap<BlacklistSnapshot>>,
}

impl Blacklist {
    /// Creates a live blacklist starting from `snapshot`.
    pub fn new(snapshot: BlacklistSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Returns the current snapshot.
    #[inline]
    pub fn snapshot(&self) -> Arc<BlacklistSnapshot> {
        self.current.load_full()
    }

    /// Checks `host` against the current snapshot.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.current.load().is_blocked(host)
    }

    /// Publishes a new snapshot and returns the previous one.
    pub fn replace(&self, snapshot: BlacklistSnapshot) -> Arc<BlacklistSnapshot> {
        self.current.swap(Arc::new(snapshot))
    }

    /// Derives a new snapshot from the current one and publishes it.
    ///
    /// `f` is re-run if another update lands first, so none is lost.
    pub fn update<F>(&self, f: F) -> Arc<BlacklistSnapshot>
    where
        F: Fn(&BlacklistSnapshot) -> BlacklistSnapshot,
    {
        let mut published = None;
        self.current.rcu(|current| {
            let next = Arc::new(f(current));
            published = Some(Arc::clone(&next));
            next
        });
        match published {
            Some(next) => next,
            None => self.snapshot(),
        }
    }

    /// Number of patterns in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns true when the current snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(patterns: &[&str]) -> BlacklistSnapshot {
        BlacklistSnapshot::parse_all(patterns).unwrap()
    }

    #[test]
    fn pattern_normalizes_case_and_trailing_dot() {
        let p = HostPattern::parse("Ads.Example.COM.").unwrap();
        assert_eq!(p.as_str(), "ads.example.com");
        assert!(!p.is_wildcard());
    }

    #[test]
    fn pattern_rejects_garbage() {
        assert_eq!(HostPattern::parse("   "), Err(PatternError::Empty));
        assert!(HostPattern::parse("exa mple.com").is_err());
        assert!(HostPattern::parse("*.").is_err());
        assert!(HostPattern::parse("a..b").is_err());
        assert!(HostPattern::parse("http://x.com/").is_err());
        assert!(HostPattern::parse("*.*.x.com").is_err());
    }

    #[test]
    fn pattern_accepts_ip_literals() {
        assert!(HostPattern::parse("10.0.0.1").is_ok());
        assert!(HostPattern::parse("[::1]").is_ok());
    }

    #[test]
    fn wildcard_matches_domain_and_any_depth() {
        let p = HostPattern::parse("*.example.com").unwrap();
        assert!(p.matches("example.com"));
        assert!(p.matches("a.example.com"));
        assert!(p.matches("a.b.example.com"));
        assert!(!p.matches("notexample.com"));
        assert!(!p.matches("example.com.evil.net"));
    }

    #[test]
    fn exact_match_only() {
        let snap = snapshot(&["ads.example.com"]);
        assert!(snap.is_blocked("ads.example.com"));
        assert!(snap.is_blocked("ADS.example.com"));
        assert!(!snap.is_blocked("example.com"));
        assert!(!snap.is_blocked("x.ads.example.com"));
    }

    #[test]
    fn wildcard_blocks_subdomains() {
        let snap = snapshot(&["*.example.com"]);
        assert!(snap.is_blocked("example.com"));
        assert!(snap.is_blocked("sub.example.com"));
        assert!(snap.is_blocked("deep.sub.example.com"));
        assert!(!snap.is_blocked("other.com"));
        assert!(!snap.is_blocked("badexample.com"));
    }

    #[test]
    fn snapshot_matching_agrees_with_pattern_matching() {
        let patterns = ["*.example.com", "tracker.net", "*.co.uk"];
        let snap = snapshot(&patterns);
        let hosts = [
            "example.com",
            "a.example.com",
            "tracker.net",
            "x.tracker.net",
            "bbc.co.uk",
            "co.uk",
            "uk",
            "other.org",
        ];
        for host in hosts {
            let expected = patterns
                .iter()
                .any(|p| HostPattern::parse(p).unwrap().matches(host));
            assert_eq!(snap.is_blocked(host), expected, "host {host}");
        }
    }

    #[test]
    fn patterns_are_sorted_and_round_trip() {
        let snap = snapshot(&["b.com", "*.a.com", "a.com"]);
        let texts: Vec<String> = snap.patterns().iter().map(|p| p.to_string()).collect();
        assert_eq!(texts, vec!["*.a.com", "a.com", "b.com"]);
        assert_eq!(BlacklistSnapshot::from_patterns(snap.patterns()), snap);
    }

    #[test]
    fn with_and_without_copy_on_write() {
        let base = snapshot(&["a.com"]);
        let added = base.with(HostPattern::parse("*.b.com").unwrap());
        assert_eq!(base.len(), 1);
        assert_eq!(added.len(), 2);
        assert!(added.is_blocked("x.b.com"));

        let removed = added.without(&HostPattern::parse("a.com").unwrap());
        assert!(!removed.is_blocked("a.com"));
        assert!(added.is_blocked("a.com"));
    }

    #[test]
    fn live_blacklist_swaps_atomically() {
        let live = Blacklist::new(snapshot(&["a.com"]));
        let reader = live.clone();
        let before = reader.snapshot();

        let old = live.replace(snapshot(&["b.com"]));
        assert!(old.is_blocked("a.com"));

        // A snapshot taken before the swap is unaffected.
        assert!(before.is_blocked("a.com"));
        assert!(!reader.is_blocked("a.com"));
        assert!(reader.is_blocked("b.com"));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let live = Blacklist::default();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let live = live.clone();
                std::thread::spawn(move || {
                    let pattern = HostPattern::parse(&format!("host{i}.com")).unwrap();
                    live.update(|current| current.with(pattern.clone()));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(live.len(), 8);
    }

    #[test]
    fn readers_proceed_while_an_update_is_running() {
        let live = Blacklist::new(snapshot(&["old.com"]));
        let reader = live.clone();

        let next = live.update(|current| {
            // Runs on this thread in the middle of the update.
            let seen = reader.snapshot();
            assert!(seen.is_blocked("old.com"));
            assert!(reader.is_blocked("old.com"));
            current.with(HostPattern::parse("new.com").unwrap())
        });

        assert!(next.is_blocked("new.com"));
        assert!(reader.is_blocked("new.com"));
        assert!(Arc::ptr_eq(&next, &reader.snapshot()));
    }

    #[test]
    fn pattern_serde_validates() {
        let p: HostPattern = serde_json::from_str("\"*.Example.com\"").unwrap();
        assert_eq!(p.as_str(), "*.example.com");
        assert!(serde_json::from_str::<HostPattern>("\"no spaces\"").is_err());
    }
}
