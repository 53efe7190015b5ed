//! Blacklist persistence interface.
//!
//! The engine never talks to a database directly; it loads snapshots through
//! a [`BlacklistStore`]. `egress-storage` provides the SQLite backend and
//! [`MemoryStore`] serves tests and ephemeral runs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::blacklist::{BlacklistSnapshot, HostPattern};
use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Narrow interface to wherever blocked host patterns are persisted.
pub trait BlacklistStore: Send + Sync {
    /// Loads every stored pattern.
    fn load_all(&self) -> StoreResult<Vec<HostPattern>>;

    /// Adds a pattern. Returns false if it was already present.
    fn add(&self, pattern: &HostPattern) -> StoreResult<bool>;

    /// Removes a pattern. Returns false if it was not present.
    fn remove(&self, pattern: &HostPattern) -> StoreResult<bool>;

    /// Re-reads the backing storage.
    fn reload(&self) -> StoreResult<Vec<HostPattern>> {
        self.load_all()
    }

    /// A counter that changes whenever the stored set changes.
    ///
    /// `None` means the backend cannot tell, and pollers should reload
    /// unconditionally.
    fn revision(&self) -> StoreResult<Option<u64>> {
        Ok(None)
    }

    /// Loads everything into a snapshot.
    fn load_snapshot(&self) -> StoreResult<BlacklistSnapshot> {
        Ok(BlacklistSnapshot::from_patterns(self.load_all()?))
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    patterns: RwLock<BTreeSet<HostPattern>>,
    revision: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `patterns`.
    pub fn with_patterns<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = HostPattern>,
    {
        Self {
            patterns: RwLock::new(patterns.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl BlacklistStore for MemoryStore {
    fn load_all(&self) -> StoreResult<Vec<HostPattern>> {
        self.check()?;
        Ok(self.patterns.read().iter().cloned().collect())
    }

    fn add(&self, pattern: &HostPattern) -> StoreResult<bool> {
        self.check()?;
        let added = self.patterns.write().insert(pattern.clone());
        if added {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        Ok(added)
    }

    fn remove(&self, pattern: &HostPattern) -> StoreResult<bool> {
        self.check()?;
        let removed = self.patterns.write().remove(pattern);
        if removed {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn revision(&self) -> StoreResult<Option<u64>> {
        self.check()?;
        Ok(Some(self.revision.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> HostPattern {
        HostPattern::parse(s).unwrap()
    }

    #[test]
    fn add_remove_bump_revision() {
        let store = MemoryStore::new();
        assert_eq!(store.revision().unwrap(), Some(0));

        assert!(store.add(&pattern("a.com")).unwrap());
        assert!(!store.add(&pattern("A.com")).unwrap());
        assert_eq!(store.revision().unwrap(), Some(1));

        assert!(store.remove(&pattern("a.com")).unwrap());
        assert!(!store.remove(&pattern("a.com")).unwrap());
        assert_eq!(store.revision().unwrap(), Some(2));
    }

    #[test]
    fn load_snapshot_matches_contents() {
        let store = MemoryStore::with_patterns([pattern("*.example.com"), pattern("ads.net")]);
        let snap = store.load_snapshot().unwrap();
        assert!(snap.is_blocked("x.example.com"));
        assert!(snap.is_blocked("ads.net"));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.load_all(), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.add(&pattern("a.com")),
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert!(store.reload().unwrap().is_empty());
    }
}
