//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use egress_core::{BlacklistStore, HostPattern, StoreResult};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::models::BlockedHost;
use crate::pool::ConnectionPool;
use crate::repository::BlockedHostRepo;

/// File name of the database inside the data directory.
pub const DB_FILE_NAME: &str = "egress.db";

/// High-level database interface for Egress.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Opens the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Opens the database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "egress", "egress")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join(DB_FILE_NAME))
    }

    // === Blocked hosts ===

    /// Blocks a pattern. Returns false if it was already blocked.
    pub fn block_host(&self, pattern: &HostPattern) -> Result<bool> {
        let conn = self.pool.get()?;
        BlockedHostRepo::insert(&conn, pattern.as_str())
    }

    /// Unblocks a pattern. Returns false if it was not blocked.
    pub fn unblock_host(&self, pattern: &HostPattern) -> Result<bool> {
        let conn = self.pool.get()?;
        BlockedHostRepo::delete(&conn, pattern.as_str())
    }

    /// Returns true if the exact pattern is stored.
    pub fn is_stored(&self, pattern: &HostPattern) -> Result<bool> {
        let conn = self.pool.get()?;
        BlockedHostRepo::contains(&conn, pattern.as_str())
    }

    /// Lists every stored row.
    pub fn list_blocked(&self) -> Result<Vec<BlockedHost>> {
        let conn = self.pool.get()?;
        BlockedHostRepo::list(&conn)
    }

    /// Loads every stored pattern.
    ///
    /// Rows that no longer parse are skipped with a warning rather than
    /// failing the whole load.
    pub fn blocked_patterns(&self) -> Result<Vec<HostPattern>> {
        let conn = self.pool.get()?;
        let names = BlockedHostRepo::list_names(&conn)?;

        Ok(names
            .into_iter()
            .filter_map(|name| match HostPattern::parse(&name) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(host_name = %name, error = %e, "Skipping invalid stored pattern");
                    None
                }
            })
            .collect())
    }

    /// Number of stored patterns.
    pub fn blocked_count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        BlockedHostRepo::count(&conn)
    }

    /// Removes every stored pattern.
    pub fn clear_blocked(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        BlockedHostRepo::clear(&conn)
    }

    /// Replaces the stored set atomically.
    pub fn replace_blocked(&self, patterns: &[HostPattern]) -> Result<usize> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        BlockedHostRepo::clear(&tx)?;
        let mut inserted = 0;
        for pattern in patterns {
            if BlockedHostRepo::insert(&tx, pattern.as_str())? {
                inserted += 1;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Current change counter.
    pub fn blacklist_revision(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        BlockedHostRepo::revision(&conn)
    }
}

impl BlacklistStore for Database {
    fn load_all(&self) -> StoreResult<Vec<HostPattern>> {
        Ok(self.blocked_patterns()?)
    }

    fn add(&self, pattern: &HostPattern) -> StoreResult<bool> {
        Ok(self.block_host(pattern)?)
    }

    fn remove(&self, pattern: &HostPattern) -> StoreResult<bool> {
        Ok(self.unblock_host(pattern)?)
    }

    fn revision(&self) -> StoreResult<Option<u64>> {
        let revision = self.blacklist_revision()?;
        Ok(Some(revision.max(0) as u64))
    }
}
