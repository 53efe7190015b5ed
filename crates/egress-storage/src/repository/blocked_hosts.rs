//! Blocked hosts repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::BlockedHost;

/// Repository for `blocked_hosts`.
///
/// Callers pass normalised pattern text; validation happens in
/// [`egress_core::HostPattern`] before anything reaches this layer.
pub struct BlockedHostRepo;

impl BlockedHostRepo {
    /// Inserts a pattern. Returns false if it already existed.
    pub fn insert(conn: &Connection, host_name: &str) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT INTO blocked_hosts (host_name) VALUES (?1)
             ON CONFLICT(host_name) DO NOTHING",
            params![host_name],
        )?;
        Ok(inserted > 0)
    }

    /// Deletes a pattern. Returns false if it was not present.
    pub fn delete(conn: &Connection, host_name: &str) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM blocked_hosts WHERE host_name = ?1",
            params![host_name],
        )?;
        Ok(deleted > 0)
    }

    /// Returns true if the exact pattern is stored.
    pub fn contains(conn: &Connection, host_name: &str) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM blocked_hosts WHERE host_name = ?1",
                params![host_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Lists every row, ordered by pattern.
    pub fn list(conn: &Connection) -> Result<Vec<BlockedHost>> {
        let mut stmt =
            conn.prepare("SELECT host_name, added_on FROM blocked_hosts ORDER BY host_name")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(BlockedHost {
                    host_name: row.get(0)?,
                    added_on: parse_datetime(&row.get::<_, String>(1)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Lists pattern text only.
    pub fn list_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT host_name FROM blocked_hosts ORDER BY host_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Number of stored patterns.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM blocked_hosts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Deletes every pattern. Returns how many were removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM blocked_hosts", [])?)
    }

    /// Current change counter, bumped by triggers on every write.
    pub fn revision(conn: &Connection) -> Result<i64> {
        let revision = conn.query_row(
            "SELECT revision FROM blacklist_revision WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(revision)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
