//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        if current_version < 2 {
            migrate_v2(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: blocked hosts.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: blocked_hosts");

    // host_name holds a normalised pattern: "example.com" or "*.example.com".
    conn.execute(
        "CREATE TABLE IF NOT EXISTS blocked_hosts (
            host_name TEXT PRIMARY KEY NOT NULL,
            added_on TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    Ok(())
}

/// Migration to version 2: change counter for cheap polling.
fn migrate_v2(conn: &Connection) -> Result<()> {
    info!("Applying migration v2: blacklist_revision");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS blacklist_revision (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            revision INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO blacklist_revision (id, revision) VALUES (1, 0)",
        [],
    )?;

    // Triggers catch writers that bypass this crate, such as the sqlite3 shell.
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS blocked_hosts_insert_rev
            AFTER INSERT ON blocked_hosts
         BEGIN
            UPDATE blacklist_revision SET revision = revision + 1 WHERE id = 1;
         END;

         CREATE TRIGGER IF NOT EXISTS blocked_hosts_delete_rev
            AFTER DELETE ON blocked_hosts
         BEGIN
            UPDATE blacklist_revision SET revision = revision + 1 WHERE id = 1;
         END;

         CREATE TRIGGER IF NOT EXISTS blocked_hosts_update_rev
            AFTER UPDATE ON blocked_hosts
         BEGIN
            UPDATE blacklist_revision SET revision = revision + 1 WHERE id = 1;
         END;",
    )?;

    Ok(())
}
