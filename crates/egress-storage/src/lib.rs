//! Egress Storage - SQLite persistence for the blacklist.
//!
//! Blocked host patterns live in a `blocked_hosts` table. Every write bumps a
//! revision counter so a running proxy can poll cheaply for changes made by
//! the CLI or any other writer.
//!
//! # Example
//!
//! ```no_run
//! use egress_core::{BlacklistStore, HostPattern};
//! use egress_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.block_host(&HostPattern::parse("*.ads.example").unwrap()).unwrap();
//!
//! let snapshot = db.load_snapshot().unwrap();
//! assert!(snapshot.is_blocked("cdn.ads.example"));
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, DB_FILE_NAME};
pub use error::{Result, StorageError};
pub use models::BlockedHost;
pub use pool::ConnectionPool;
pub use repository::BlockedHostRepo;
pub use schema::SCHEMA_VERSION;
