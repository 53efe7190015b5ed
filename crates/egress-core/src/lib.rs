//! Egress Core - blacklist gate, request classification and response caching.
//!
//! This crate holds everything the proxy engine decides without touching a
//! socket:
//!
//! - [`blacklist`]: host patterns and the copy-on-write snapshot the engine
//!   consults on every request
//! - [`classifier`]: first-line parsing into a target and cache key
//! - [`framing`]: incremental detection of where an upstream response ends
//! - [`cache`]: the TTL-bounded response cache
//! - [`store`] and [`transfer`]: blacklist persistence seam and file format
//! - [`stats`]: the statistics sink the engine reports to

pub mod blacklist;
pub mod cache;
pub mod classifier;
pub mod error;
pub mod framing;
pub mod stats;
pub mod store;
pub mod transfer;

pub use blacklist::{normalize_host, Blacklist, BlacklistSnapshot, HostPattern};
pub use cache::{CacheConfig, ResponseCache, DEFAULT_MAX_ENTRY_SIZE, DEFAULT_TTL_SECS};
pub use classifier::{
    classify, parse_request_line, Classification, ClassifiedRequest, Target,
    DEFAULT_HTTP_PORT, DEFAULT_TUNNEL_PORT,
};
pub use error::{ClassifyError, PatternError, StoreError, TransferError};
pub use framing::{BodyLength, FramingProgress, ResponseFraming, MAX_HEADER_SIZE};
pub use stats::{NoopStats, ProxyStats, StatsSink, StatsSnapshot};
pub use store::{BlacklistStore, MemoryStore, StoreResult};
pub use transfer::ImportSummary;
