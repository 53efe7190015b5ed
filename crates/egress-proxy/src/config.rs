//! Engine configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use egress_core::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::DEFAULT_PROXY_PORT;

/// Default capacity of each of the four per-session buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Smallest buffer that still holds a realistic request line and every
/// response the proxy generates itself.
pub const MIN_BUFFER_CAPACITY: usize = 512;

/// Default upper bound on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Tunables for the proxy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,
    /// Capacity of each session buffer, in bytes.
    pub buffer_capacity: usize,
    /// How long resolution plus connect may take.
    pub connect_timeout_ms: u64,
    /// Sessions without I/O progress for this long are closed.
    pub idle_timeout_ms: u64,
    /// Period of the reactor's bookkeeping tick.
    pub tick_interval_ms: u64,
    /// How long in-flight sessions may drain after shutdown is requested.
    pub shutdown_grace_ms: u64,
    /// Accepted connections beyond this count are closed immediately.
    pub max_sessions: usize,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Cache responses with status 400 and above.
    pub cache_error_responses: bool,
    /// Value of the `Proxy-agent` header on tunnel responses.
    pub proxy_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            tick_interval_ms: 2_000,
            shutdown_grace_ms: 5_000,
            max_sessions: DEFAULT_MAX_SESSIONS,
            cache: CacheConfig::default(),
            cache_error_responses: false,
            proxy_agent: format!("egress/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Sets the port, keeping the bind IP.
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    /// Sets the per-buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = duration_ms(grace);
        self
    }

    /// Sets the session limit.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Allows caching of error responses.
    pub fn with_cache_error_responses(mut self, enabled: bool) -> Self {
        self.cache_error_responses = enabled;
        self
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Tick interval as a duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Shutdown grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Checks that the configuration can drive an engine.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(ProxyError::Config(format!(
                "buffer_capacity must be at least {MIN_BUFFER_CAPACITY} bytes, got {}",
                self.buffer_capacity
            )));
        }

        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ProxyError::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.max_sessions == 0 {
            return Err(ProxyError::Config("max_sessions must be greater than zero".into()));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ProxyError::Config("cache ttl must be greater than zero".into()));
        }

        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.listen_addr.port(), 8888);
        assert!(config.listen_addr.ip().is_loopback());
        assert_eq!(config.buffer_capacity, 8192);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.cache.ttl_secs, 500);
        assert_eq!(config.cache.max_entry_size, 1024 * 1024);
        assert!(!config.cache_error_responses);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = EngineConfig::new()
            .with_port(9999)
            .with_buffer_capacity(4096)
            .with_connect_timeout(Duration::from_millis(250))
            .with_max_sessions(3);

        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.buffer_capacity, 4096);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.max_sessions, 3);
    }

    #[test]
    fn validate_rejects_tiny_buffers() {
        let config = EngineConfig::new().with_buffer_capacity(16);
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let config = EngineConfig::new().with_idle_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = EngineConfig::new().with_tick_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"buffer_capacity": 1024, "cache": {"ttl_secs": 60}}"#)
                .unwrap();
        assert_eq!(config.buffer_capacity, 1024);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entry_size, 1024 * 1024);
        assert_eq!(config.idle_timeout_ms, 30_000);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"listen_addr": "127.0.0.1:3128"}"#).unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.listen_addr.port(), 3128);
    }
}
