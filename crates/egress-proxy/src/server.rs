//! Proxy server front: wires shared state into a reactor and runs it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use egress_core::{Blacklist, BlacklistSnapshot, ProxyStats, ResponseCache, StatsSink};
use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::connector::{Connector, TcpConnector};
use crate::error::{ProxyError, Result};
use crate::events::EventBus;
use crate::reactor::{Reactor, ReactorHandle, Shared};
use crate::session::panic_message;

/// Forward proxy server.
///
/// The blacklist, cache, stats sink and event bus are shared handles; keep
/// clones of them to update or observe the running server.
pub struct ProxyServer {
    config: EngineConfig,
    blacklist: Arc<Blacklist>,
    cache: Arc<ResponseCache>,
    stats: Arc<dyn StatsSink>,
    connector: Arc<dyn Connector>,
    events: EventBus,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("blacklist", &self.blacklist.len())
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

impl ProxyServer {
    /// Creates a server with an empty blacklist and a fresh cache.
    pub fn new(config: EngineConfig) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        Self {
            config,
            blacklist: Arc::new(Blacklist::new(BlacklistSnapshot::new())),
            cache,
            stats: Arc::new(ProxyStats::new()),
            connector: Arc::new(TcpConnector),
            events: EventBus::default(),
        }
    }

    /// Uses a shared blacklist, typically one a controller keeps current.
    pub fn with_blacklist(mut self, blacklist: Arc<Blacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// Replaces how outbound sockets are opened.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Binds the listener and builds the reactor without running it.
    ///
    /// `runtime` runs background name lookups.
    pub fn bind(self, runtime: Handle) -> Result<Reactor> {
        self.config.validate()?;

        let shared = Shared {
            config: self.config,
            blacklist: self.blacklist,
            cache: self.cache,
            stats: self.stats,
            connector: self.connector,
            events: self.events,
        };
        Reactor::new(shared, runtime)
    }

    /// Binds and runs the reactor on its own thread.
    pub fn start(self, runtime: Handle) -> Result<ProxyHandle> {
        let reactor = self.bind(runtime)?;
        let handle = reactor.handle();
        let addr = reactor.local_addr();

        let thread = std::thread::Builder::new()
            .name("egress-reactor".into())
            .spawn(move || reactor.run())?;

        Ok(ProxyHandle {
            addr,
            reactor: handle,
            thread,
        })
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    addr: SocketAddr,
    reactor: ReactorHandle,
    thread: JoinHandle<Result<()>>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A cloneable handle that can request shutdown from anywhere.
    pub fn reactor_handle(&self) -> ReactorHandle {
        self.reactor.clone()
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
    }

    /// Blocks until the reactor thread exits.
    pub fn wait(self) -> Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(payload) => Err(ProxyError::Reactor(format!(
                "reactor thread panicked: {}",
                panic_message(&*payload)
            ))),
        }
    }

    /// Shuts down the proxy and waits for it to finish.
    pub fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig::new()
            .with_port(0)
            .with_tick_interval(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let reactor = ProxyServer::new(test_config())
            .bind(rt.handle().clone())
            .unwrap();
        assert_ne!(reactor.local_addr().port(), 0);
        assert_eq!(reactor.session_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = ProxyServer::new(test_config().with_buffer_capacity(16)).bind(rt.handle().clone());
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn start_and_stop() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = ProxyServer::new(test_config());
        let events = server.events().clone();
        let mut rx = events.subscribe();

        let handle = server.start(rt.handle().clone()).unwrap();
        assert_eq!(handle.reactor_handle().addr(), handle.addr());
        handle.stop().unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(crate::EngineEvent::Started { .. })));
        assert!(matches!(seen.last(), Some(crate::EngineEvent::Stopped)));
    }
}
