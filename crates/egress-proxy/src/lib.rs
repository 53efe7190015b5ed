//! Egress Proxy - non-blocking forward proxy engine.
//!
//! A single reactor thread multiplexes every client and upstream socket with
//! `mio`. Each client connection is a [`SessionState`] machine that reads one
//! request line, gates it against the live blacklist, and then either answers
//! itself (rejection, cached response, failure) or relays bytes between the
//! client and the origin through four bounded buffers.
//!
//! ## Architecture
//!
//! ```text
//! Client ──▶ Reactor ──▶ Session ──▶ classify ──▶ Blocked? ──yes──▶ 403
//!                                                   │ no
//!                                                   ▼
//!                                       GET cached? ──yes──▶ replay
//!                                                   │ no
//!                                                   ▼
//!                                    resolve + connect upstream
//!                                                   │
//!                                  ┌────────────────┴───────────────┐
//!                                  │ CONNECT                        │ plain
//!                                  ▼                                ▼
//!                        200 Connection Established       forward one request,
//!                        raw bidirectional relay          frame + cache response
//! ```
//!
//! Name lookups run on a tokio runtime and report back through a
//! [`mio::Waker`]. The [`BlacklistController`] keeps the live blacklist in
//! step with a [`egress_core::BlacklistStore`].

mod buffer;
mod config;
mod connector;
mod control;
mod error;
mod events;
mod reactor;
mod readiness;
mod request;
pub mod response;
mod server;
mod session;

pub use buffer::{ByteBuffer, ReadOutcome, WriteOutcome};
pub use config::{EngineConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_SESSIONS, MIN_BUFFER_CAPACITY};
pub use connector::{Connector, TcpConnector};
pub use control::{BlacklistController, DEFAULT_POLL_INTERVAL};
pub use error::{ProxyError, Result};
pub use events::{EngineEvent, EventBus, DEFAULT_EVENT_CAPACITY};
pub use reactor::{Reactor, ReactorHandle};
pub use readiness::{Ready, Readiness};
pub use server::{ProxyHandle, ProxyServer};
pub use session::SessionState;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8888);
    }
}
