//! Upstream name resolution and connection setup.
//!
//! Resolution runs as a task on the tokio runtime so the reactor thread never
//! blocks on DNS. Results come back over a channel and the reactor is woken
//! through its [`mio::Waker`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Waker;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Opens outbound sockets.
pub trait Connector: Send + Sync {
    /// Starts a non-blocking connect to `addr`.
    ///
    /// Completion is reported by the socket becoming writable.
    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "could not set TCP_NODELAY");
        }
        Ok(stream)
    }
}

/// Result of a background lookup, addressed to one session.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub key: usize,
    pub session_id: u64,
    pub result: io::Result<Vec<SocketAddr>>,
}

/// What [`Resolver::resolve`] could do immediately.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The host was an IP literal.
    Ready(Vec<SocketAddr>),
    /// A lookup task was spawned; a [`Resolved`] will follow.
    Pending,
}

/// Hands lookups to the runtime and wakes the reactor with the results.
pub(crate) struct Resolver {
    runtime: Handle,
    tx: UnboundedSender<Resolved>,
    waker: Arc<Waker>,
}

impl Resolver {
    pub fn new(runtime: Handle, waker: Arc<Waker>) -> (Self, UnboundedReceiver<Resolved>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                runtime,
                tx,
                waker,
            },
            rx,
        )
    }

    pub fn resolve(&self, key: usize, session_id: u64, host: &str, port: u16) -> Resolution {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Resolution::Ready(vec![SocketAddr::new(ip, port)]);
        }

        let host = host.to_owned();
        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);

        self.runtime.spawn(async move {
            let result = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>());

            if let Err(e) = &result {
                tracing::debug!(session = session_id, host = %host, error = %e, "lookup failed");
            }

            // The reactor may already be gone during shutdown.
            if tx
                .send(Resolved {
                    key,
                    session_id,
                    result,
                })
                .is_ok()
            {
                if let Err(e) = waker.wake() {
                    tracing::warn!(error = %e, "failed to wake reactor after lookup");
                }
            }
        });

        Resolution::Pending
    }
}
