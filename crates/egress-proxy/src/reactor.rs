//! The single-threaded event loop.
//!
//! One [`mio::Poll`] watches the listener, a waker and both sockets of every
//! session. Sessions live in a slab; a socket's token encodes the slab key
//! and the side (see [`session::token_for`]). Each session also carries a
//! unique id so results addressed to a slot that has since been reused are
//! dropped.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use egress_core::{Blacklist, ResponseCache, StatsSink};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use slab::Slab;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connector::{Connector, Resolved, Resolver};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::readiness::Ready;
use crate::session::{
    self, panic_message, Session, SessionContext, SessionResult, Side, LISTENER, WAKER,
};

const EVENTS_CAPACITY: usize = 1024;

/// State shared by every session on the reactor.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub blacklist: Arc<Blacklist>,
    pub cache: Arc<ResponseCache>,
    pub stats: Arc<dyn StatsSink>,
    pub connector: Arc<dyn Connector>,
    pub events: EventBus,
}

/// The event loop. Build one with [`crate::ProxyServer::bind`] and drive it
/// with [`Reactor::run`] on a dedicated thread.
pub struct Reactor {
    poll: Poll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    sessions: Slab<Session>,
    shared: Shared,
    resolver: Resolver,
    resolved: UnboundedReceiver<Resolved>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    reschedule: VecDeque<(usize, u64)>,
    next_session_id: u64,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.sessions.len())
            .field("accepting", &self.listener.is_some())
            .finish()
    }
}

impl Reactor {
    pub(crate) fn new(shared: Shared, runtime: Handle) -> Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(shared.config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (resolver, resolved) = Resolver::new(runtime, Arc::clone(&waker));

        Ok(Self {
            poll,
            listener: Some(listener),
            local_addr,
            sessions: Slab::new(),
            shared,
            resolver,
            resolved,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            reschedule: VecDeque::new(),
            next_session_id: 1,
        })
    }

    /// Returns a handle that can stop this reactor from another thread.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            addr: self.local_addr,
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs until shutdown is requested and in-flight sessions have finished
    /// or the grace period has passed.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let tick = self.shared.config.tick_interval();
        let grace = self.shared.config.shutdown_grace();
        let mut next_tick = Instant::now() + tick;
        let mut shutdown_deadline: Option<Instant> = None;

        info!(addr = %self.local_addr, "proxy listening");
        self.shared.events.publish(EngineEvent::Started {
            addr: self.local_addr,
        });

        loop {
            let now = Instant::now();
            if shutdown_deadline.is_none() && self.shutdown.load(Ordering::Acquire) {
                shutdown_deadline = Some(now + grace);
                self.stop_accepting();
            }
            if let Some(deadline) = shutdown_deadline {
                if self.sessions.is_empty() {
                    break;
                }
                if now >= deadline {
                    warn!(
                        sessions = self.sessions.len(),
                        "shutdown grace period over, closing remaining sessions"
                    );
                    break;
                }
            }

            let timeout = if self.reschedule.is_empty() {
                let wake_at = shutdown_deadline.map_or(next_tick, |d| d.min(next_tick));
                wake_at.saturating_duration_since(now)
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                self.close_all();
                self.shared.events.publish(EngineEvent::Stopped);
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => {
                        if let Some((key, side)) = session::session_for(token) {
                            self.dispatch(key, side, Ready::from(event));
                        }
                    }
                }
            }

            self.drain_resolved();
            self.run_rescheduled();

            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                next_tick = now + tick;
            }
        }

        self.close_all();
        info!("proxy stopped");
        self.shared.events.publish(EngineEvent::Stopped);
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.sessions.len() >= self.shared.config.max_sessions {
                        warn!(%peer, limit = self.shared.config.max_sessions, "session limit reached, dropping connection");
                        continue;
                    }

                    let entry = self.sessions.vacant_entry();
                    let key = entry.key();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        session::token_for(key, Side::Client),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%peer, error = %e, "could not register client");
                        continue;
                    }

                    let id = self.next_session_id;
                    self.next_session_id += 1;
                    entry.insert(Session::new(
                        id,
                        key,
                        stream,
                        peer,
                        self.shared.config.buffer_capacity,
                        Instant::now(),
                    ));
                    self.shared.stats.on_connection_opened();
                    debug!(session = id, %peer, "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, key: usize, side: Side, ready: Ready) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.on_event(side, ready);
        self.drive(key, |session, ctx| session.run(ctx));
    }

    /// Runs `f` against one session, isolating panics to that session.
    fn drive<F>(&mut self, key: usize, f: F)
    where
        F: FnOnce(&mut Session, &mut SessionContext<'_>) -> SessionResult,
    {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let id = session.id();
        let mut ctx = SessionContext {
            registry: self.poll.registry(),
            shared: &self.shared,
            resolver: &self.resolver,
            now: Instant::now(),
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(session, &mut ctx))) {
            Ok(result) => result,
            Err(payload) => {
                error!(session = id, panic = %panic_message(&*payload), "session panicked, closing it");
                SessionResult::Close
            }
        };

        match result {
            SessionResult::Continue => {}
            SessionResult::Reschedule => self.reschedule.push_back((key, id)),
            SessionResult::Close => self.close_session(key),
        }
    }

    fn close_session(&mut self, key: usize) {
        let Some(mut session) = self.sessions.try_remove(key) else {
            return;
        };
        debug!(session = session.id(), state = ?session.state(), "closing session");
        session.close(self.poll.registry());
        self.shared.stats.on_connection_closed();
    }

    fn is_current(&self, key: usize, id: u64) -> bool {
        self.sessions.get(key).is_some_and(|s| s.id() == id)
    }

    fn drain_resolved(&mut self) {
        while let Ok(resolved) = self.resolved.try_recv() {
            if !self.is_current(resolved.key, resolved.session_id) {
                debug!(session = resolved.session_id, "dropping lookup for a closed session");
                continue;
            }
            let result = resolved.result;
            self.drive(resolved.key, move |session, ctx| session.on_resolved(result, ctx));
        }
    }

    fn run_rescheduled(&mut self) {
        let pending = std::mem::take(&mut self.reschedule);
        for (key, id) in pending {
            if self.is_current(key, id) {
                self.drive(key, |session, ctx| session.run(ctx));
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        let expired = self.shared.cache.sweep_expired(now);
        if expired > 0 {
            debug!(expired, "swept cache");
        }

        let keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.drive(key, |session, ctx| session.check_timeouts(ctx));
        }

        self.shared.events.publish(EngineEvent::Heartbeat {
            stats: self.shared.stats.report(),
            active_sessions: self.sessions.len(),
            cache_entries: self.shared.cache.len(),
        });
    }

    fn stop_accepting(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!(error = %e, "listener deregister failed");
            }
        }
        info!(sessions = self.sessions.len(), "shutting down, no longer accepting");
        self.shared.events.publish(EngineEvent::ShuttingDown {
            active_sessions: self.sessions.len(),
        });
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        for mut session in self.sessions.drain() {
            session.close(registry);
            self.shared.stats.on_connection_closed();
        }
        self.reschedule.clear();
    }
}

/// Cloneable remote control for a running [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Asks the reactor to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The address the reactor's listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
