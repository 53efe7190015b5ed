//! Per-connection state machine and backpressure forwarder.
//!
//! A session owns the client socket, the upstream socket once there is one,
//! and four bounded buffers:
//!
//! ```text
//! client ──read──▶ client_in ──▶ upstream_out ──write──▶ upstream
//! client ◀─write── client_out ◀── upstream_in ◀──read─── upstream
//! ```
//!
//! A socket is only read while the buffer it feeds and the buffer after it
//! have room, so a slow consumer throttles a fast producer and occupancy is
//! bounded by the four capacities.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, Bytes};
use egress_core::{
    classify, Classification, ClassifiedRequest, FramingProgress, ResponseCache, ResponseFraming,
    Target,
};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, info, warn};

use crate::buffer::{ByteBuffer, ReadOutcome, WriteOutcome};
use crate::connector::{Resolution, Resolver};
use crate::reactor::Shared;
use crate::readiness::{Ready, Readiness};
use crate::request::{HeaderTooLarge, RequestRelay};
use crate::response;

/// Upper bound on forwarding passes per dispatch before yielding.
pub(crate) const MAX_LOOP_ITERATIONS: usize = 100;

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;

/// Which socket of a session an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Upstream,
}

pub(crate) fn token_for(key: usize, side: Side) -> Token {
    let base = FIRST_SESSION_TOKEN + key * 2;
    match side {
        Side::Client => Token(base),
        Side::Upstream => Token(base + 1),
    }
}

pub(crate) fn session_for(token: Token) -> Option<(usize, Side)> {
    let n = token.0.checked_sub(FIRST_SESSION_TOKEN)?;
    let side = if n % 2 == 0 {
        Side::Client
    } else {
        Side::Upstream
    };
    Some((n / 2, side))
}

/// Lifecycle of a client connection.
///
/// Transitions only move forward; `Closed` is reachable from anywhere and is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequestLine,
    /// Resolving the target and waiting for the outbound connect.
    Connecting,
    TunnelEstablished,
    Forwarding,
    /// Flushing a response the proxy produced itself (a rejection, a failure
    /// or a cache hit). The session closes once it is written.
    Responding,
    Closed,
}

/// What the reactor should do with a session after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionResult {
    Continue,
    /// Ready work remains after the iteration cap.
    Reschedule,
    Close,
}

/// Tear the session down now.
#[derive(Debug)]
struct Teardown;

type Step = Result<bool, Teardown>;

/// Everything a session may touch besides itself.
pub(crate) struct SessionContext<'a> {
    pub registry: &'a Registry,
    pub shared: &'a Shared,
    pub resolver: &'a Resolver,
    pub now: Instant,
}

/// Discards a CONNECT header block through its terminating empty line.
#[derive(Debug, Default)]
struct HeadSkipper {
    line_len: usize,
}

impl HeadSkipper {
    /// Returns how many bytes to drop and whether the block has ended.
    fn skip(&mut self, bytes: &[u8]) -> (usize, bool) {
        for (i, &b) in bytes.iter().enumerate() {
            match b {
                b'\n' if self.line_len == 0 => return (i + 1, true),
                b'\n' => self.line_len = 0,
                b'\r' => {}
                _ => self.line_len += 1,
            }
        }
        (bytes.len(), false)
    }
}

pub(crate) struct Session {
    id: u64,
    key: usize,
    peer: SocketAddr,
    state: SessionState,

    client: TcpStream,
    client_readiness: Readiness,
    client_eof: bool,
    upstream: Option<TcpStream>,
    upstream_readiness: Readiness,
    upstream_eof: bool,

    client_in: ByteBuffer,
    client_out: ByteBuffer,
    upstream_in: ByteBuffer,
    upstream_out: ByteBuffer,

    target: Option<Target>,
    candidates: VecDeque<SocketAddr>,
    resolving: bool,
    connect_deadline: Option<Instant>,
    last_activity: Instant,

    head_skip: Option<HeadSkipper>,
    request: Option<RequestRelay>,
    cache_key: Option<String>,
    framing: Option<ResponseFraming>,
    response_started: bool,
    response_done: bool,
    replay: Option<Bytes>,
    /// Set once a peer has finished: reading stops and the bytes already
    /// buffered toward this side are flushed before closing.
    drain: Option<Side>,
}

impl Session {
    pub fn new(
        id: u64,
        key: usize,
        client: TcpStream,
        peer: SocketAddr,
        buffer_capacity: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            key,
            peer,
            state: SessionState::AwaitingRequestLine,
            client,
            client_readiness: Readiness::new(),
            client_eof: false,
            upstream: None,
            upstream_readiness: Readiness::new(),
            upstream_eof: false,
            client_in: ByteBuffer::new(buffer_capacity),
            client_out: ByteBuffer::new(buffer_capacity),
            upstream_in: ByteBuffer::new(buffer_capacity),
            upstream_out: ByteBuffer::new(buffer_capacity),
            target: None,
            candidates: VecDeque::new(),
            resolving: false,
            connect_deadline: None,
            last_activity: now,
            head_skip: None,
            request: None,
            cache_key: None,
            framing: None,
            response_started: false,
            response_done: false,
            replay: None,
            drain: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Records readiness reported by the poller.
    pub fn on_event(&mut self, side: Side, ready: Ready) {
        if ready.is_error() {
            debug!(session = self.id, ?side, state = ?self.state, "socket reported an error");
        }
        match side {
            Side::Client => self.client_readiness.event |= ready,
            Side::Upstream if self.upstream.is_some() => self.upstream_readiness.event |= ready,
            Side::Upstream => {}
        }
    }

    /// Moves bytes until nothing more can be done without new readiness.
    pub fn run(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult {
        if self.state == SessionState::Closed {
            return SessionResult::Close;
        }

        for _ in 0..MAX_LOOP_ITERATIONS {
            self.update_interest();
            match self.step(ctx) {
                Ok(true) => continue,
                Ok(false) => return SessionResult::Continue,
                Err(Teardown) => return SessionResult::Close,
            }
        }

        debug!(session = self.id, "iteration cap reached, rescheduling");
        SessionResult::Reschedule
    }

    /// Delivers the outcome of a background lookup.
    pub fn on_resolved(
        &mut self,
        result: io::Result<Vec<SocketAddr>>,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult {
        if self.state != SessionState::Connecting || !self.resolving {
            return SessionResult::Continue;
        }
        self.resolving = false;

        let outcome = match result {
            Ok(addrs) if !addrs.is_empty() => {
                self.candidates = addrs.into();
                self.connect_next(ctx)
            }
            Ok(_) => {
                warn!(session = self.id, host = self.host(), "no addresses for host");
                self.fail(ctx.registry, response::service_unavailable())
            }
            Err(e) => {
                warn!(session = self.id, host = self.host(), error = %e, "could not resolve host");
                self.fail(ctx.registry, response::service_unavailable())
            }
        };

        match outcome {
            Ok(()) => self.run(ctx),
            Err(Teardown) => SessionResult::Close,
        }
    }

    /// Enforces the connect and idle deadlines.
    pub fn check_timeouts(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult {
        let now = ctx.now;
        match self.state {
            SessionState::Closed => SessionResult::Close,
            SessionState::Connecting => match self.connect_deadline {
                Some(deadline) if now >= deadline => {
                    warn!(session = self.id, host = self.host(), "upstream connect timed out");
                    match self.fail(ctx.registry, response::gateway_timeout()) {
                        Ok(()) => self.run(ctx),
                        Err(Teardown) => SessionResult::Close,
                    }
                }
                _ => SessionResult::Continue,
            },
            _ => {
                if now.saturating_duration_since(self.last_activity)
                    >= ctx.shared.config.idle_timeout()
                {
                    debug!(session = self.id, state = ?self.state, "idle timeout");
                    SessionResult::Close
                } else {
                    SessionResult::Continue
                }
            }
        }
    }

    /// Deregisters both sockets. Dropping the session closes them.
    pub fn close(&mut self, registry: &Registry) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = registry.deregister(&mut self.client) {
            debug!(session = self.id, error = %e, "client deregister failed");
        }
        self.drop_upstream(registry);
        self.state = SessionState::Closed;
        debug!(session = self.id, peer = %self.peer, "session closed");
    }

    fn host(&self) -> &str {
        self.target.as_ref().map(|t| t.host.as_str()).unwrap_or("-")
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn update_interest(&mut self) {
        use SessionState::*;

        let relaying = matches!(self.state, Forwarding | TunnelEstablished);
        let reading = self.drain.is_none();

        let mut client = Ready::EMPTY;
        let downstream_has_room = match self.state {
            AwaitingRequestLine | Responding => true,
            Connecting | Forwarding | TunnelEstablished => !self.upstream_out.is_full(),
            Closed => false,
        };
        if reading && !self.client_eof && self.client_in.free() > 0 && downstream_has_room {
            client.insert(Ready::READABLE);
        }
        if !self.client_out.is_empty() && self.drain != Some(Side::Upstream) {
            client.insert(Ready::WRITABLE);
        }
        self.client_readiness.interest = client;

        let mut upstream = Ready::EMPTY;
        if relaying
            && reading
            && !self.upstream_eof
            && self.upstream_in.free() > 0
            && !self.client_out.is_full()
        {
            upstream.insert(Ready::READABLE);
        }
        let connecting = self.state == Connecting && self.upstream.is_some();
        let has_output = relaying && !self.upstream_out.is_empty();
        if connecting || (has_output && self.drain != Some(Side::Client)) {
            upstream.insert(Ready::WRITABLE);
        }
        self.upstream_readiness.interest = upstream;
    }

    fn step(&mut self, ctx: &mut SessionContext<'_>) -> Step {
        let mut progress = false;

        if self.state == SessionState::Connecting && self.upstream.is_some() {
            progress |= self.poll_connect(ctx)?;
        }
        progress |= self.read_client(ctx.now)?;
        progress |= self.process_client_input(ctx)?;
        progress |= self.write_upstream(ctx.now)?;
        progress |= self.read_upstream(ctx)?;
        progress |= self.relay_response(&ctx.shared.cache);
        progress |= self.feed_replay();
        progress |= self.write_client(ctx.now)?;

        self.check_finished()?;
        Ok(progress)
    }

    // === Client side ===

    fn read_client(&mut self, now: Instant) -> Step {
        if !self.client_readiness.wants(Ready::READABLE) {
            return Ok(false);
        }

        match self.client_in.fill_from(&mut self.client) {
            ReadOutcome::Bytes(0) => Ok(false),
            ReadOutcome::Bytes(_) => {
                self.touch(now);
                Ok(true)
            }
            ReadOutcome::WouldBlock => {
                self.client_readiness.event.remove(Ready::READABLE);
                Ok(false)
            }
            ReadOutcome::EndOfStream => {
                self.client_eof = true;
                self.client_readiness.event.remove(Ready::READABLE);
                self.on_client_eof()?;
                Ok(true)
            }
            ReadOutcome::Error(kind) => {
                debug!(session = self.id, ?kind, "client read error");
                Err(Teardown)
            }
        }
    }

    fn on_client_eof(&mut self) -> Result<(), Teardown> {
        let request_sent = self.request.as_ref().is_some_and(RequestRelay::is_done);
        match self.state {
            // Half-closed after a complete request: the response is still wanted.
            SessionState::Connecting | SessionState::Forwarding if request_sent => Ok(()),
            SessionState::AwaitingRequestLine | SessionState::Connecting => {
                debug!(session = self.id, "client closed before the exchange started");
                Err(Teardown)
            }
            SessionState::Forwarding | SessionState::TunnelEstablished => {
                if self.drain.is_none() {
                    self.drain = Some(Side::Upstream);
                }
                Ok(())
            }
            SessionState::Responding | SessionState::Closed => Ok(()),
        }
    }

    fn write_client(&mut self, now: Instant) -> Step {
        if !self.client_readiness.wants(Ready::WRITABLE) {
            return Ok(false);
        }

        match self.client_out.write_to(&mut self.client) {
            WriteOutcome::Bytes(0) => Ok(false),
            WriteOutcome::Bytes(_) => {
                self.touch(now);
                Ok(true)
            }
            WriteOutcome::WouldBlock => {
                self.client_readiness.event.remove(Ready::WRITABLE);
                Ok(false)
            }
            WriteOutcome::Error(kind) => {
                debug!(session = self.id, ?kind, "client write error");
                Err(Teardown)
            }
        }
    }

    fn process_client_input(&mut self, ctx: &mut SessionContext<'_>) -> Step {
        match self.state {
            SessionState::AwaitingRequestLine => self.take_request_line(ctx),
            SessionState::Connecting
            | SessionState::Forwarding
            | SessionState::TunnelEstablished => self.relay_request(ctx.registry),
            SessionState::Responding => {
                // Nothing more from the client matters.
                self.client_in.clear();
                Ok(false)
            }
            SessionState::Closed => Ok(false),
        }
    }

    fn take_request_line(&mut self, ctx: &mut SessionContext<'_>) -> Step {
        let buffered = self.client_in.readable();
        let Some(pos) = buffered.iter().position(|&b| b == b'\n') else {
            if self.client_in.is_full() {
                info!(session = self.id, peer = %self.peer, "request line does not fit the buffer");
                self.respond(response::bad_request())?;
                return Ok(true);
            }
            return Ok(false);
        };

        let raw = &buffered[..pos];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = std::str::from_utf8(raw).ok().map(str::to_owned);
        self.client_in.consume(pos + 1);

        let Some(line) = line else {
            info!(session = self.id, peer = %self.peer, "request line is not UTF-8");
            self.respond(response::bad_request())?;
            return Ok(true);
        };

        let snapshot = ctx.shared.blacklist.snapshot();
        match classify(&line, &snapshot) {
            Err(e) => {
                info!(session = self.id, peer = %self.peer, error = %e, "rejecting malformed request");
                self.respond(response::bad_request())?;
            }
            Ok(Classification::Blocked(target)) => {
                ctx.shared.stats.on_request_blocked();
                info!(
                    session = self.id,
                    host = %target.host,
                    port = target.port,
                    tunnel = target.is_tunnel,
                    "request blocked"
                );
                let rejection = if target.is_tunnel {
                    response::blocked_tunnel(&ctx.shared.config.proxy_agent)
                } else {
                    response::blocked_plain()
                };
                self.target = Some(target);
                self.respond(rejection)?;
            }
            Ok(Classification::Allowed(request)) => self.begin(request, ctx)?,
        }
        Ok(true)
    }

    /// Starts serving an allowed request: from cache, or by connecting.
    fn begin(
        &mut self,
        request: ClassifiedRequest,
        ctx: &mut SessionContext<'_>,
    ) -> Result<(), Teardown> {
        let shared = ctx.shared;

        if request.is_tunnel() {
            self.head_skip = Some(HeadSkipper::default());
        } else {
            if let Some(key) = request.cache_key() {
                if let Some(payload) = shared.cache.get(key) {
                    shared.stats.on_cache_hit();
                    debug!(session = self.id, key, bytes = payload.len(), "serving from cache");
                    self.target = Some(request.target);
                    self.replay = Some(payload);
                    self.state = SessionState::Responding;
                    return Ok(());
                }

                shared.stats.on_cache_miss();
                self.cache_key = Some(key.to_owned());
            }

            // A HEAD response declares a length it never sends.
            if !request.method.eq_ignore_ascii_case("HEAD") {
                self.framing = Some(match self.cache_key {
                    Some(_) => ResponseFraming::new(shared.cache.config().max_entry_size)
                        .with_cache_error_responses(shared.config.cache_error_responses),
                    None => ResponseFraming::uncached(),
                });
            }

            let mut line = request.origin_request_line().into_bytes();
            line.extend_from_slice(b"\r\n");
            if line.len() > self.upstream_out.free() {
                return self.respond(response::bad_request());
            }
            self.upstream_out.push(&line);
            self.request = Some(RequestRelay::new());
        }

        let target = request.target;
        info!(
            session = self.id,
            host = %target.host,
            port = target.port,
            tunnel = target.is_tunnel,
            method = %request.method,
            "connecting upstream"
        );

        self.state = SessionState::Connecting;
        self.connect_deadline = Some(ctx.now + shared.config.connect_timeout());
        let resolution = ctx
            .resolver
            .resolve(self.key, self.id, &target.host, target.port);
        self.target = Some(target);

        match resolution {
            Resolution::Ready(addrs) => {
                self.candidates = addrs.into();
                self.connect_next(ctx)
            }
            Resolution::Pending => {
                self.resolving = true;
                Ok(())
            }
        }
    }

    /// Moves request bytes toward upstream.
    ///
    /// A tunnel drops its CONNECT header block and then relays raw bytes. A
    /// plain session relays the one request it was opened for and nothing
    /// after it.
    fn relay_request(&mut self, registry: &Registry) -> Step {
        if let Some(request) = self.request.as_mut() {
            return match request.relay(&mut self.client_in, &mut self.upstream_out) {
                Ok(progress) => Ok(progress),
                Err(HeaderTooLarge) => {
                    info!(
                        session = self.id,
                        host = self.host(),
                        "request header line does not fit the buffer"
                    );
                    self.fail(registry, response::bad_request())?;
                    Ok(true)
                }
            };
        }

        let mut progress = false;
        if let Some(skipper) = self.head_skip.as_mut() {
            let (consumed, done) = skipper.skip(self.client_in.readable());
            self.client_in.consume(consumed);
            progress |= consumed > 0;
            if !done {
                return Ok(progress);
            }
            self.head_skip = None;
        }

        progress |= self.client_in.transfer_into(&mut self.upstream_out, |_| {}) > 0;
        Ok(progress)
    }

    /// Queues a generated response and switches to `Responding`.
    fn respond(&mut self, bytes: Vec<u8>) -> Result<(), Teardown> {
        self.head_skip = None;
        self.request = None;
        self.framing = None;
        self.cache_key = None;
        self.drain = None;
        self.client_in.clear();
        self.client_out.clear();

        if self.client_out.push(&bytes) < bytes.len() {
            warn!(session = self.id, "generated response does not fit the client buffer");
            return Err(Teardown);
        }
        self.state = SessionState::Responding;
        Ok(())
    }

    // === Upstream side ===

    fn connect_next(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), Teardown> {
        while let Some(addr) = self.candidates.pop_front() {
            match ctx.shared.connector.connect(addr) {
                Ok(mut stream) => {
                    let token = token_for(self.key, Side::Upstream);
                    if let Err(e) = ctx.registry.register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(session = self.id, %addr, error = %e, "could not register upstream");
                        continue;
                    }
                    debug!(session = self.id, %addr, "connect started");
                    self.upstream = Some(stream);
                    self.upstream_readiness = Readiness::new();
                    return Ok(());
                }
                Err(e) => {
                    debug!(session = self.id, %addr, error = %e, "connect attempt failed");
                }
            }
        }

        warn!(session = self.id, host = self.host(), "could not connect upstream");
        self.fail(ctx.registry, response::service_unavailable())
    }

    /// Checks whether an in-progress connect has finished.
    fn poll_connect(&mut self, ctx: &mut SessionContext<'_>) -> Step {
        if self.upstream_readiness.event.is_empty() {
            return Ok(false);
        }
        let Some(stream) = self.upstream.as_ref() else {
            return Ok(false);
        };

        let status = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(e) => Err(e),
            },
        };

        match status {
            Ok(true) => {
                self.on_connected(ctx);
                Ok(true)
            }
            Ok(false) => {
                // Spurious wakeup; wait for the next edge.
                self.upstream_readiness.event = Ready::EMPTY;
                Ok(false)
            }
            Err(e) => {
                debug!(session = self.id, host = self.host(), error = %e, "connect failed");
                self.drop_upstream(ctx.registry);
                self.connect_next(ctx)?;
                Ok(true)
            }
        }
    }

    fn on_connected(&mut self, ctx: &mut SessionContext<'_>) {
        self.connect_deadline = None;
        self.candidates.clear();
        self.touch(ctx.now);

        let tunnel = self.target.as_ref().is_some_and(|t| t.is_tunnel);
        if tunnel {
            // client_out is empty while connecting.
            self.client_out
                .push(&response::connection_established(&ctx.shared.config.proxy_agent));
            self.state = SessionState::TunnelEstablished;
        } else {
            self.state = SessionState::Forwarding;
        }
        debug!(session = self.id, host = self.host(), state = ?self.state, "upstream connected");
    }

    fn write_upstream(&mut self, now: Instant) -> Step {
        if !matches!(
            self.state,
            SessionState::Forwarding | SessionState::TunnelEstablished
        ) || !self.upstream_readiness.wants(Ready::WRITABLE)
        {
            return Ok(false);
        }
        let Some(stream) = self.upstream.as_mut() else {
            return Ok(false);
        };

        match self.upstream_out.write_to(stream) {
            WriteOutcome::Bytes(0) => Ok(false),
            WriteOutcome::Bytes(_) => {
                self.touch(now);
                Ok(true)
            }
            WriteOutcome::WouldBlock => {
                self.upstream_readiness.event.remove(Ready::WRITABLE);
                Ok(false)
            }
            WriteOutcome::Error(kind) => {
                debug!(session = self.id, host = self.host(), ?kind, "upstream write error");
                Err(Teardown)
            }
        }
    }

    fn read_upstream(&mut self, ctx: &mut SessionContext<'_>) -> Step {
        if !self.upstream_readiness.wants(Ready::READABLE) {
            return Ok(false);
        }
        let Some(stream) = self.upstream.as_mut() else {
            return Ok(false);
        };

        match self.upstream_in.fill_from(stream) {
            ReadOutcome::Bytes(0) => Ok(false),
            ReadOutcome::Bytes(_) => {
                self.touch(ctx.now);
                Ok(true)
            }
            ReadOutcome::WouldBlock => {
                self.upstream_readiness.event.remove(Ready::READABLE);
                Ok(false)
            }
            ReadOutcome::EndOfStream => {
                self.upstream_eof = true;
                self.upstream_readiness.event.remove(Ready::READABLE);
                self.on_upstream_eof(ctx.registry)?;
                Ok(true)
            }
            ReadOutcome::Error(kind) => {
                if self.awaiting_response() {
                    warn!(session = self.id, host = self.host(), ?kind, "upstream failed before responding");
                    self.fail(ctx.registry, response::bad_gateway())?;
                    return Ok(true);
                }
                debug!(session = self.id, host = self.host(), ?kind, "upstream read error");
                Err(Teardown)
            }
        }
    }

    fn on_upstream_eof(&mut self, registry: &Registry) -> Result<(), Teardown> {
        if self.awaiting_response() {
            warn!(session = self.id, host = self.host(), "upstream closed without responding");
            return self.fail(registry, response::bad_gateway());
        }
        if self.drain.is_none() {
            self.drain = Some(Side::Client);
        }
        Ok(())
    }

    /// True while a plain request has not seen a single response byte.
    fn awaiting_response(&self) -> bool {
        self.state == SessionState::Forwarding
            && !self.response_started
            && self.upstream_in.is_empty()
            && !self.client_eof
    }

    /// Moves response bytes toward the client, feeding the framer on the way.
    fn relay_response(&mut self, cache: &ResponseCache) -> bool {
        if !matches!(
            self.state,
            SessionState::Forwarding | SessionState::TunnelEstablished
        ) {
            return false;
        }

        let framing = &mut self.framing;
        let mut completed = false;
        let moved = self.upstream_in.transfer_into(&mut self.client_out, |chunk| {
            if let Some(framing) = framing.as_mut() {
                if framing.observe(chunk) == FramingProgress::Complete {
                    completed = true;
                }
            }
        });
        if moved == 0 {
            return false;
        }

        self.response_started = true;
        if completed && !self.response_done {
            self.response_done = true;
            self.store_response(cache);
        }
        true
    }

    fn store_response(&mut self, cache: &ResponseCache) {
        let (Some(framing), Some(key)) = (self.framing.as_mut(), self.cache_key.take()) else {
            return;
        };

        match framing.take_cacheable() {
            Some(payload) => {
                let bytes = payload.len();
                if cache.put(key.as_str(), payload) {
                    debug!(session = self.id, key = %key, bytes, "response cached");
                }
            }
            None => {
                debug!(
                    session = self.id,
                    key = %key,
                    status = ?framing.status(),
                    "response not cacheable"
                );
            }
        }
    }

    fn feed_replay(&mut self) -> bool {
        let Some(payload) = self.replay.as_mut() else {
            return false;
        };
        let n = self.client_out.push(&payload[..]);
        payload.advance(n);
        if payload.is_empty() {
            self.replay = None;
        }
        n > 0
    }

    /// Gives up on upstream and tells the client, if it is still listening.
    fn fail(&mut self, registry: &Registry, bytes: Vec<u8>) -> Result<(), Teardown> {
        self.drop_upstream(registry);
        self.candidates.clear();
        self.resolving = false;
        self.connect_deadline = None;

        if self.client_eof {
            return Err(Teardown);
        }
        self.respond(bytes)
    }

    fn drop_upstream(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.upstream.take() {
            if let Err(e) = registry.deregister(&mut stream) {
                debug!(session = self.id, error = %e, "upstream deregister failed");
            }
        }
        self.upstream_readiness.reset();
        self.upstream_eof = false;
    }

    /// Ends the session once a response or a drain has been flushed.
    fn check_finished(&self) -> Result<(), Teardown> {
        let finished = match (self.state, self.drain) {
            (SessionState::Responding, _) => self.replay.is_none() && self.client_out.is_empty(),
            // The one response this session serves has been relayed.
            (SessionState::Forwarding, None) if self.response_done => {
                self.upstream_in.is_empty() && self.client_out.is_empty()
            }
            (_, Some(Side::Client)) => self.upstream_in.is_empty() && self.client_out.is_empty(),
            (_, Some(Side::Upstream)) => {
                (self.client_in.is_empty() || self.head_skip.is_some())
                    && self.upstream_out.is_empty()
            }
            _ => false,
        };

        if finished {
            Err(Teardown)
        } else {
            Ok(())
        }
    }
}

/// Best-effort text of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair(capacity: usize) -> (Session, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let session = Session::new(
            1,
            0,
            TcpStream::from_std(accepted),
            addr,
            capacity,
            Instant::now(),
        );
        (session, peer)
    }

    #[test]
    fn tokens_round_trip() {
        for key in [0, 1, 17, 4096] {
            assert_eq!(session_for(token_for(key, Side::Client)), Some((key, Side::Client)));
            assert_eq!(
                session_for(token_for(key, Side::Upstream)),
                Some((key, Side::Upstream))
            );
        }
        assert_eq!(session_for(LISTENER), None);
        assert_eq!(session_for(WAKER), None);
    }

    #[test]
    fn head_skipper_stops_at_blank_line() {
        let mut skipper = HeadSkipper::default();
        let input = b"Host: a.com:443\r\nUser-Agent: x\r\n\r\nTLS";
        let (consumed, done) = skipper.skip(input);
        assert!(done);
        assert_eq!(&input[consumed..], b"TLS");
    }

    #[test]
    fn head_skipper_handles_split_input_and_no_headers() {
        let mut skipper = HeadSkipper::default();
        assert_eq!(skipper.skip(b"Host: a\r"), (8, false));
        assert_eq!(skipper.skip(b"\n\r"), (2, false));
        assert_eq!(skipper.skip(b"\ndata"), (1, true));

        let mut immediate = HeadSkipper::default();
        assert_eq!(immediate.skip(b"\r\n"), (2, true));
    }

    #[test]
    fn client_reads_pause_when_upstream_buffer_is_full() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::Forwarding;

        session.update_interest();
        assert!(session.client_readiness.interest.is_readable());

        session.upstream_out.push(&[0u8; 512]);
        session.update_interest();
        assert!(!session.client_readiness.interest.is_readable());
        assert!(session.upstream_readiness.interest.is_writable());

        session.upstream_out.consume(1);
        session.update_interest();
        assert!(session.client_readiness.interest.is_readable());
    }

    #[test]
    fn upstream_reads_pause_when_client_buffer_is_full() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::TunnelEstablished;

        session.update_interest();
        assert!(session.upstream_readiness.interest.is_readable());

        session.client_out.push(&[0u8; 512]);
        session.update_interest();
        assert!(!session.upstream_readiness.interest.is_readable());
        assert!(session.client_readiness.interest.is_writable());
    }

    #[test]
    fn draining_stops_all_reads() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::Forwarding;
        session.drain = Some(Side::Client);
        session.upstream_in.push(b"tail");

        session.update_interest();
        assert!(!session.client_readiness.interest.is_readable());
        assert!(!session.upstream_readiness.interest.is_readable());
        assert!(session.check_finished().is_ok());

        session.upstream_in.clear();
        assert!(session.check_finished().is_err());
    }

    #[test]
    fn plain_session_ends_after_its_response() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::Forwarding;
        session.framing = Some(ResponseFraming::uncached());
        session.upstream_in.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let cache = ResponseCache::new(Default::default());
        assert!(session.relay_response(&cache));
        assert!(session.response_done);
        assert!(session.check_finished().is_ok());

        session.client_out.clear();
        assert!(session.check_finished().is_err());
    }

    #[test]
    fn half_close_after_request_waits_for_response() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::Forwarding;
        let mut request = RequestRelay::new();
        let mut head = ByteBuffer::new(64);
        head.push(b"Host: a.com\r\n\r\n");
        request.relay(&mut head, &mut session.upstream_out).unwrap();
        session.request = Some(request);

        session.client_eof = true;
        assert!(session.on_client_eof().is_ok());
        assert_eq!(session.drain, None);
        assert!(session.check_finished().is_ok());
    }

    #[test]
    fn respond_replaces_pending_input() {
        let (mut session, _peer) = session_pair(512);
        session.client_in.push(b"GET http://x/ HTTP/1.1\r\n");

        session.respond(response::bad_request()).unwrap();
        assert_eq!(session.state(), SessionState::Responding);
        assert!(session.client_in.is_empty());
        assert!(session.client_out.readable().starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn replay_feeds_client_buffer_in_pieces() {
        let (mut session, _peer) = session_pair(512);
        session.state = SessionState::Responding;
        session.replay = Some(Bytes::from(vec![7u8; 1200]));

        assert!(session.feed_replay());
        assert_eq!(session.client_out.len(), 512);
        assert!(!session.feed_replay());

        session.client_out.clear();
        assert!(session.feed_replay());
        session.client_out.clear();
        assert!(session.feed_replay());
        assert!(session.replay.is_none());
        assert_eq!(session.client_out.len(), 1200 - 1024);
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
    }
}
