//! TLS termination.
//!
//! Ciphertext arrives from below as payload contexts and is fed into a
//! sans-IO rustls session. Records the session produces go back down one
//! context per chunk; decrypted bytes go up. The chain above learns about the
//! connection (`init`) only once the handshake has completed.
//!
//! Connection states: a fresh line waits for its ClientHello in an
//! [`Acceptor`], switches to a [`ServerConnection`] while handshaking, and is
//! established once `init` has been delivered upstream. Any TLS failure frees
//! the state and sends `fin` to every direction that knows about the line.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chainwall_config::TlsServerSettings;
use chainwall_core::{
    Buffer, BufferPool, Context, DEFAULT_TLS_PLAINTEXT_CHUNK, ERROR_TLS_HANDSHAKE,
    ERROR_TLS_RECORD, IoHandle, Line, Links, Tunnel, Worker,
};
use rustls::ServerConnection;
use rustls::server::{Accepted, Acceptor};
use tracing::{debug, error, trace, warn};

use crate::error::TunnelError;
use crate::tls::load_tls_config;

/// Per-tunnel handshake counters.
#[derive(Debug, Default)]
pub struct TlsStats {
    handshakes: AtomicU64,
    failures: AtomicU64,
}

impl TlsStats {
    pub fn handshakes(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Connections torn down because of a TLS error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

enum Session {
    Accepting(Acceptor),
    Connected(Box<ServerConnection>),
}

struct TlsConn {
    session: Session,
    handshake_completed: bool,
    init_sent: bool,
    first_sent: bool,
    started: Instant,
}

/// What one batch of inbound ciphertext produced.
struct Fed {
    /// Ciphertext to send down, in production order.
    records: Vec<Buffer>,
    plaintext: Option<Buffer>,
    event: Event,
}

enum Event {
    /// All input was absorbed.
    Drained,
    /// The handshake just finished. Remaining input waits until the chain
    /// above has seen `init`.
    Completed,
    /// The peer sent close_notify.
    PeerClosed,
    Failed(TunnelError),
}

enum Teardown {
    Failed(TunnelError),
    PeerClosed,
}

pub struct TlsServerTunnel {
    links: Links,
    config: Arc<rustls::ServerConfig>,
    alpn: Vec<Vec<u8>>,
    stats: TlsStats,
}

impl TlsServerTunnel {
    pub fn new(settings: &TlsServerSettings) -> Result<Arc<Self>, TunnelError> {
        let config = load_tls_config(settings)?;
        Ok(Self::with_config(config, &settings.alpn))
    }

    /// Build from a ready server configuration. `alpn` lists the protocols
    /// this node prefers, most preferred first.
    pub fn with_config(mut config: rustls::ServerConfig, alpn: &[String]) -> Arc<Self> {
        config.alpn_protocols.clear();
        Arc::new(Self {
            links: Links::new(),
            config: Arc::new(config),
            alpn: alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
            stats: TlsStats::default(),
        })
    }

    pub fn stats(&self) -> &TlsStats {
        &self.stats
    }

    /// Pick the protocol for one connection.
    ///
    /// With a configured list the first of our protocols the client offers
    /// wins; without one the client's first offer is accepted.
    fn choose_alpn(&self, offered: &[&[u8]]) -> Option<Vec<u8>> {
        if self.alpn.is_empty() {
            return offered.first().map(|p| p.to_vec());
        }
        self.alpn
            .iter()
            .find(|ours| offered.contains(&ours.as_slice()))
            .cloned()
    }

    fn connection_config(&self, accepted: &Accepted) -> Arc<rustls::ServerConfig> {
        let hello = accepted.client_hello();
        let offered: Vec<&[u8]> = hello.alpn().map(|it| it.collect()).unwrap_or_default();
        match self.choose_alpn(&offered) {
            Some(protocol) => {
                let mut config = (*self.config).clone();
                config.alpn_protocols = vec![protocol];
                Arc::new(config)
            }
            None => self.config.clone(),
        }
    }

    fn on_init(&self, ctx: Context) {
        let line = ctx.line().clone();
        drop(ctx);
        line.install(
            self.chain_index(),
            TlsConn {
                session: Session::Accepting(Acceptor::default()),
                handshake_completed: false,
                init_sent: false,
                first_sent: false,
                started: Instant::now(),
            },
        );
        trace!(line = line.id(), "waiting for ClientHello");
    }

    fn on_ciphertext(&self, ctx: Context, worker: &Worker) {
        let index = self.chain_index();
        let (line, payload, src_io) = ctx.into_parts();
        let Some(mut input) = payload else {
            return;
        };

        loop {
            let Some(fed) =
                line.with_state(index, |c: &mut TlsConn| c.feed(&mut input, self, worker.pool()))
            else {
                trace!(line = line.id(), len = input.len(), "ciphertext for a closed session discarded");
                return;
            };

            let Fed {
                records,
                plaintext,
                event,
            } = fed;

            match event {
                Event::Failed(e) => {
                    drop(plaintext);
                    self.teardown(&line, records, Teardown::Failed(e), worker);
                    return;
                }
                Event::Completed => {
                    if !self.send_down(&line, records, &src_io, worker) {
                        return;
                    }
                    self.on_handshake_completed(&line, &src_io, worker);
                    if line.with_state(index, |c: &mut TlsConn| c.init_sent = true).is_none() {
                        return;
                    }
                    // The rest of the input may already hold application data.
                }
                Event::Drained | Event::PeerClosed => {
                    if !self.send_down(&line, records, &src_io, worker) {
                        return;
                    }
                    if let Some(plain) = plaintext {
                        let Some(first) = line.with_state(index, |c: &mut TlsConn| {
                            !std::mem::replace(&mut c.first_sent, true)
                        }) else {
                            return;
                        };
                        let up = Context::payload(&line, plain)
                            .with_first(first)
                            .with_src_io(src_io.clone());
                        self.forward_up(up, worker);
                    }

                    // Tickets and key updates produced while reading.
                    let Some(records) = line.with_state(index, |c: &mut TlsConn| {
                        c.drain_records(worker.pool())
                    }) else {
                        return;
                    };
                    if !self.send_down(&line, records, &src_io, worker) {
                        return;
                    }

                    if matches!(event, Event::PeerClosed) {
                        let records = line
                            .with_state(index, |c: &mut TlsConn| c.close_notify(worker.pool()))
                            .unwrap_or_default();
                        self.teardown(&line, records, Teardown::PeerClosed, worker);
                    }
                    return;
                }
            }
        }
    }

    fn on_handshake_completed(&self, line: &Line, src_io: &Option<IoHandle>, worker: &Worker) {
        let index = self.chain_index();
        let details = line.with_state(index, |c: &mut TlsConn| {
            let alpn = match &c.session {
                Session::Connected(conn) => conn
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned()),
                Session::Accepting(_) => None,
            };
            (alpn, c.started.elapsed())
        });
        if let Some((alpn, elapsed)) = details {
            self.stats.handshakes.fetch_add(1, Ordering::Relaxed);
            chainwall_metrics::record_tls_handshake(elapsed.as_secs_f64());
            debug!(line = line.id(), alpn = ?alpn, elapsed_ms = elapsed.as_millis() as u64, "TLS handshake completed");
        }
        self.forward_up(Context::init(line).with_src_io(src_io.clone()), worker);
    }

    /// Send records down one context each, stopping as soon as the session
    /// is gone. Returns whether the session is still alive.
    fn send_down(
        &self,
        line: &Line,
        records: Vec<Buffer>,
        src_io: &Option<IoHandle>,
        worker: &Worker,
    ) -> bool {
        let index = self.chain_index();
        for record in records {
            if !line.is_alive(index) {
                return false;
            }
            let ctx = Context::payload(line, record).with_src_io(src_io.clone());
            self.forward_down(ctx, worker);
        }
        line.is_alive(index)
    }

    /// Free the session, flush `records` (alerts, close_notify) and send `fin`
    /// to every direction that knows about the line.
    fn teardown(&self, line: &Line, records: Vec<Buffer>, cause: Teardown, worker: &Worker) {
        let Some(state) = line.free_state::<TlsConn>(self.chain_index()) else {
            return;
        };
        match cause {
            Teardown::Failed(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                if state.handshake_completed {
                    warn!(line = line.id(), error = %e, "TLS record error");
                    chainwall_metrics::record_error(ERROR_TLS_RECORD);
                } else {
                    debug!(line = line.id(), error = %e, "TLS handshake failed");
                    chainwall_metrics::record_tls_handshake_failed();
                    chainwall_metrics::record_error(ERROR_TLS_HANDSHAKE);
                }
            }
            Teardown::PeerClosed => debug!(line = line.id(), "peer sent close_notify"),
        }

        for record in records {
            self.forward_down(Context::payload(line, record), worker);
        }
        if state.init_sent {
            self.forward_up(Context::fin(line), worker);
        }
        self.forward_down(Context::fin(line), worker);
    }

    fn on_plaintext(&self, ctx: Context, worker: &Worker) {
        let index = self.chain_index();
        let (line, payload, src_io) = ctx.into_parts();
        let Some(plain) = payload else {
            return;
        };
        let Some(completed) = line.with_state(index, |c: &mut TlsConn| c.handshake_completed)
        else {
            trace!(line = line.id(), len = plain.len(), "payload for a closed session discarded");
            return;
        };
        if !completed {
            error!(line = line.id(), "payload from upstream before the TLS handshake completed");
            panic!("TlsServer: payload from upstream before the handshake completed");
        }

        let sealed = line.with_state(index, |c: &mut TlsConn| c.seal(&plain, worker.pool()));
        drop(plain);
        match sealed {
            None => {}
            Some(Ok(records)) => {
                self.send_down(&line, records, &src_io, worker);
            }
            Some(Err((e, records))) => {
                self.teardown(&line, records, Teardown::Failed(e), worker);
            }
        }
    }

    fn on_fin_from_below(&self, ctx: Context, worker: &Worker) {
        let line = ctx.line().clone();
        match line.free_state::<TlsConn>(self.chain_index()) {
            Some(state) if state.init_sent => {
                trace!(line = line.id(), "transport closed");
                self.forward_up(ctx, worker);
            }
            Some(_) => {
                debug!(line = line.id(), "transport closed during handshake");
                drop(ctx);
                line.close();
            }
            None => {
                drop(ctx);
                line.close();
            }
        }
    }

    fn on_fin_from_above(&self, ctx: Context, worker: &Worker) {
        let line = ctx.line().clone();
        if let Some(mut state) = line.free_state::<TlsConn>(self.chain_index()) {
            trace!(line = line.id(), "closed by chain");
            for record in state.close_notify(worker.pool()) {
                self.forward_down(Context::payload(&line, record), worker);
            }
        }
        self.forward_down(ctx, worker);
    }
}

impl TlsConn {
    /// Absorb inbound ciphertext until it is used up, the handshake completes
    /// or the session fails.
    fn feed(&mut self, input: &mut Buffer, tunnel: &TlsServerTunnel, pool: &BufferPool) -> Fed {
        let mut records = Vec::new();
        let mut plaintext = None;
        let mut event = Event::Drained;

        loop {
            if self.handshake_completed
                && let Session::Connected(conn) = &mut self.session
            {
                match read_plaintext(conn, &mut plaintext, pool) {
                    Ok(true) => {}
                    Ok(false) => {
                        event = Event::PeerClosed;
                        break;
                    }
                    Err(e) => {
                        event = Event::Failed(e.into());
                        break;
                    }
                }
            }
            if input.is_empty() {
                break;
            }

            let before = input.len();
            match self.advance(input, tunnel, pool, &mut records) {
                Ok(true) => {
                    event = Event::Completed;
                    break;
                }
                Ok(false) if input.len() == before => {
                    event = Event::Failed(TunnelError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("TLS session stopped taking input with {before} bytes pending"),
                    )));
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    event = Event::Failed(e);
                    break;
                }
            }
        }

        records.extend(self.drain_records(pool));
        Fed {
            records,
            plaintext,
            event,
        }
    }

    /// One read/process step. Returns `true` when this step finished the
    /// handshake.
    fn advance(
        &mut self,
        input: &mut Buffer,
        tunnel: &TlsServerTunnel,
        pool: &BufferPool,
        records: &mut Vec<Buffer>,
    ) -> Result<bool, TunnelError> {
        let accepted = match &mut self.session {
            Session::Accepting(acceptor) => {
                let n = acceptor.read_tls(&mut &input[..])?;
                input.consume(n);
                match acceptor.accept() {
                    Ok(None) => return Ok(false),
                    Ok(Some(accepted)) => accepted,
                    Err((e, mut alert)) => {
                        let mut buf = pool.get();
                        if alert.write_all(&mut buf).is_ok() && !buf.is_empty() {
                            records.push(buf);
                        }
                        return Err(e.into());
                    }
                }
            }
            Session::Connected(conn) => {
                let n = conn.read_tls(&mut &input[..])?;
                input.consume(n);
                let processed = conn.process_new_packets();
                drain_tls(conn, pool, records);
                processed?;
                let done = !conn.is_handshaking();
                return Ok(done && !std::mem::replace(&mut self.handshake_completed, true));
            }
        };

        let config = tunnel.connection_config(&accepted);
        let mut conn = accepted.into_connection(config).map_err(|(e, mut alert)| {
            let mut buf = pool.get();
            if alert.write_all(&mut buf).is_ok() && !buf.is_empty() {
                records.push(buf);
            }
            TunnelError::from(e)
        })?;
        conn.set_buffer_limit(None);
        let processed = conn.process_new_packets();
        drain_tls(&mut conn, pool, records);
        self.session = Session::Connected(Box::new(conn));
        processed?;
        Ok(false)
    }

    fn drain_records(&mut self, pool: &BufferPool) -> Vec<Buffer> {
        let mut records = Vec::new();
        if let Session::Connected(conn) = &mut self.session {
            drain_tls(conn, pool, &mut records);
        }
        records
    }

    /// Encrypt application bytes. On failure returns whatever the session
    /// produced (usually an alert) along with the error.
    fn seal(
        &mut self,
        plain: &[u8],
        pool: &BufferPool,
    ) -> Result<Vec<Buffer>, (TunnelError, Vec<Buffer>)> {
        let Session::Connected(conn) = &mut self.session else {
            return Err((
                TunnelError::Io(io::Error::other("session not connected")),
                Vec::new(),
            ));
        };
        let written = conn.writer().write_all(plain);
        let mut records = Vec::new();
        drain_tls(conn, pool, &mut records);
        match written {
            Ok(()) => Ok(records),
            Err(e) => Err((e.into(), records)),
        }
    }

    fn close_notify(&mut self, pool: &BufferPool) -> Vec<Buffer> {
        let mut records = Vec::new();
        if let Session::Connected(conn) = &mut self.session {
            conn.send_close_notify();
            drain_tls(conn, pool, &mut records);
        }
        records
    }
}

/// Move every pending outbound record into pooled buffers, one per chunk.
fn drain_tls(conn: &mut ServerConnection, pool: &BufferPool, records: &mut Vec<Buffer>) {
    while conn.wants_write() {
        let mut buf = pool.get();
        match conn.write_tls(&mut buf) {
            Ok(n) if n > 0 => records.push(buf),
            _ => break,
        }
    }
}

/// Append decrypted bytes to `out`, allocating it on first use.
///
/// Returns `Ok(false)` once the peer has sent close_notify.
fn read_plaintext(
    conn: &mut ServerConnection,
    out: &mut Option<Buffer>,
    pool: &BufferPool,
) -> io::Result<bool> {
    let open = loop {
        let buf = out.get_or_insert_with(|| pool.get());
        if buf.remaining_capacity() == 0 {
            buf.reserve(DEFAULT_TLS_PLAINTEXT_CHUNK);
        }
        let len = buf.len();
        let room = buf.remaining_capacity();
        buf.bytes_mut().resize(len + room, 0);
        match conn.reader().read(&mut buf[len..]) {
            Ok(0) => {
                buf.truncate(len);
                break false;
            }
            Ok(n) => buf.truncate(len + n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                buf.truncate(len);
                break true;
            }
            Err(e) => {
                buf.truncate(len);
                return Err(e);
            }
        }
    };
    if out.as_ref().is_some_and(|b| b.is_empty()) {
        *out = None;
    }
    Ok(open)
}

impl Tunnel for TlsServerTunnel {
    fn kind(&self) -> &'static str {
        "TlsServer"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn upstream(&self, ctx: Context, worker: &Worker) {
        if ctx.payload_ref().is_some() {
            self.on_ciphertext(ctx, worker);
        } else if ctx.is_init() {
            self.on_init(ctx);
        } else if ctx.is_fin() {
            self.on_fin_from_below(ctx, worker);
        } else {
            self.forward_up(ctx, worker);
        }
    }

    fn downstream(&self, ctx: Context, worker: &Worker) {
        if ctx.payload_ref().is_some() {
            self.on_plaintext(ctx, worker);
        } else if ctx.is_fin() {
            self.on_fin_from_above(ctx, worker);
        } else if ctx.is_established() {
            self.forward_down(ctx, worker);
        } else {
            error!(line = ctx.line().id(), "init travelling downstream into a TLS server; discarded");
        }
    }
}
