//! Edge ingress: owns accepted TCP sockets and applies write backpressure.
//!
//! Every accepted socket becomes a line. The listener reads into pooled
//! buffers and pushes payloads upstream, and writes downstream payloads back
//! to the socket. When the socket cannot take a whole payload, the remainder
//! becomes the pending write, further payloads are queued, and the transports
//! that produced them stop reading until the queue drains.
//!
//! Socket I/O runs in tasks spawned with [`tokio::task::spawn_local`], so
//! connections must be handed to the listener from inside a
//! [`tokio::task::LocalSet`].

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chainwall_config::TcpListenerSettings;
use chainwall_core::{
    Context, DISCONNECT_SENTINEL_LEN, ERROR_IO, InboundHandler, IoHandle, Line, LineStage, Links,
    SocketFilter, Tunnel, Worker,
};
use ipnet::IpNet;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, error, trace};

use crate::error::TunnelError;

/// Per-listener counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    closed: AtomicU64,
    write_pauses: AtomicU64,
    queued: AtomicU64,
}

impl ListenerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Short writes that paused the connection's write side.
    pub fn write_pauses(&self) -> u64 {
        self.write_pauses.load(Ordering::Relaxed)
    }

    /// Payloads that had to wait behind a paused write.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
}

struct ConnState {
    stream: Rc<TcpStream>,
    io: IoHandle,
    /// Partially written payload.
    pending: Option<Context>,
    queue: VecDeque<Context>,
    write_paused: bool,
    /// The chain closed the line while writes were paused; release once the
    /// queue drains.
    closing: bool,
    established: bool,
    first_sent: bool,
    opened: Instant,
}

enum Written {
    /// The whole payload reached the socket; carries the payload's origin.
    All(Option<IoHandle>),
    /// The socket took part of it, or nothing.
    Partial(Context),
    Failed(io::Error),
}

pub struct TcpListenerTunnel {
    links: Links,
    filter: SocketFilter,
    disconnect_sentinel: bool,
    stats: ListenerStats,
    this: Weak<TcpListenerTunnel>,
}

impl TcpListenerTunnel {
    pub fn new(settings: &TcpListenerSettings) -> Result<Arc<Self>, TunnelError> {
        let address: IpAddr = settings.address.parse().map_err(|_| {
            TunnelError::Config(format!("TcpListener: invalid address '{}'", settings.address))
        })?;
        let (port_min, port_max) = settings
            .port
            .bounds()
            .ok_or_else(|| TunnelError::Config("TcpListener: invalid port".into()))?;
        let mut filter = SocketFilter::tcp(address, port_min, port_max);
        filter.whitelist = parse_networks(&settings.whitelist)?;
        filter.blacklist = parse_networks(&settings.blacklist)?;
        filter.nodelay = settings.nodelay;
        Ok(Self::with_filter(filter, settings.disconnect_sentinel))
    }

    pub fn with_filter(filter: SocketFilter, disconnect_sentinel: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            links: Links::new(),
            filter,
            disconnect_sentinel,
            stats: ListenerStats::default(),
            this: this.clone(),
        })
    }

    /// Sockets this listener wants to be handed.
    pub fn filter(&self) -> &SocketFilter {
        &self.filter
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    fn write_down(&self, ctx: Context, worker: &Worker) {
        let index = self.chain_index();
        let line = ctx.line().clone();
        let Some((paused, closing, stream)) = line.with_state(index, |s: &mut ConnState| {
            (s.write_paused, s.closing, s.stream.clone())
        }) else {
            trace!(line = line.id(), "payload for a closed connection discarded");
            return;
        };
        if closing {
            trace!(line = line.id(), "payload after fin discarded");
            return;
        }

        if paused {
            if let Some(io) = ctx.src_io() {
                io.pause_read();
            }
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
            chainwall_metrics::record_write_queued();
            line.with_state(index, move |s: &mut ConnState| s.queue.push_back(ctx));
            return;
        }

        match write_some(&stream, ctx) {
            Written::All(_) => {}
            Written::Partial(ctx) => self.pause_writes(&line, ctx, stream, worker),
            Written::Failed(e) => self.close_from_below(&line, worker, Some(e)),
        }
    }

    fn pause_writes(&self, line: &Line, ctx: Context, stream: Rc<TcpStream>, worker: &Worker) {
        if let Some(io) = ctx.src_io() {
            io.pause_read();
        }
        self.stats.write_pauses.fetch_add(1, Ordering::Relaxed);
        chainwall_metrics::record_write_paused();
        trace!(line = line.id(), remaining = ctx.payload_len(), "write paused");

        let io = line.with_state(self.chain_index(), move |s: &mut ConnState| {
            s.pending = Some(ctx);
            s.write_paused = true;
            s.io.clone()
        });
        if let (Some(io), Some(this)) = (io, self.this.upgrade()) {
            tokio::task::spawn_local(flush_when_writable(
                this,
                line.clone(),
                stream,
                io,
                worker.clone(),
            ));
        }
    }

    /// Finish the pending write, then drain the queue in order.
    ///
    /// Returns `true` while the connection is still waiting for the socket.
    fn on_write_ready(&self, line: &Line, stream: &TcpStream, worker: &Worker) -> bool {
        let index = self.chain_index();
        loop {
            let next = line.with_state(index, |s: &mut ConnState| {
                s.pending.take().or_else(|| s.queue.pop_front())
            });
            let ctx = match next {
                None => return false,
                Some(None) => {
                    let closing = line
                        .with_state(index, |s: &mut ConnState| {
                            s.write_paused = false;
                            s.closing
                        })
                        .unwrap_or(false);
                    if closing {
                        if let Some(state) = line.free_state::<ConnState>(index) {
                            debug!(line = line.id(), "queued writes flushed; closing");
                            self.release(state);
                        }
                    } else {
                        trace!(line = line.id(), "write resumed");
                    }
                    return false;
                }
                Some(Some(ctx)) => ctx,
            };
            match write_some(stream, ctx) {
                Written::All(origin) => {
                    if let Some(io) = origin {
                        io.resume_read();
                    }
                }
                Written::Partial(ctx) => {
                    if let Some(io) = ctx.src_io() {
                        io.pause_read();
                    }
                    line.with_state(index, move |s: &mut ConnState| s.pending = Some(ctx));
                    return true;
                }
                Written::Failed(e) => {
                    self.close_from_below(line, worker, Some(e));
                    return false;
                }
            }
        }
    }

    /// Peer close, transport error or write failure: tear down and tell the
    /// chain, at most once per connection.
    fn close_from_below(&self, line: &Line, worker: &Worker, err: Option<io::Error>) {
        let Some(state) = line.free_state::<ConnState>(self.chain_index()) else {
            return;
        };
        match err {
            Some(e) => {
                debug!(line = line.id(), error = %e, "connection error");
                chainwall_metrics::record_error(ERROR_IO);
            }
            None => debug!(line = line.id(), "peer closed"),
        }
        let notify = !state.closing;
        self.release(state);
        // A chain that already sent fin down has torn its side down.
        if notify {
            self.upstream(Context::fin(line), worker);
        }
    }

    fn release(&self, state: ConnState) {
        // Half-close so unread input does not turn the close into a reset.
        let _ = SockRef::from(&*state.stream).shutdown(Shutdown::Write);
        state.io.close();
        trace!(
            established = state.established,
            queued = state.queue.len(),
            "connection released"
        );
        // Transports stalled behind this connection's writes must not stay paused.
        for ctx in state.pending.iter().chain(state.queue.iter()) {
            if let Some(io) = ctx.src_io() {
                io.resume_read();
            }
        }
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        chainwall_metrics::record_connection_closed(state.opened.elapsed().as_secs_f64());
    }
}

fn parse_networks(nets: &[String]) -> Result<Vec<IpNet>, TunnelError> {
    nets.iter()
        .map(|n| {
            n.parse()
                .map_err(|_| TunnelError::Config(format!("TcpListener: invalid network '{n}'")))
        })
        .collect()
}

fn write_some(stream: &TcpStream, mut ctx: Context) -> Written {
    let origin = ctx.src_io().cloned();
    let outcome = match ctx.payload_mut() {
        None => Ok(true),
        Some(buf) => match stream.try_write(&buf[..]) {
            Ok(n) => {
                let complete = n == buf.len();
                buf.consume(n);
                chainwall_metrics::record_bytes_sent(n as u64);
                Ok(complete)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        },
    };
    match outcome {
        Ok(true) => Written::All(origin),
        Ok(false) => Written::Partial(ctx),
        Err(e) => Written::Failed(e),
    }
}

async fn read_loop(
    this: Arc<TcpListenerTunnel>,
    line: Line,
    stream: Rc<TcpStream>,
    io: IoHandle,
    worker: Worker,
) {
    let index = this.chain_index();
    loop {
        if io.is_closed() || !line.is_alive(index) {
            break;
        }
        if io.is_read_paused() {
            io.changed().await;
            continue;
        }
        tokio::select! {
            _ = io.changed() => continue,
            ready = stream.readable() => {
                if let Err(e) = ready {
                    this.close_from_below(&line, &worker, Some(e));
                    break;
                }
            }
        }
        // Nothing goes upstream once the chain has sent fin.
        if line.with_state(index, |s: &mut ConnState| s.closing) != Some(false) {
            break;
        }

        let mut buf = worker.pool().get();
        match stream.try_read_buf(buf.bytes_mut()) {
            Ok(0) => {
                drop(buf);
                this.close_from_below(&line, &worker, None);
                break;
            }
            Ok(n) if this.disconnect_sentinel && n == DISCONNECT_SENTINEL_LEN => {
                drop(buf);
                debug!(line = line.id(), "disconnect sentinel received");
                this.close_from_below(&line, &worker, None);
                break;
            }
            Ok(n) => {
                chainwall_metrics::record_bytes_received(n as u64);
                let Some(first) = line.with_state(index, |s: &mut ConnState| {
                    !std::mem::replace(&mut s.first_sent, true)
                }) else {
                    break;
                };
                let ctx = Context::payload(&line, buf)
                    .with_first(first)
                    .with_src_io(Some(io.clone()));
                this.upstream(ctx, &worker);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                this.close_from_below(&line, &worker, Some(e));
                break;
            }
        }
    }
    trace!(line = line.id(), "read task finished");
}

async fn flush_when_writable(
    this: Arc<TcpListenerTunnel>,
    line: Line,
    stream: Rc<TcpStream>,
    io: IoHandle,
    worker: Worker,
) {
    loop {
        tokio::select! {
            _ = io.closed() => return,
            ready = stream.writable() => {
                if let Err(e) = ready {
                    this.close_from_below(&line, &worker, Some(e));
                    return;
                }
            }
        }
        if !this.on_write_ready(&line, &stream, &worker) {
            return;
        }
    }
}

impl Tunnel for TcpListenerTunnel {
    fn kind(&self) -> &'static str {
        "TcpListener"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn upstream(&self, ctx: Context, worker: &Worker) {
        self.forward_up(ctx, worker);
    }

    fn downstream(&self, ctx: Context, worker: &Worker) {
        if ctx.payload_ref().is_some() {
            self.write_down(ctx, worker);
            return;
        }

        let index = self.chain_index();
        let line = ctx.line().clone();
        if ctx.is_established() {
            line.with_state(index, |s: &mut ConnState| s.established = true);
            line.advance(LineStage::Established);
        } else if ctx.is_fin() {
            drop(ctx);
            line.close();
            let flushing = line.with_state(index, |s: &mut ConnState| {
                s.closing = true;
                s.write_paused
            });
            match flushing {
                Some(true) => debug!(line = line.id(), "closed by chain; flushing queued writes"),
                Some(false) => {
                    if let Some(state) = line.free_state::<ConnState>(index) {
                        debug!(line = line.id(), "closed by chain");
                        self.release(state);
                    }
                }
                None => {}
            }
        } else {
            error!(line = line.id(), "init travelling downstream into a listener; discarded");
        }
    }
}

impl InboundHandler for TcpListenerTunnel {
    fn on_inbound_connected(&self, stream: TcpStream, peer: SocketAddr, worker: &Worker) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Err(e) = stream.set_nodelay(self.filter.nodelay) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let index = self.chain_index();
        let line = worker.new_line(self.links.line_slots());
        let io = worker.new_io();
        let stream = Rc::new(stream);
        debug!(line = line.id(), %peer, worker = worker.id(), "accepted");

        line.install(
            index,
            ConnState {
                stream: stream.clone(),
                io: io.clone(),
                pending: None,
                queue: VecDeque::new(),
                write_paused: false,
                closing: false,
                established: false,
                first_sent: false,
                opened: Instant::now(),
            },
        );
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        chainwall_metrics::record_connection_accepted();

        tokio::task::spawn_local(read_loop(
            this,
            line.clone(),
            stream,
            io.clone(),
            worker.clone(),
        ));
        self.upstream(Context::init(&line).with_src_io(Some(io)), worker);
    }
}
