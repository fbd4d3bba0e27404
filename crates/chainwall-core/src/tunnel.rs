//! The chain contract.
//!
//! A chain is an ordered list of tunnels. Contexts travel **upstream** (from
//! the network edge toward the application end, `up`) and **downstream**
//! (back toward the edge, `dw`). Handing a context to a direct neighbor
//! through its entry points is the only way to transfer it.
//!
//! ```text
//!   edge                                              application
//!   TcpListener ──up──▶ TlsServer ──up──▶ Logger ──up──▶ (end of chain)
//!               ◀──dw──           ◀──dw──
//! ```
//!
//! Tunnels are shared by every connection and every worker, so they are
//! `Send + Sync` and immutable once chained. Per-connection state lives in the
//! [`Line`](crate::Line) slot addressed by the tunnel's chain index.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::net::TcpStream;
use tracing::trace;

use crate::context::{Context, Kind};
use crate::errors::ChainError;
use crate::line::LineStage;
use crate::worker::Worker;

/// Result of a management message sent to a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResult {
    NotImplemented,
    Ok(String),
    Error(String),
}

/// Position and neighbors of a tunnel, written once while chaining.
#[derive(Default)]
pub struct Links {
    index: OnceLock<usize>,
    up: OnceLock<Arc<dyn Tunnel>>,
    dw: OnceLock<Weak<dyn Tunnel>>,
    line_slots: AtomicUsize,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain index, 0 for a tunnel that was never chained.
    pub fn index(&self) -> usize {
        self.index.get().copied().unwrap_or(0)
    }

    pub fn is_chained(&self) -> bool {
        self.index.get().is_some()
    }

    pub fn up(&self) -> Option<Arc<dyn Tunnel>> {
        self.up.get().cloned()
    }

    pub fn dw(&self) -> Option<Arc<dyn Tunnel>> {
        self.dw.get().and_then(Weak::upgrade)
    }

    /// Slot count for lines opened by this tunnel: every index a line can
    /// reach, so installing state never grows the table.
    pub fn line_slots(&self) -> usize {
        self.line_slots.load(Ordering::Relaxed).max(self.index() + 1)
    }

    fn widen_line_slots(&self, slots: usize) {
        self.line_slots.fetch_max(slots, Ordering::Relaxed);
    }

    fn set_index(&self, index: usize, kind: &'static str) -> Result<(), ChainError> {
        self.index
            .set(index)
            .map_err(|_| ChainError::AlreadyLinked(kind))
    }

    fn set_up(&self, up: Arc<dyn Tunnel>, kind: &'static str) -> Result<(), ChainError> {
        self.up.set(up).map_err(|_| ChainError::AlreadyLinked(kind))
    }

    fn set_dw(&self, dw: Weak<dyn Tunnel>, kind: &'static str) -> Result<(), ChainError> {
        self.dw.set(dw).map_err(|_| ChainError::AlreadyLinked(kind))
    }
}

/// A node in a chain.
pub trait Tunnel: Send + Sync {
    /// Node type name, as used in configuration files.
    fn kind(&self) -> &'static str;

    fn links(&self) -> &Links;

    /// Receive a context travelling toward the application end.
    fn upstream(&self, ctx: Context, worker: &Worker);

    /// Receive a context travelling toward the network edge.
    fn downstream(&self, ctx: Context, worker: &Worker);

    /// Datagram-like payloads that bypass stream reassembly.
    fn packet_upstream(&self, ctx: Context, worker: &Worker) {
        self.upstream(ctx, worker);
    }

    fn packet_downstream(&self, ctx: Context, worker: &Worker) {
        self.downstream(ctx, worker);
    }

    /// Management message entry point.
    fn api(&self, _msg: &str) -> ApiResult {
        ApiResult::NotImplemented
    }

    /// Release node-level resources when the chain is torn down.
    fn destroy(&self) {}

    fn chain_index(&self) -> usize {
        self.links().index()
    }

    fn up(&self) -> Option<Arc<dyn Tunnel>> {
        self.links().up()
    }

    fn dw(&self) -> Option<Arc<dyn Tunnel>> {
        self.links().dw()
    }

    /// Hand `ctx` to the upstream neighbor, or apply the end-of-chain policy.
    fn forward_up(&self, ctx: Context, worker: &Worker) {
        match self.up() {
            Some(up) => up.upstream(ctx, worker),
            None => terminate_upstream(self, ctx, worker),
        }
    }

    /// Hand `ctx` to the downstream neighbor, or apply the end-of-chain policy.
    fn forward_down(&self, ctx: Context, worker: &Worker) {
        match self.dw() {
            Some(dw) => dw.downstream(ctx, worker),
            None => terminate_downstream(self, ctx, worker),
        }
    }
}

/// A tunnel that takes ownership of accepted sockets.
pub trait InboundHandler: Send + Sync {
    /// Called on the worker the socket was assigned to.
    fn on_inbound_connected(&self, stream: TcpStream, peer: SocketAddr, worker: &Worker);
}

/// End-of-chain policy for a context leaving `tunnel` upward with nobody above.
///
/// `init` is acknowledged with a synthetic `established` sent back down, `fin`
/// ends its journey and marks the line closing, payload is discarded.
pub fn terminate_upstream<T: Tunnel + ?Sized>(tunnel: &T, ctx: Context, worker: &Worker) {
    let line = ctx.line().clone();
    match ctx.kind() {
        Kind::Init => {
            let reply = Context::established(&line);
            match tunnel.dw() {
                Some(dw) => dw.downstream(reply, worker),
                None => tunnel.downstream(reply, worker),
            }
        }
        Kind::Fin => {
            line.close();
        }
        Kind::Payload(buf) => {
            trace!(line = line.id(), tunnel = tunnel.kind(), len = buf.len(), "payload discarded at chain top");
        }
        Kind::Established => {}
    }
}

/// End-of-chain policy for a context leaving `tunnel` downward with nobody below.
pub fn terminate_downstream<T: Tunnel + ?Sized>(tunnel: &T, ctx: Context, worker: &Worker) {
    let line = ctx.line().clone();
    match ctx.kind() {
        Kind::Init => {
            let reply = Context::established(&line);
            match tunnel.up() {
                Some(up) => up.upstream(reply, worker),
                None => tunnel.upstream(reply, worker),
            }
        }
        Kind::Established => line.advance(LineStage::Established),
        Kind::Fin => line.close(),
        Kind::Payload(buf) => {
            trace!(line = line.id(), tunnel = tunnel.kind(), len = buf.len(), "payload discarded at chain bottom");
        }
    }
}

/// Links tunnels in order and assigns chain indices starting at a base.
///
/// Index bases let several independently built chains share one line state
/// table without collisions.
pub struct ChainBuilder {
    base: usize,
    tunnels: Vec<Arc<dyn Tunnel>>,
}

impl ChainBuilder {
    pub fn new(base_index: usize) -> Self {
        Self {
            base: base_index,
            tunnels: Vec::new(),
        }
    }

    /// Append `tunnel` above the current top of the chain.
    pub fn push(mut self, tunnel: Arc<dyn Tunnel>) -> Result<Self, ChainError> {
        let kind = tunnel.kind();
        let index = self.base + self.tunnels.len();
        tunnel.links().set_index(index, kind)?;
        if let Some(prev) = self.tunnels.last() {
            prev.links().set_up(tunnel.clone(), prev.kind())?;
            tunnel.links().set_dw(Arc::downgrade(prev), kind)?;
        }
        self.tunnels.push(tunnel);
        Ok(self)
    }

    pub fn build(self) -> Result<Chain, ChainError> {
        if self.tunnels.is_empty() {
            return Err(ChainError::Empty);
        }
        let chain = Chain {
            base: self.base,
            tunnels: self.tunnels,
        };
        chain.widen_line_slots(chain.end_index());
        Ok(chain)
    }
}

/// An ordered, linked set of tunnels.
pub struct Chain {
    base: usize,
    tunnels: Vec<Arc<dyn Tunnel>>,
}

impl Chain {
    /// The edge-facing tunnel.
    pub fn head(&self) -> &Arc<dyn Tunnel> {
        &self.tunnels[0]
    }

    /// The application-facing tunnel.
    pub fn tail(&self) -> &Arc<dyn Tunnel> {
        &self.tunnels[self.tunnels.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// First chain index not used by this chain.
    pub fn end_index(&self) -> usize {
        self.base + self.tunnels.len()
    }

    pub fn tunnels(&self) -> impl Iterator<Item = &Arc<dyn Tunnel>> {
        self.tunnels.iter()
    }

    /// Let lines opened by this chain hold `slots` states. Chains that hand
    /// lines to other chains need the width of the whole index space.
    pub fn widen_line_slots(&self, slots: usize) {
        for tunnel in &self.tunnels {
            tunnel.links().widen_line_slots(slots);
        }
    }

    /// Run every tunnel's destroy hook, application end first.
    pub fn destroy(&self) {
        for tunnel in self.tunnels.iter().rev() {
            tunnel.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records what reaches it and forwards everything.
    #[derive(Default)]
    struct Tap {
        links: Links,
        seen: Mutex<Vec<String>>,
    }

    impl Tap {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    fn describe(direction: &str, ctx: &Context) -> String {
        let what = match ctx.kind() {
            Kind::Init => "init".to_string(),
            Kind::Established => "est".to_string(),
            Kind::Fin => "fin".to_string(),
            Kind::Payload(buf) => String::from_utf8_lossy(buf).into_owned(),
        };
        format!("{direction}:{what}")
    }

    impl Tunnel for Tap {
        fn kind(&self) -> &'static str {
            "Tap"
        }

        fn links(&self) -> &Links {
            &self.links
        }

        fn upstream(&self, ctx: Context, worker: &Worker) {
            self.seen.lock().push(describe("up", &ctx));
            self.forward_up(ctx, worker);
        }

        fn downstream(&self, ctx: Context, worker: &Worker) {
            self.seen.lock().push(describe("dw", &ctx));
            self.forward_down(ctx, worker);
        }
    }

    fn chain_of(n: usize, base: usize) -> (Chain, Vec<Arc<Tap>>) {
        let taps: Vec<Arc<Tap>> = (0..n).map(|_| Arc::new(Tap::default())).collect();
        let mut builder = ChainBuilder::new(base);
        for p in &taps {
            builder = builder.push(p.clone()).unwrap();
        }
        (builder.build().unwrap(), taps)
    }

    #[test]
    fn chaining_assigns_dense_indices_and_links() {
        let (chain, taps) = chain_of(3, 4);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.end_index(), 7);
        for (i, p) in taps.iter().enumerate() {
            assert_eq!(p.chain_index(), 4 + i);
        }
        assert!(taps[0].dw().is_none());
        assert!(taps[2].up().is_none());
        assert_eq!(taps[0].up().unwrap().chain_index(), 5);
        assert_eq!(taps[2].dw().unwrap().chain_index(), 5);
    }

    #[test]
    fn line_slots_cover_the_chain_and_can_be_widened() {
        let (chain, taps) = chain_of(3, 4);
        assert!(taps.iter().all(|t| t.links().line_slots() == 7));

        chain.widen_line_slots(12);
        assert!(taps.iter().all(|t| t.links().line_slots() == 12));
        chain.widen_line_slots(5);
        assert_eq!(taps[0].links().line_slots(), 12);
        assert_eq!(Links::new().line_slots(), 1);
    }

    #[test]
    fn linking_twice_is_rejected() {
        let tap: Arc<dyn Tunnel> = Arc::new(Tap::default());
        let _chain = ChainBuilder::new(0).push(tap.clone()).unwrap().build().unwrap();
        let err = ChainBuilder::new(0).push(tap).err().unwrap();
        assert_eq!(err, ChainError::AlreadyLinked("Tap"));
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert_eq!(ChainBuilder::new(0).build().err(), Some(ChainError::Empty));
    }

    #[test]
    fn init_at_chain_top_is_answered_with_established() {
        let worker = Worker::new(0);
        let (chain, taps) = chain_of(2, 0);
        let line = worker.new_line(2);

        chain.head().upstream(Context::init(&line), &worker);

        assert_eq!(taps[0].seen(), vec!["up:init", "dw:est"]);
        assert_eq!(taps[1].seen(), vec!["up:init"]);
        // the reply fell off the bottom and marked the line established
        assert_eq!(line.stage(), LineStage::Established);
    }

    #[test]
    fn payload_past_chain_end_is_discarded() {
        let worker = Worker::new(0);
        let (chain, taps) = chain_of(2, 0);
        let line = worker.new_line(2);

        let free_before = worker.pool().free_count();
        chain
            .head()
            .upstream(Context::payload(&line, worker.pool().copy_from(b"data")), &worker);
        assert_eq!(taps[1].seen(), vec!["up:data"]);
        assert_eq!(worker.pool().free_count(), free_before + 1);
    }

    #[test]
    fn fin_at_chain_end_closes_line() {
        let worker = Worker::new(0);
        let (chain, _taps) = chain_of(2, 0);
        let line = worker.new_line(2);

        chain.head().upstream(Context::fin(&line), &worker);
        assert!(line.is_closing());
        drop(line);
        assert_eq!(worker.stats().lines_destroyed(), 1);
    }

    #[test]
    fn single_tunnel_replies_to_itself() {
        let worker = Worker::new(0);
        let (chain, taps) = chain_of(1, 0);
        let line = worker.new_line(1);

        chain.head().upstream(Context::init(&line), &worker);
        assert_eq!(taps[0].seen(), vec!["up:init", "dw:est"]);
    }

    #[test]
    fn default_api_is_not_implemented() {
        let tap = Tap::default();
        assert_eq!(tap.api("status"), ApiResult::NotImplemented);
    }
}
