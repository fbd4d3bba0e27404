//! Worker threads.
//!
//! Each worker is one OS thread running a current-thread tokio runtime with
//! a `LocalSet`. Lines, buffers and continuation tasks never leave the
//! worker that created them; the only thing crossing threads is the accepted
//! socket, handed over as a std `TcpStream`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chainwall_config::CoreConfig;
use chainwall_core::{BufferPool, ERROR_IO, InboundHandler, Worker};
use chainwall_metrics::{record_error, set_worker_lines};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

/// How often a worker publishes its live line count.
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// An accepted socket on its way to a worker.
struct Assignment {
    stream: std::net::TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn InboundHandler>,
}

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    buffer_size: usize,
    pool_max_free: usize,
    drain_timeout: Duration,
}

/// Fixed set of worker threads fed round-robin.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Assignment>>,
    next: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers. `core.workers == 0` means one per available CPU.
    ///
    /// Workers run until `shutdown` is cancelled, then drain their live
    /// lines for at most `core.shutdown_timeout_secs`.
    pub fn start(core: &CoreConfig, shutdown: CancellationToken) -> Result<Self, ServerError> {
        let count = match core.workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        let settings = WorkerSettings {
            buffer_size: core.buffer_size,
            pool_max_free: core.pool_max_free,
            drain_timeout: Duration::from_secs(core.shutdown_timeout_secs),
        };

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let shutdown = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("chainwall-worker-{id}"))
                .spawn(move || run_worker(id, settings, rx, shutdown))?;
            senders.push(tx);
            threads.push(handle);
        }
        info!(
            workers = count,
            buffer_size = settings.buffer_size,
            pool_max_free = settings.pool_max_free,
            "worker pool started"
        );

        Ok(Self {
            senders,
            next: AtomicUsize::new(0),
            threads: Mutex::new(threads),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Hand an accepted socket to the next worker in turn.
    pub fn dispatch(
        &self,
        stream: std::net::TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<usize, ServerError> {
        if self.senders.is_empty() {
            return Err(ServerError::Worker("no workers".into()));
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[id]
            .send(Assignment {
                stream,
                peer,
                handler,
            })
            .map_err(|_| ServerError::Worker(format!("worker {id} has stopped")))?;
        Ok(id)
    }

    /// Block until every worker thread has exited.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

fn run_worker(
    id: usize,
    settings: WorkerSettings,
    mut rx: mpsc::UnboundedReceiver<Assignment>,
    shutdown: CancellationToken,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = id, error = %e, "failed to build worker runtime");
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let worker = Worker::with_pool(
            id,
            BufferPool::new(settings.buffer_size, settings.pool_max_free),
        );
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        debug!(worker = id, "worker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                assignment = rx.recv() => match assignment {
                    Some(assignment) => attach(&worker, assignment),
                    None => break,
                },

                _ = stats.tick() => set_worker_lines(id, worker.stats().live_lines()),
            }
        }

        // Sockets still queued for this worker are closed unanswered.
        rx.close();
        while rx.try_recv().is_ok() {}

        drain(&worker, settings.drain_timeout).await;
        set_worker_lines(id, worker.stats().live_lines());
    });
    // Dropping the LocalSet drops whatever continuation tasks remain.
    drop(local);
    debug!(worker = id, "worker stopped");
}

/// Register an accepted socket with this worker's reactor and announce it.
fn attach(worker: &Worker, assignment: Assignment) {
    let Assignment {
        stream,
        peer,
        handler,
    } = assignment;
    if let Err(e) = stream.set_nonblocking(true) {
        record_error(ERROR_IO);
        warn!(peer = %peer, error = %e, "failed to set socket non-blocking");
        return;
    }
    match tokio::net::TcpStream::from_std(stream) {
        Ok(stream) => handler.on_inbound_connected(stream, peer, worker),
        Err(e) => {
            record_error(ERROR_IO);
            warn!(peer = %peer, error = %e, "failed to register socket");
        }
    }
}

/// Wait for the worker's lines to go away, up to `timeout`.
///
/// Lines still alive at the deadline are abandoned: they are dropped with
/// the worker's tasks without running their teardown.
async fn drain(worker: &Worker, timeout: Duration) {
    let active = worker.stats().live_lines();
    if active == 0 {
        return;
    }
    info!(
        worker = worker.id(),
        "waiting for {} active connections to drain", active
    );

    let deadline = Instant::now() + timeout;
    while worker.stats().live_lines() > 0 {
        if Instant::now() >= deadline {
            warn!(
                worker = worker.id(),
                "shutdown timeout, {} connections still active",
                worker.stats().live_lines()
            );
            worker.stats().abandon();
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    info!(worker = worker.id(), "all connections drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Counts sockets per worker and keeps nothing alive.
    #[derive(Default)]
    struct Counting {
        seen: [AtomicU64; 2],
    }

    impl InboundHandler for Counting {
        fn on_inbound_connected(
            &self,
            _stream: tokio::net::TcpStream,
            _peer: SocketAddr,
            worker: &Worker,
        ) {
            self.seen[worker.id()].fetch_add(1, Ordering::SeqCst);
        }
    }

    fn core(workers: usize) -> CoreConfig {
        CoreConfig {
            workers,
            shutdown_timeout_secs: 1,
            ..CoreConfig::default()
        }
    }

    fn socket_pair() -> (std::net::TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn dispatch_is_round_robin() {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(&core(2), shutdown.clone()).unwrap();
        assert_eq!(pool.len(), 2);

        let handler = Arc::new(Counting::default());
        let mut clients = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (client, server, peer) = socket_pair();
            ids.push(pool.dispatch(server, peer, handler.clone()).unwrap());
            clients.push(client);
        }
        assert_eq!(ids, vec![0, 1, 0, 1]);
        assert!(wait_for(|| {
            handler.seen[0].load(Ordering::SeqCst) == 2 && handler.seen[1].load(Ordering::SeqCst) == 2
        }));

        shutdown.cancel();
        pool.join();
    }

    #[test]
    fn dispatch_after_shutdown_fails() {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(&core(1), shutdown.clone()).unwrap();
        shutdown.cancel();
        pool.join();

        let (_client, server, peer) = socket_pair();
        let err = pool
            .dispatch(server, peer, Arc::new(Counting::default()))
            .unwrap_err();
        assert!(matches!(err, ServerError::Worker(_)));
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(&core(0), shutdown.clone()).unwrap();
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        assert_eq!(pool.len(), cpus);
        shutdown.cancel();
        pool.join();
    }
}
