//! Socket dispatch: listening sockets, address filters and handoff to workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chainwall_config::Config;
use chainwall_core::{ERROR_IO, InboundHandler, SocketFilter, SocketProtocol};
use chainwall_metrics::{record_connection_rejected, record_error};
use chainwall_tunnels::NodeManager;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::util::create_listener;
use crate::worker::WorkerPool;

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// One bound socket and the tunnel that wants its connections.
struct Listening {
    listener: TcpListener,
    filter: SocketFilter,
    handler: Arc<dyn InboundHandler>,
}

/// Run the server with a cancellation token for graceful shutdown.
///
/// Builds every chain, binds one socket per port of every acceptor
/// registration, then accepts until `shutdown` is cancelled.
pub async fn run_with_shutdown(
    config: Config,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let mut nodes = NodeManager::from_config(&config);
    nodes.build_all()?;

    let listening = bind_acceptors(&nodes, config.core.connection_backlog)?;
    if listening.is_empty() {
        warn!("no node accepts connections, nothing to listen on");
    }

    let pool = Arc::new(WorkerPool::start(&config.core, shutdown.clone())?);

    let mut accept_loops = JoinSet::new();
    for listening in listening {
        accept_loops.spawn(accept_loop(listening, pool.clone(), shutdown.clone()));
    }

    shutdown.cancelled().await;
    info!("shutdown signal received, stopping accept loops");
    while let Some(result) = accept_loops.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "accept loop ended abnormally");
        }
    }

    let workers = pool.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || workers.join()).await {
        warn!(error = %e, "failed to join worker threads");
    }

    nodes.destroy();
    info!("server stopped");
    Ok(())
}

/// Run the server (blocking until error, no graceful shutdown).
pub async fn run(config: Config) -> Result<(), ServerError> {
    run_with_shutdown(config, CancellationToken::new()).await
}

fn bind_acceptors(nodes: &NodeManager, backlog: u32) -> Result<Vec<Listening>, ServerError> {
    let mut listening = Vec::new();
    for acceptor in nodes.acceptors() {
        if acceptor.filter.protocol != SocketProtocol::Tcp {
            warn!(
                node = %acceptor.node,
                protocol = ?acceptor.filter.protocol,
                "unsupported acceptor protocol, skipping"
            );
            continue;
        }
        for port in acceptor.filter.ports() {
            let addr = SocketAddr::new(acceptor.filter.address, port);
            let listener = create_listener(addr, backlog)?;
            info!(node = %acceptor.node, address = %addr, backlog, "listening");
            listening.push(Listening {
                listener,
                filter: acceptor.filter.clone(),
                handler: acceptor.handler.clone(),
            });
        }
    }
    Ok(listening)
}

async fn accept_loop(listening: Listening, pool: Arc<WorkerPool>, shutdown: CancellationToken) {
    let Listening {
        listener,
        filter,
        handler,
    } = listening;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            result = listener.accept() => {
                let (tcp, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        record_error(ERROR_IO);
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if !filter.allows(peer.ip()) {
                    debug!(peer = %peer, reason = "address_filter", "connection rejected");
                    record_connection_rejected();
                    drop(tcp);
                    continue;
                }

                let stream = match tcp.into_std() {
                    Ok(stream) => stream,
                    Err(e) => {
                        record_error(ERROR_IO);
                        warn!(peer = %peer, error = %e, "failed to detach accepted socket");
                        continue;
                    }
                };
                match pool.dispatch(stream, peer, handler.clone()) {
                    Ok(worker) => debug!(peer = %peer, worker, "new connection"),
                    Err(e) => {
                        record_error(e.error_type());
                        warn!(peer = %peer, error = %e, "failed to hand connection to a worker");
                    }
                }
            }
        }
    }
}

/// Build every chain in `config` without binding any socket.
///
/// Returns the number of chains built and the number of acceptor
/// registrations found.
pub(crate) fn build_only(config: &Config) -> Result<(usize, usize), ServerError> {
    let mut nodes = NodeManager::from_config(config);
    nodes.build_all()?;
    let counts = (nodes.chains().len(), nodes.acceptors().len());
    nodes.destroy();
    Ok(counts)
}
