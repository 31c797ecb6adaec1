//! Relay TCP server: accept loop, per-client reader and writer tasks, graceful shutdown.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::{Config, RelayConfig};
use crate::error::RelayError;
use crate::relay::registry::ClientRegistry;
use crate::status;

const LISTEN_BACKLOG: u32 = 1024;

/// How long a closing client's writer may take to flush its queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Resolve `addr` (host or IP plus port) to the first socket address.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr, RelayError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|source| RelayError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| RelayError::NoAddress(addr.to_string()))
}

/// Bind a listener with SO_REUSEADDR so a restart can reclaim the port right away.
async fn bind_reuse(addr: &str) -> Result<TcpListener> {
    let sock_addr = resolve_addr(addr).await?;
    let socket = if sock_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("creating socket")?;
    socket.set_reuseaddr(true).context("setting SO_REUSEADDR")?;
    socket
        .bind(sock_addr)
        .with_context(|| format!("binding to {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("listening on {}", addr))
}

/// A bound relay listener plus the registry its clients share.
pub struct RelayServer {
    listener: TcpListener,
    config: Arc<RelayConfig>,
    registry: Arc<ClientRegistry>,
}

impl RelayServer {
    /// Bind `config.bind:config.port`. Port 0 picks a free port (see [`RelayServer::local_addr`]).
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = bind_reuse(&config.addr()).await?;
        Ok(Self {
            listener,
            config: Arc::new(config.clone()),
            registry: Arc::new(ClientRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("reading relay local address")
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Accept clients until `shutdown` resolves, then close every client (flushing queued
    /// chunks first) and wait for their tasks.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            config,
            registry,
        } = self;
        let (close_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();
        // Slots are reserved here, before the client task runs, so back-to-back accepts
        // cannot all pass the limit.
        let slots = (config.max_clients > 0).then(|| Arc::new(Semaphore::new(config.max_clients)));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let permit = match &slots {
                        Some(slots) => match slots.clone().try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                registry.record_rejected();
                                log::warn!(
                                    "rejecting {}: client limit {} reached",
                                    addr,
                                    config.max_clients
                                );
                                drop(stream);
                                continue;
                            }
                        },
                        None => None,
                    };
                    connections.spawn(handle_client(
                        stream,
                        addr,
                        registry.clone(),
                        config.clone(),
                        close_tx.subscribe(),
                        permit,
                    ));
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::warn!("client task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        log::info!(
            "relay shutting down, closing {} client(s)",
            registry.len().await
        );
        let _ = close_tx.send(());
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                log::warn!("client task failed: {}", e);
            }
        }
        log::info!("relay stopped");
        Ok(())
    }
}

/// Read chunks from one client and broadcast them until EOF, a read error, eviction, or
/// shutdown. The client is always unregistered before returning. `_slot` holds the client's
/// place under `maxClients` until the connection is closed.
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    config: Arc<RelayConfig>,
    mut close_rx: broadcast::Receiver<()>,
    _slot: Option<OwnedSemaphorePermit>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay for {}: {}", addr, e);
    }
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(config.client_queue);
    let (id, mut evicted_rx) = registry.register(addr, tx).await;
    log::info!("client connected: {} ({})", addr, id);

    let mut writer_task = tokio::spawn(write_loop(writer, rx, addr));
    let mut writer_done = false;
    let mut evicted = false;
    let mut buf = vec![0u8; config.buffer_size];

    loop {
        tokio::select! {
            _ = close_rx.recv() => break,
            _ = &mut evicted_rx => {
                evicted = true;
                break;
            }
            _ = &mut writer_task => {
                writer_done = true;
                break;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let sent = registry.broadcast(id, Bytes::copy_from_slice(&buf[..n])).await;
                    log::debug!("{} sent {} byte(s) to {} client(s)", id, n, sent);
                }
                Err(e) => {
                    log::warn!("client {} error: {}", addr, e);
                    break;
                }
            }
        }
    }

    registry.unregister(id).await;
    if evicted {
        // The peer is not draining its socket; drop the queue instead of flushing it.
        writer_task.abort();
        let _ = writer_task.await;
    } else if !writer_done
        && tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err()
    {
        log::debug!("flushing to {} timed out", addr);
        writer_task.abort();
    }
    log::info!("client disconnected: {} ({})", addr, id);
}

/// Drain the client's queue onto its socket. Ends when the queue closes or a write fails,
/// then shuts down the write half.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, addr: SocketAddr) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            log::debug!("write to {} failed: {}", addr, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Run the relay (and the status endpoint when enabled) until SIGINT or SIGTERM.
pub async fn run_relay(config: Config) -> Result<()> {
    run_relay_until(config, async {
        shutdown_signal().await;
        log::info!("shutdown signal received");
    })
    .await
}

/// Run the relay (and the status endpoint when enabled) until `shutdown` resolves.
pub async fn run_relay_until<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let server = RelayServer::bind(&config.relay).await?;
    log::info!("relay listening on {}", server.local_addr()?);

    let (stop_tx, _) = broadcast::channel::<()>(1);

    let status_task = if config.status.enabled {
        let listener = bind_reuse(&config.status.addr()).await?;
        log::info!(
            "status endpoint listening on {}",
            listener.local_addr().context("reading status local address")?
        );
        let state = status::StatusState {
            registry: server.registry(),
            relay_port: server.local_addr()?.port(),
        };
        let mut stop_rx = stop_tx.subscribe();
        Some(tokio::spawn(status::serve_status(listener, state, async move {
            let _ = stop_rx.recv().await;
        })))
    } else {
        None
    };

    let mut stop_rx = stop_tx.subscribe();
    let signal_task = tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(());
    });

    let served = server
        .serve(async move {
            let _ = stop_rx.recv().await;
        })
        .await;
    signal_task.abort();

    if let Some(task) = status_task {
        match task.await {
            Ok(Err(e)) => log::warn!("status endpoint: {:#}", e),
            Err(e) => log::warn!("status endpoint task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    served
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
