//! Client registry: connected clients, their outbound queues, and relay counters.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::sync::RwLock;

/// Process-unique client identifier, assigned in connect order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl Serialize for ClientId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Snapshot of one connected client, as reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub bytes_received: u64,
}

/// Relay counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub connections_total: u64,
    pub connections_rejected: u64,
    /// Bytes read from clients.
    pub bytes_in: u64,
    /// Bytes queued to recipients (one chunk counts once per recipient).
    pub bytes_out: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    connections_total: AtomicU64,
    connections_rejected: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    evictions: AtomicU64,
}

struct ClientEntry {
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
    bytes_received: AtomicU64,
    tx: mpsc::Sender<Bytes>,
    /// Fired on eviction so the client's task closes the connection.
    evicted: oneshot::Sender<()>,
}

/// Registry of connected clients. Shared by the accept loop, every client task, and the
/// status endpoint.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client whose writer drains `tx`'s receiver. The returned receiver resolves once
    /// the client leaves the registry; before the client unregisters itself that only
    /// happens through eviction.
    pub async fn register(
        &self,
        addr: SocketAddr,
        tx: mpsc::Sender<Bytes>,
    ) -> (ClientId, oneshot::Receiver<()>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (evicted, evicted_rx) = oneshot::channel();
        let entry = ClientEntry {
            addr,
            connected_at: Utc::now(),
            bytes_received: AtomicU64::new(0),
            tx,
            evicted,
        };
        self.inner.write().await.insert(id, entry);
        self.counters.connections_total.fetch_add(1, Ordering::Relaxed);
        (id, evicted_rx)
    }

    /// Remove a client. Dropping its queue sender lets the writer flush and close.
    /// Returns false when the id was already gone (evicted or unregistered twice).
    pub async fn unregister(&self, id: ClientId) -> bool {
        self.inner.write().await.remove(&id).is_some()
    }

    /// Queue `chunk` for every client except `from`. Never waits on a slow client: one whose
    /// queue is full is evicted. Returns how many clients the chunk was queued for; a sender
    /// that is no longer registered reaches nobody.
    pub async fn broadcast(&self, from: ClientId, chunk: Bytes) -> usize {
        let len = chunk.len() as u64;
        let mut delivered = 0usize;
        let mut evict = Vec::new();
        {
            let g = self.inner.read().await;
            let Some(sender) = g.get(&from) else {
                log::debug!("dropping {} byte(s) from unregistered {}", len, from);
                return 0;
            };
            sender.bytes_received.fetch_add(len, Ordering::Relaxed);
            for (id, entry) in g.iter() {
                if *id == from {
                    continue;
                }
                match entry.tx.try_send(chunk.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => evict.push(*id),
                    Err(TrySendError::Closed(_)) => {
                        log::debug!("skipping {}: writer already closed", id);
                    }
                }
            }
        }
        self.counters.bytes_in.fetch_add(len, Ordering::Relaxed);
        self.counters
            .bytes_out
            .fetch_add(len * delivered as u64, Ordering::Relaxed);

        if !evict.is_empty() {
            let mut g = self.inner.write().await;
            for id in evict {
                if let Some(entry) = g.remove(&id) {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    log::warn!("evicting slow client {} ({}): outbound queue full", entry.addr, id);
                    let _ = entry.evicted.send(());
                }
            }
        }
        delivered
    }

    /// Count a connection turned away at the client limit.
    pub fn record_rejected(&self) {
        self.counters.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Connected clients, oldest first.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let g = self.inner.read().await;
        let mut out: Vec<ClientInfo> = g
            .iter()
            .map(|(id, e)| ClientInfo {
                id: *id,
                addr: e.addr,
                connected_at: e.connected_at,
                bytes_received: e.bytes_received.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        RelayStats {
            connections_total: c.connections_total.load(Ordering::Relaxed),
            connections_rejected: c.connections_rejected.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }
}
