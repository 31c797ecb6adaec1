//! Integration tests: start the relay on a free port and talk to it over real TCP sockets.

use relay::config::RelayConfig;
use relay::RelayServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    addr: SocketAddr,
    registry: Arc<relay::relay::ClientRegistry>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("relay did not stop within 10s")
            .expect("relay task panicked")
            .expect("relay returned error");
    }
}

fn local_config() -> RelayConfig {
    RelayConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        ..RelayConfig::default()
    }
}

async fn start(max_clients: usize) -> Running {
    start_with(RelayConfig {
        max_clients,
        ..local_config()
    })
    .await
}

async fn start_with(config: RelayConfig) -> Running {
    let server = RelayServer::bind(&config).await.expect("bind relay");
    let addr = server.local_addr().expect("local addr");
    let registry = server.registry();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));
    Running {
        addr,
        registry,
        stop: Some(tx),
        handle,
    }
}

async fn wait_for_clients(registry: &relay::relay::ClientRegistry, n: usize) {
    for _ in 0..200 {
        if registry.len().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} registered client(s), have {}",
        n,
        registry.len().await
    );
}

async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for relayed bytes")
        .expect("read relayed bytes");
    buf
}

/// Read until the relay closes the socket (EOF or reset), discarding whatever was queued.
async fn drain_until_closed(stream: &mut TcpStream) {
    let mut buf = vec![0u8; 64 * 1024];
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("relay did not close the socket");
}

async fn assert_nothing_to_read(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!("unexpected {} byte(s): {:?}", n, &buf[..n]),
        Ok(Err(e)) => panic!("unexpected read error: {}", e),
    }
}

#[tokio::test]
async fn chunk_reaches_every_other_client_but_not_sender() {
    let relay = start(0).await;
    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();
    let mut c = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 3).await;

    a.write_all(b"hello relay").await.unwrap();
    assert_eq!(read_exact_timeout(&mut b, 11).await, b"hello relay");
    assert_eq!(read_exact_timeout(&mut c, 11).await, b"hello relay");
    assert_nothing_to_read(&mut a).await;

    let stats = relay.registry.stats();
    assert_eq!(stats.bytes_in, 11);
    assert_eq!(stats.bytes_out, 22);
    assert_eq!(stats.connections_total, 3);

    relay.stop().await;
}

#[tokio::test]
async fn bytes_from_one_sender_arrive_in_order() {
    let relay = start(0).await;
    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    for part in payload.chunks(1000) {
        a.write_all(part).await.unwrap();
    }
    assert_eq!(read_exact_timeout(&mut b, payload.len()).await, payload);

    relay.stop().await;
}

#[tokio::test]
async fn disconnected_client_is_removed() {
    let relay = start(0).await;
    let a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    drop(a);
    wait_for_clients(&relay.registry, 1).await;

    // Remaining client can still talk to a newcomer.
    let mut c = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;
    b.write_all(b"still here").await.unwrap();
    assert_eq!(read_exact_timeout(&mut c, 10).await, b"still here");

    relay.stop().await;
}

#[tokio::test]
async fn client_limit_rejects_extra_connection() {
    let relay = start(1).await;
    let _a = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;

    let mut extra = TcpStream::connect(relay.addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), extra.read(&mut buf))
        .await
        .expect("rejected connection was not closed");
    // Closed by the relay: EOF or reset, never data.
    assert!(matches!(n, Ok(0) | Err(_)));
    assert_eq!(relay.registry.len().await, 1);
    assert_eq!(relay.registry.stats().connections_rejected, 1);

    relay.stop().await;
}

#[tokio::test]
async fn shutdown_closes_client_sockets() {
    let relay = start(0).await;
    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;
    let registry = relay.registry.clone();

    relay.stop().await;
    assert!(registry.is_empty().await);

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), a.read(&mut buf))
        .await
        .expect("client socket not closed on shutdown");
    assert!(matches!(n, Ok(0) | Err(_)));
}

#[tokio::test]
async fn client_limit_holds_for_back_to_back_connections() {
    let config = RelayConfig {
        max_clients: 1,
        ..local_config()
    };
    let server = RelayServer::bind(&config).await.expect("bind relay");
    let addr = server.local_addr().expect("local addr");
    let registry = server.registry();

    // Both connections wait in the backlog before the accept loop first runs.
    let _first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));

    for _ in 0..200 {
        if registry.stats().connections_rejected == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.stats().connections_rejected, 1);
    wait_for_clients(&registry, 1).await;
    drain_until_closed(&mut second).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.len().await, 1);

    let _ = tx.send(());
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn slow_client_is_evicted_and_disconnected() {
    let relay = start_with(RelayConfig {
        client_queue: 2,
        ..local_config()
    })
    .await;
    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let mut slow = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    // `slow` never reads, so its queue fills while `a` keeps sending.
    let chunk = vec![0u8; 64 * 1024];
    tokio::time::timeout(Duration::from_secs(30), async {
        while relay.registry.stats().evictions == 0 {
            a.write_all(&chunk).await.unwrap();
        }
    })
    .await
    .expect("slow client was never evicted");
    wait_for_clients(&relay.registry, 1).await;

    // Whatever the evicted client sends now must not reach anyone.
    let _ = slow.write_all(b"still-alive").await;
    assert_nothing_to_read(&mut a).await;

    drain_until_closed(&mut slow).await;
    assert_eq!(relay.registry.stats().evictions, 1);
    assert_eq!(relay.registry.len().await, 1);

    relay.stop().await;
}

#[tokio::test]
async fn reset_connection_is_removed() {
    let relay = start(0).await;
    let a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    a.set_linger(Some(Duration::ZERO)).unwrap();
    drop(a);
    wait_for_clients(&relay.registry, 1).await;

    let mut c = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;
    b.write_all(b"after reset").await.unwrap();
    assert_eq!(read_exact_timeout(&mut c, 11).await, b"after reset");

    relay.stop().await;
}
