//! Upstream dialing with retries through an injected connector

mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use directrelay::trace::{MemoryTracer, TraceEvent};
use directrelay::{Connector, DirectRelayServer, TcpConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use common::{closed_by_peer, eventually, ping_pong_upstream, pool_with, settings};

/// Refuses the first `failures` dials, then connects normally
struct FlakyConnector {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    inner: TcpConnector,
}

impl FlakyConnector {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            inner: TcpConnector::new(Duration::from_secs(2)),
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test"));
        }
        self.inner.connect(addr).await
    }
}

async fn ping(client: &mut TcpStream) -> [u8; 4] {
    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .expect("no reply")
        .unwrap();
    reply
}

#[tokio::test]
async fn test_exhausted_retries_close_client_then_next_is_served() {
    let upstream = ping_pong_upstream().await;
    let connector = Arc::new(FlakyConnector::new(3));
    let tracer = Arc::new(MemoryTracer::new());

    let mut relay_settings = settings(upstream, 8192);
    relay_settings.dial_retry_count = 3;
    let server = DirectRelayServer::start(relay_settings, pool_with(connector.clone()), tracer.clone())
        .await
        .unwrap();

    let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(closed_by_peer(&mut first).await, "client should be dropped after failed dials");
    assert_eq!(connector.attempts(), 3);
    assert_eq!(server.session_count(), 0);
    assert_eq!(
        tracer.count(|e| matches!(e, TraceEvent::DialFailed { attempts: 3, .. })),
        1
    );
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::SessionOpened { .. })), 0);

    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    assert_eq!(&ping(&mut second).await, b"PONG");
    assert_eq!(connector.attempts(), 4);
    assert_eq!(server.pool().stats().dial_failures, 3);

    server.close().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let upstream = ping_pong_upstream().await;
    let connector = Arc::new(FlakyConnector::new(2));
    let tracer = Arc::new(MemoryTracer::new());

    let mut relay_settings = settings(upstream, 8192);
    relay_settings.dial_retry_count = 4;
    let server = DirectRelayServer::start(relay_settings, pool_with(connector.clone()), tracer.clone())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    assert_eq!(&ping(&mut client).await, b"PONG");
    assert_eq!(connector.attempts(), 3);
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::DialFailed { .. })), 0);

    server.close().await;
}

#[tokio::test]
async fn test_retry_count_change_applies_to_new_clients() {
    let upstream = ping_pong_upstream().await;
    let connector = Arc::new(FlakyConnector::new(1));

    let mut relay_settings = settings(upstream, 8192);
    relay_settings.dial_retry_count = 1;
    let server = DirectRelayServer::start(relay_settings, pool_with(connector.clone()), Arc::new(MemoryTracer::new()))
        .await
        .unwrap();

    server.set_dial_retry_count(2);
    assert_eq!(server.dial_retry_count(), 2);

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    assert_eq!(&ping(&mut client).await, b"PONG");
    assert_eq!(connector.attempts(), 2);

    server.close().await;
}

#[tokio::test]
async fn test_unreachable_upstream_does_not_stall_accept() {
    // Reserve a port and release it so nothing listens there.
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let tracer = Arc::new(MemoryTracer::new());
    let mut relay_settings = settings(dead_addr, 8192);
    relay_settings.dial_retry_count = 2;
    let server = DirectRelayServer::start(
        relay_settings,
        pool_with(Arc::new(TcpConnector::new(Duration::from_secs(1)))),
        tracer.clone(),
    )
    .await
    .unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(server.local_addr()).await.unwrap());
    }
    for client in &mut clients {
        assert!(closed_by_peer(client).await);
    }
    assert!(eventually(|| tracer.count(|e| matches!(e, TraceEvent::DialFailed { .. })) == 3).await);

    server.close().await;
}
