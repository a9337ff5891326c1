//! Shared fixtures for the relay integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use directrelay::config::PoolConfig;
use directrelay::trace::Tracer;
use directrelay::{ConnectionPool, Connector, DirectRelayServer, RelaySettings, TcpConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Upstream that echoes every byte back until the peer closes
pub async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Upstream answering each `PING` with `PONG`
pub async fn ping_pong_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                while stream.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"PING" && stream.write_all(b"PONG").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

pub fn settings(upstream: SocketAddr, buffer_size: usize) -> RelaySettings {
    let mut settings = RelaySettings::new("127.0.0.1:0".parse().unwrap(), upstream);
    settings.buffer_size = buffer_size;
    settings.dial_backoff = Duration::from_millis(10);
    settings.shutdown_timeout = Duration::from_secs(5);
    settings
}

pub fn pool_with(connector: Arc<dyn Connector>) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(connector, PoolConfig::default()))
}

pub fn tcp_pool() -> Arc<ConnectionPool> {
    pool_with(Arc::new(TcpConnector::new(Duration::from_secs(2))))
}

pub async fn start_relay(settings: RelaySettings, tracer: Arc<dyn Tracer>) -> DirectRelayServer {
    DirectRelayServer::start(settings, tcp_pool(), tracer).await.unwrap()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// True once the peer has closed the stream or reset it
pub async fn closed_by_peer(stream: &mut tokio::net::TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}
