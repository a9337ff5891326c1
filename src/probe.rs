//! TCP connect latency probe

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Outcome of a series of connect probes; `None` marks a lost attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    samples: Vec<Option<Duration>>,
}

impl PingResult {
    pub fn new(samples: Vec<Option<Duration>>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Option<Duration>] {
        &self.samples
    }

    pub fn loss_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_none()).count()
    }

    /// Mean over every attempt, lost attempts counting as zero
    pub fn avg(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: u128 = self.samples.iter().flatten().map(Duration::as_nanos).sum();
        let avg = total / self.samples.len() as u128;
        Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX))
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().flatten().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().flatten().max().copied()
    }
}

/// Measures TCP connect round trips to an endpoint
#[derive(Debug, Clone)]
pub struct PingClient {
    connect_timeout: Duration,
    /// Shared by clones; `None` disables caching
    verdicts: Option<Arc<Mutex<HashMap<SocketAddr, bool>>>>,
}

impl PingClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            verdicts: None,
        }
    }

    /// Remember each endpoint's `test` verdict and answer later tests from it
    pub fn with_cache(mut self) -> Self {
        self.verdicts = Some(Arc::default());
        self
    }

    /// Four probes; true when none of them was lost
    pub async fn test(&self, addr: SocketAddr) -> bool {
        self.test_then(addr, |_| {}).await
    }

    /// Like [`test`](Self::test), calling `on_ok` when the endpoint is reachable
    pub async fn test_then(&self, addr: SocketAddr, on_ok: impl FnOnce(SocketAddr)) -> bool {
        let ok = match self.cached(addr) {
            Some(ok) => ok,
            None => {
                let ok = self.ping(addr, 4).await.loss_count() == 0;
                if let Some(verdicts) = &self.verdicts {
                    if let Ok(mut verdicts) = verdicts.lock() {
                        verdicts.insert(addr, ok);
                    }
                }
                ok
            }
        };

        if ok {
            on_ok(addr);
        }
        ok
    }

    fn cached(&self, addr: SocketAddr) -> Option<bool> {
        let verdicts = self.verdicts.as_ref()?.lock().ok()?;
        verdicts.get(&addr).copied()
    }

    pub async fn ping(&self, addr: SocketAddr, times: usize) -> PingResult {
        let mut samples = Vec::with_capacity(times);

        for _ in 0..times {
            let started = Instant::now();
            let sample = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let elapsed = started.elapsed();
                    drop(stream);
                    Some(elapsed)
                }
                Ok(Err(e)) => {
                    info!("Ping error {}: {}", addr, e);
                    None
                }
                Err(_) => {
                    info!("Ping error {}: timed out after {:?}", addr, self.connect_timeout);
                    None
                }
            };
            debug!("Ping {} -> {:?}", addr, sample);
            samples.push(sample);
        }

        PingResult::new(samples)
    }
}

impl Default for PingClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_result_statistics() {
        let result = PingResult::new(vec![
            Some(Duration::from_millis(10)),
            None,
            Some(Duration::from_millis(30)),
            Some(Duration::from_millis(20)),
        ]);
        assert_eq!(result.loss_count(), 1);
        assert_eq!(result.avg(), Duration::from_millis(15));
        assert_eq!(result.min(), Some(Duration::from_millis(10)));
        assert_eq!(result.max(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_all_lost() {
        let result = PingResult::new(vec![None, None]);
        assert_eq!(result.loss_count(), 2);
        assert_eq!(result.avg(), Duration::ZERO);
        assert_eq!(result.min(), None);
        assert_eq!(result.max(), None);
    }

    #[tokio::test]
    async fn test_ping_listening_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();
        let client = PingClient::new(Duration::from_secs(2));

        let result = client.ping(open, 3).await;
        assert_eq!(result.samples().len(), 3);
        assert_eq!(result.loss_count(), 0);
        assert!(client.test(open).await);

        drop(listener);
        assert!(!client.test(open).await);
    }

    #[test]
    fn test_avg_of_many_samples() {
        let result = PingResult::new(vec![Some(Duration::from_millis(2)); 10_000]);
        assert_eq!(result.avg(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_cached_verdict_and_on_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = PingClient::new(Duration::from_secs(2)).with_cache();

        let mut reached = Vec::new();
        assert!(client.test_then(addr, |a| reached.push(a)).await);
        assert_eq!(reached, vec![addr]);

        // The verdict is remembered even after the endpoint goes away.
        drop(listener);
        assert!(client.clone().test(addr).await);

        let uncached = PingClient::new(Duration::from_secs(2));
        let mut called = false;
        assert!(!uncached.test_then(addr, |_| called = true).await);
        assert!(!called);
    }
}
