//! TCP connect probe.

use super::{Probe, ProbeConfig, ProbeError, ProbeFuture};

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Succeeds when a TCP handshake to the target port completes.
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn probe(&self, config: &ProbeConfig, address: IpAddr) -> ProbeFuture<f64> {
        let target = SocketAddr::new(address, config.port);
        let timeout = config.timeout;
        Box::pin(run_tcp_probe(target, timeout))
    }
}

/// Connect to `target` and return the handshake latency in nanoseconds.
pub async fn run_tcp_probe(target: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to connect to {}: {}", target, e)))?;

    let elapsed = start.elapsed().as_nanos() as f64;
    drop(stream);

    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let latency = run_tcp_probe(addr, Duration::from_secs(2)).await.unwrap();
        assert!(latency > 0.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // Bind then drop to find a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = run_tcp_probe(addr, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
