//! HTTP probe implementation.

use super::{Probe, ProbeConfig, ProbeError, ProbeFuture};

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Fetches a URL on the target with the hostname pinned to one address.
pub struct HttpProbe;

impl Probe for HttpProbe {
    fn probe(&self, config: &ProbeConfig, address: IpAddr) -> ProbeFuture<f64> {
        let config = config.clone();
        Box::pin(async move { run_http_probe(&config, address).await })
    }
}

fn build_url(config: &ProbeConfig) -> String {
    let scheme = if config.tls { "https" } else { "http" };
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    format!("{}://{}:{}{}", scheme, config.hostname, config.port, path)
}

/// Run an HTTP probe against one address of the configured host.
///
/// Returns latency in nanoseconds.
pub async fn run_http_probe(config: &ProbeConfig, address: IpAddr) -> Result<f64, ProbeError> {
    let url = build_url(config);

    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .resolve(&config.hostname, SocketAddr::new(address, config.port))
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(config.timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status();

    // Read the full body to measure complete transfer time
    let _body = response
        .bytes()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let elapsed = start.elapsed().as_nanos() as f64;

    match config.expect_status {
        Some(expected) if status.as_u16() != expected => Err(ProbeError::Protocol(format!(
            "unexpected status {} (expected {})",
            status.as_u16(),
            expected
        ))),
        None if status.is_server_error() => {
            Err(ProbeError::Protocol(format!("server error {}", status.as_u16())))
        }
        _ => Ok(elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn config(port: u16) -> ProbeConfig {
        let mut config = ProbeConfig::new("http", "svc.test", Duration::from_secs(2));
        config.port = port;
        config.path = "health".to_string();
        config
    }

    #[test]
    fn test_build_url() {
        assert_eq!(build_url(&config(8080)), "http://svc.test:8080/health");
    }

    #[tokio::test]
    async fn test_http_probe_ok() {
        let port = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
        let latency = run_http_probe(&config(port), "127.0.0.1".parse().unwrap()).await;
        assert!(latency.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_http_probe_unexpected_status() {
        let port = serve_once("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let mut cfg = config(port);
        cfg.expect_status = Some(200);
        let result = run_http_probe(&cfg, "127.0.0.1".parse().unwrap()).await;
        assert!(matches!(result, Err(ProbeError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = run_http_probe(&config(port), "127.0.0.1".parse().unwrap()).await;
        assert!(result.is_err());
    }
}
