use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness check for a dev server URL.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> bool;
}

/// HTTP GET probe. Any response counts as ready unless `ready_on_any_status`
/// is off, in which case only 2xx does.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    ready_on_any_status: bool,
}

impl HttpProbe {
    pub fn new(ready_on_any_status: bool) -> Self {
        let client = Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("falling back to default HTTP client for probes: {err}");
                Client::new()
            });
        Self {
            client,
            ready_on_any_status,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url, status = status.as_u16(), "probe answered");
                self.ready_on_any_status || status.is_success()
            }
            Err(err) => {
                debug!(url, "probe failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_any_status_counts_as_ready() {
        let url = serve_once("HTTP/1.1 404 Not Found").await;
        assert!(HttpProbe::new(true).probe(&url).await);
    }

    #[tokio::test]
    async fn test_strict_probe_requires_success() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error").await;
        assert!(!HttpProbe::new(false).probe(&url).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_not_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!HttpProbe::new(true).probe(&format!("http://{addr}/")).await);
    }
}
