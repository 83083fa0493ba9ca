//! Process-wide Prometheus registry plus a minimal scrape endpoint. No
//! `hyper` or other web framework: when `prometheus_enabled` is set, a
//! background task accepts plain TCP connections and writes back whatever
//! the registry's `TextEncoder` produces, the same "off by default,
//! config-gated" shape as the rest of the config surface.

use crate::topology::metrics::PrometheusHandles;

use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

pub struct MetricsRegistry {
    pub registry: Registry,
    pub handles: Arc<PrometheusHandles>,
}

impl MetricsRegistry {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let handles = Arc::new(PrometheusHandles::register(&registry)?);
        Ok(Self { registry, handles })
    }

    /// Serves `GET /metrics` on `addr` until the process exits. Spawned as
    /// a background task; connection errors are logged, not propagated.
    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr, "prometheus scrape endpoint listening");
        let registry = self.registry.clone();

        loop {
            let (mut socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "metrics listener accept failed");
                    continue;
                }
            };
            let registry = registry.clone();
            tokio::spawn(async move {
                let body = render(&registry);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                if let Err(err) = socket.write_all(response.as_bytes()).await {
                    tracing::debug!(peer = %peer, error = %err, "metrics write failed");
                    return;
                }
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    }
}

fn render(registry: &Registry) -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %err, "prometheus encode failed");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_construction_registers_stage_metrics_families() {
        let registry = MetricsRegistry::new().unwrap();
        let families = registry.registry.gather();
        assert!(!families.is_empty());
    }
}
