use crate::Metrics;
use anyhow::{Error as AnyhowError, Result};
use axum::{Router, routing::get, extract::State};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug)]
pub struct MetricsServerConfig {
    pub metrics_address: IpAddr,
    pub metrics_port: u16,
}

impl From<&MetricsServerConfig> for SocketAddr {
    fn from(config: &MetricsServerConfig) -> Self {
        SocketAddr::from((config.metrics_address, config.metrics_port))
    }
}

async fn prometheus_metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.gather()
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics_handler))
        .with_state(metrics)
}

pub async fn run_metrics_server(config: MetricsServerConfig, metrics: Arc<Metrics>) -> Result<()> {
    let addr = SocketAddr::from(&config);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Metrics server listening");

    axum::serve(listener, router(metrics).into_make_service_with_connect_info::<SocketAddr>()).await
        .map_err(AnyhowError::new)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_socket_addr_from_config() {
        let config = MetricsServerConfig {
            metrics_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            metrics_port: 9102,
        };
        assert_eq!(SocketAddr::from(&config).to_string(), "127.0.0.1:9102");
    }

    #[tokio::test]
    async fn test_handler_renders_registry() {
        let metrics = Arc::new(Metrics::new());
        metrics.inc_batches_completed();
        let body = prometheus_metrics_handler(State(metrics)).await;
        assert!(body.contains("sync_batches_completed_total 1"));
    }
}
