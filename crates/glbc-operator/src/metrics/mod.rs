//! Prometheus metrics
//!
//! Metrics are recorded through the `metrics` facade; a Prometheus recorder
//! is installed at startup and its rendering is served on `GET /metrics`.

pub mod counters;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Histogram buckets (seconds) shared by admission and issuance latency
pub const LATENCY_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 15.0, 30.0, 45.0, 60.0, 120.0, 300.0];

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to build Prometheus recorder: {0}")]
    Build(String),

    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Build an uninstalled recorder with the operator's bucket layout.
pub fn build_recorder() -> Result<PrometheusRecorder, MetricsError> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(counters::TIME_TO_ADMISSION.to_string()),
            LATENCY_BUCKETS,
        )
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full(counters::TLS_ISSUANCE_DURATION.to_string()),
                LATENCY_BUCKETS,
            )
        })
        .map_err(|e| MetricsError::Build(e.to_string()))?;

    Ok(builder.build_recorder())
}

/// Install the global recorder and expose every family at its initial value.
///
/// Returns the handle used to render the exposition.
pub fn init(issuer: &str) -> Result<PrometheusHandle, MetricsError> {
    let recorder = build_recorder()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

    counters::describe();
    counters::initialize(issuer);
    Ok(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Serve `GET /metrics` until the listener fails.
pub async fn run_metrics_server(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let upkeep = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
        loop {
            interval.tick().await;
            upkeep.run_upkeep();
        }
    });

    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(handle);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint listening");

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_recorder() {
        let recorder = build_recorder().unwrap();
        assert!(!recorder.handle().render().contains("glbc_"));
    }

    #[tokio::test]
    async fn test_render_handler() {
        let recorder = build_recorder().unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || counters::set_managed_objects(3));

        let body = render(State(handle)).await;
        assert!(body.contains("glbc_ingress_managed_object_total 3"));
    }
}
