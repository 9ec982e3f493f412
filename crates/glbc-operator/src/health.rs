//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dns::DnsProvider;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    /// Provider whose reachability gates readiness.
    dns: Arc<dyn DnsProvider>,
}

impl HealthState {
    pub fn new(dns: Arc<dyn DnsProvider>) -> Self {
        Self {
            started: AtomicBool::new(false),
            dns,
        }
    }

    /// Mark the operator as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server.
///
/// The operator is marked as started only after the server binds, so a
/// readiness probe cannot succeed before the server is listening.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    // Probes come from the kubelet inside the pod network namespace
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 until startup has completed, and whenever the DNS provider
/// cannot be reached.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.dns.check_readiness().await {
        Ok(true) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Ok(false) => {
            debug!("Readiness probe: NOT READY (DNS provider not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (DNS provider unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsProviderError, MockDnsProvider};

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_before_startup() {
        let mut dns = MockDnsProvider::new();
        dns.expect_check_readiness().never();

        let state = Arc::new(HealthState::new(Arc::new(dns)));

        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_ok_when_provider_ready() {
        let mut dns = MockDnsProvider::new();
        dns.expect_check_readiness().returning(|| Ok(true));

        let state = Arc::new(HealthState::new(Arc::new(dns)));
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_when_provider_unreachable() {
        let mut dns = MockDnsProvider::new();
        dns.expect_check_readiness()
            .returning(|| Err(DnsProviderError::Unavailable("connection refused".to_string())));

        let state = Arc::new(HealthState::new(Arc::new(dns)));
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_when_provider_not_ready() {
        let mut dns = MockDnsProvider::new();
        dns.expect_check_readiness().returning(|| Ok(false));

        let state = Arc::new(HealthState::new(Arc::new(dns)));
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_mark_started_is_idempotent() {
        let state = HealthState::new(Arc::new(MockDnsProvider::new()));
        assert!(!state.is_started());

        state.mark_started();
        state.mark_started();
        assert!(state.is_started());
    }
}
