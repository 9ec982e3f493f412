use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::ObjectRef;
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use glbc_operator::cluster::ClusterDirectory;
use glbc_operator::config::Args;
use glbc_operator::controllers::retry::RetryTracker;
use glbc_operator::controllers::{self, ControllerContext, HostIndex, ManagedObjects, Trigger};
use glbc_operator::dns::KubeDnsProvider;
use glbc_operator::health::{run_health_server, HealthState};
use glbc_operator::metrics::run_metrics_server;
use glbc_operator::tls::{CertManagerProvider, CertificateCoordinator, CertificateOrder};
use glbc_operator::writeback::KubeIngressWriter;
use glbc_operator::{metrics, telemetry};

const SHUTDOWN_GRACE_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    telemetry::init(args.log_format).context("Failed to initialize logging")?;

    info!("glbc-operator starting");

    let settings = args.settings().context("Invalid configuration")?;

    info!(
        domain = %settings.base_domain,
        ttl = settings.dns.ttl,
        weight_policy = ?settings.dns.policy,
        tls = settings.tls.enabled,
        issuer = %settings.tls.issuer,
        workers = settings.workers,
        "Loaded configuration"
    );

    let metrics_handle = metrics::init(&settings.tls.issuer).context("Failed to initialize metrics")?;

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let dns = Arc::new(KubeDnsProvider::new(
        kube_client.clone(),
        settings.dns.zone_id.clone(),
    ));
    let certificate_provider = Arc::new(CertManagerProvider::new(
        kube_client.clone(),
        settings.tls.issuer.clone(),
        settings.tls.issuer_kind.clone(),
    ));
    let (trigger, triggers) = Trigger::channel();
    let (issuance, orders) = mpsc::unbounded_channel();

    let ctx = Arc::new(ControllerContext {
        kube_client: kube_client.clone(),
        weight_policy: settings.dns.weight_policy(),
        certificates: Arc::new(CertificateCoordinator::new(settings.tls.issuer.clone())),
        settings: Arc::new(settings),
        dns: dns.clone(),
        certificate_provider,
        issuance,
        writer: Arc::new(KubeIngressWriter::new(kube_client.clone())),
        clusters: Arc::new(ClusterDirectory::new()),
        hosts: Arc::new(HostIndex::new()),
        managed: Arc::new(ManagedObjects::new()),
        retry_tracker: Arc::new(RetryTracker::new()),
        trigger,
    });

    let health = Arc::new(HealthState::new(dns));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    info!("Starting controllers");

    select! {
        result = run_controllers(ctx.clone(), triggers, orders) => {
            // Controller failure should trigger pod restart
            return result.context("Controller failure");
        }
        result = run_health_server(health, args.health_port) => {
            return result.context("Health check server failed");
        }
        result = run_metrics_server(metrics_handle, args.metrics_addr) => {
            return result.context("Metrics server failed");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    info!(
        grace_seconds = SHUTDOWN_GRACE_SECS,
        managed = ctx.managed.len(),
        pending_certificates = ctx.certificates.pending_count(),
        "Starting graceful shutdown"
    );
    sleep(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
    info!("Shutdown complete");

    Ok(())
}

/// Run the Ingress controller and the certificate worker concurrently
///
/// Returns an error if either exits, which should trigger a pod restart.
async fn run_controllers(
    ctx: Arc<ControllerContext>,
    triggers: mpsc::UnboundedReceiver<ObjectRef<Ingress>>,
    orders: mpsc::UnboundedReceiver<CertificateOrder>,
) -> Result<()> {
    info!("Starting Ingress controller");
    let ingress = tokio::spawn(controllers::ingress::run(ctx.clone(), triggers));

    info!("Starting certificate controller");
    let certificate = tokio::spawn(controllers::certificate::run(ctx.clone(), orders));

    select! {
        result = ingress => handle_controller_exit("Ingress", result),
        result = certificate => handle_controller_exit("Certificate", result),
    }
}

/// Handle a controller task exit, returning an error to trigger pod restart
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            error!(controller = name, "Controller exited unexpectedly");
            bail!("{} controller exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}
