//! Ingress controller
//!
//! Every pass recomputes the object's phase from scratch: assign the host,
//! aggregate placement, publish DNS, request a certificate, then write back
//! whatever changed in a single patch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use glbc_common::{generate, validate_rule_host, GeneratedHost, ObjectIdentity, ValidationError};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::{self, Action};
use kube::runtime::finalizer::{self, finalizer, Event};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{annotations, FIELD_MANAGER, FINALIZER};
use crate::dns::{synthesize, DnsProviderError};
use crate::metrics::counters;
use crate::object::{identity_of, tenant_of};
use crate::placement;
use crate::status::{GlbcStatus, ReconcilePhase};
use crate::tls::{self, CertificateError, CertificateOrder, CertificateState, Ensured};
use crate::writeback::{self, DesiredState, Routing};

use super::retry::{compute_backoff, ErrorKind};
use super::{ControllerContext, HostCollision};

/// Controller label on the reconcile counter
pub const CONTROLLER_NAME: &str = "kcp-glbc-ingress";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Ingress has no rules")]
    NoRules,

    #[error("Invalid Ingress: {0}")]
    Validation(#[from] ValidationError),

    #[error("Generated host {} is already held by {}", .0.host, .0.holder)]
    HostCollision(HostCollision),

    #[error("DNS provider error: {0}")]
    Dns(#[from] DnsProviderError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Failed to write Ingress: {0}")]
    Write(#[source] kube::Error),

    #[error("Certificate issuance queue closed")]
    IssuanceQueueClosed,

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<ReconcileError>>),
}

/// State accumulated by one pass
#[derive(Debug, Default)]
struct Pass {
    desired: DesiredState,
}

/// Host persisted on the Ingress, if any and well-formed
fn persisted_host(ingress: &Ingress) -> Option<GeneratedHost> {
    let raw = ingress
        .metadata
        .annotations
        .as_ref()?
        .get(annotations::GENERATED_HOST)?;
    match GeneratedHost::from_persisted(raw) {
        Ok(host) => Some(host),
        Err(e) => {
            warn!(host = %raw, error = %e, "Ignoring malformed generated host annotation");
            None
        }
    }
}

/// Host of the Ingress: the persisted one if present, so a base domain
/// change never moves an existing object.
fn assigned_host(ingress: &Ingress, identity: &ObjectIdentity, ctx: &ControllerContext) -> GeneratedHost {
    persisted_host(ingress).unwrap_or_else(|| generate(identity, &ctx.settings.base_domain))
}

/// Rules must exist, and every user host must be something a generated host
/// can stand in for.
fn validate_rules(ingress: &Ingress, host: &GeneratedHost) -> Result<(), ReconcileError> {
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .filter(|r| !r.is_empty())
        .ok_or(ReconcileError::NoRules)?;

    for rule_host in rules.iter().filter_map(|r| r.host.as_deref()) {
        if rule_host != host.as_str() {
            validate_rule_host(rule_host)?;
        }
    }
    Ok(())
}

async fn bounded<T, E>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
    timed_out: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(timed_out(limit)))
}

fn submit(ctx: &ControllerContext, order: CertificateOrder) -> Result<(), ReconcileError> {
    ctx.issuance
        .send(order)
        .map_err(|_| ReconcileError::IssuanceQueueClosed)
}

/// Drive the Ingress towards convergence, recording progress in `pass`.
async fn converge(
    ingress: &Ingress,
    identity: &ObjectIdentity,
    previous: &GlbcStatus,
    ctx: &ControllerContext,
    pass: &mut Pass,
) -> Result<(), ReconcileError> {
    let status = &mut pass.desired.status;

    let host = assigned_host(ingress, identity, ctx);
    ctx.hosts
        .claim(&host, identity)
        .map_err(ReconcileError::HostCollision)?;
    ctx.managed.insert(identity);
    pass.desired.host = Some(host.clone());
    status.phase = ReconcilePhase::HostAssigned;

    validate_rules(ingress, &host)?;

    let ready = placement::aggregate(ingress, &ctx.clusters);
    let routing = pass.desired.routing.insert(Routing {
        ready,
        tls_secret: None,
    });
    let limit = ctx.settings.call_timeout;

    let Some(record) = synthesize(
        identity,
        &host,
        &routing.ready,
        ctx.settings.dns.ttl,
        ctx.weight_policy.as_ref(),
    ) else {
        if status.dns_digest.is_some() {
            bounded(limit, ctx.dns.delete(identity, &host), DnsProviderError::Timeout).await?;
            info!(%host, "No ready clusters, DNS record removed");
            status.dns_digest = None;
            status.dns_condition = None;
        } else {
            debug!(%host, "No ready clusters");
        }
        return Ok(());
    };
    status.phase = ReconcilePhase::Placed;

    let digest = record.digest();
    if status.dns_digest.as_deref() != Some(digest.as_str()) {
        let outcome = bounded(limit, ctx.dns.upsert(&record), DnsProviderError::Timeout).await?;
        info!(
            %host,
            endpoints = record.endpoints.len(),
            reason = %outcome.reason,
            "DNS record published"
        );
        status.dns_digest = Some(digest);
        status.dns_condition = Some(outcome);
    } else {
        debug!(%host, "DNS record unchanged");
    }
    status.phase = ReconcilePhase::DnsSynced;

    if !status.admitted {
        if let Some(created) = ingress.metadata.creation_timestamp.as_ref() {
            let latency = (Utc::now() - created.0).to_std().unwrap_or_default();
            counters::record_admission(latency);
        }
        status.admitted = true;
    }

    if !ctx.settings.tls.enabled {
        status.certificate = None;
        status.phase = ReconcilePhase::Converged;
        return Ok(());
    }

    let secret_name = tls::secret_name(identity);
    if let Some(state) = previous.certificate.clone() {
        ctx.certificates.adopt(&host, identity, &secret_name, state);
    }

    // A failed certificate is only requested again once the user edits the object
    let edited = previous.observed_generation != ingress.metadata.generation;
    if edited {
        if let Some(order) = ctx.certificates.retry(&host) {
            submit(ctx, order)?;
        }
    }

    let state = match ctx.certificates.ensure(&host, identity, &secret_name)? {
        Ensured::Submit(order) => {
            submit(ctx, order)?;
            CertificateState::Pending
        }
        Ensured::Existing(state) => state,
    };

    if let CertificateState::Succeeded { secret } = &state {
        routing.tls_secret = Some(secret.clone());
    }
    status.phase = if state.is_terminal() {
        ReconcilePhase::Converged
    } else {
        ReconcilePhase::CertRequested
    };
    status.certificate = Some(state);
    Ok(())
}

/// Reconcile a live Ingress.
pub(crate) async fn apply(
    ingress: Arc<Ingress>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let identity = identity_of(&ingress).ok_or(ReconcileError::MissingField("metadata.name"))?;
    let previous = GlbcStatus::from_ingress(&ingress);

    let mut pass = Pass::default();
    pass.desired.status = GlbcStatus {
        last_error: None,
        observed_generation: ingress.metadata.generation,
        ..previous.clone()
    };

    let result = converge(&ingress, &identity, &previous, &ctx, &mut pass).await;

    if let Err(e) = &result {
        let kind = classify_error(e);
        // error_policy counts this failure after we return
        let attempt = ctx.retry_tracker.get(&identity.to_string()) + 1;
        if kind.surfaced(attempt) {
            pass.desired.status.last_error = Some(e.to_string());
        }
    }

    let mut patch = writeback::diff(&ingress, &pass.desired);
    if patch.changes_spec() {
        // Our own rewrite bumps the generation; it is not a user edit
        pass.desired.status.observed_generation = ingress.metadata.generation.map(|g| g + 1);
        patch = writeback::diff(&ingress, &pass.desired);
    }
    if !patch.is_empty() {
        let limit = ctx.settings.call_timeout;
        let written = bounded(limit, ctx.writer.write(&identity, &patch), |_| {
            kube::Error::Service(format!("Ingress write timed out after {limit:?}").into())
        })
        .await;
        match (written, &result) {
            (Ok(()), _) => debug!(phase = ?pass.desired.status.phase, "Ingress updated"),
            (Err(e), Ok(())) => return Err(ReconcileError::Write(e)),
            // The pass error is the one worth retrying on
            (Err(e), Err(_)) => warn!(error = %e, "Failed to record reconcile error"),
        }
    }

    result?;
    debug!(phase = ?pass.desired.status.phase, "Reconcile pass complete");
    Ok(Action::await_change())
}

/// Tear down everything published for a deleted Ingress.
pub(crate) async fn cleanup(
    ingress: Arc<Ingress>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let identity = identity_of(&ingress).ok_or(ReconcileError::MissingField("metadata.name"))?;
    let host = assigned_host(&ingress, &identity, &ctx);
    let limit = ctx.settings.call_timeout;

    bounded(limit, ctx.dns.delete(&identity, &host), DnsProviderError::Timeout).await?;

    let order = CertificateOrder {
        host: host.clone(),
        owner: identity.clone(),
        secret_name: tls::secret_name(&identity),
    };
    bounded(
        limit,
        ctx.certificate_provider.release(&order),
        CertificateError::Timeout,
    )
    .await?;
    ctx.certificates.release(&host, &identity);

    ctx.hosts.release(&host, &identity);
    ctx.managed.remove(&identity);
    ctx.retry_tracker.reset(&identity.to_string());

    info!(%host, "Ingress cleaned up");
    Ok(Action::await_change())
}

/// Reconcile a single Ingress resource
#[instrument(skip(ctx, ingress), fields(
    workspace = %tenant_of(&ingress.metadata),
    namespace = %ingress.metadata.namespace.as_deref().unwrap_or("default"),
    name = %ingress.metadata.name.as_deref().unwrap_or("unknown"),
))]
pub(crate) async fn reconcile(
    ingress: Arc<Ingress>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let namespace = ingress
        .namespace()
        .ok_or(ReconcileError::MissingField("metadata.namespace"))?;
    if ctx.settings.log_objects {
        debug!(object = ?ingress, "Reconciling Ingress");
    }

    let api: Api<Ingress> = Api::namespaced(ctx.kube_client.clone(), &namespace);
    let result = finalizer(&api, FINALIZER, ingress.clone(), |event| async {
        match event {
            Event::Apply(ingress) => apply(ingress, ctx.clone()).await,
            Event::Cleanup(ingress) => cleanup(ingress, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)));

    counters::record_reconcile(CONTROLLER_NAME, result.is_ok());
    if result.is_ok() {
        if let Some(identity) = identity_of(&ingress) {
            ctx.retry_tracker.reset(&identity.to_string());
        }
    }
    result
}

/// Classify error type for retry behavior
pub(crate) fn classify_error(error: &ReconcileError) -> ErrorKind {
    match error {
        ReconcileError::MissingField(_)
        | ReconcileError::NoRules
        | ReconcileError::Validation(_) => ErrorKind::Permanent,
        ReconcileError::HostCollision(_) => ErrorKind::Invariant,
        ReconcileError::Dns(DnsProviderError::Rejected { .. }) => ErrorKind::Provider,
        ReconcileError::Dns(_) => ErrorKind::Transient,
        ReconcileError::Certificate(CertificateError::Rejected { .. }) => ErrorKind::Provider,
        ReconcileError::Certificate(CertificateError::DuplicateRequest { .. }) => {
            ErrorKind::Invariant
        }
        ReconcileError::Certificate(_) => ErrorKind::Transient,
        ReconcileError::Write(_) | ReconcileError::IssuanceQueueClosed => ErrorKind::Transient,
        ReconcileError::Finalizer(inner) => match inner.as_ref() {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                classify_error(e)
            }
            finalizer::Error::UnnamedObject | finalizer::Error::InvalidFinalizer => {
                ErrorKind::Permanent
            }
            finalizer::Error::AddFinalizer(_) | finalizer::Error::RemoveFinalizer(_) => {
                ErrorKind::Transient
            }
        },
    }
}

/// Error policy for the controller with exponential backoff
fn error_policy(ingress: Arc<Ingress>, error: &ReconcileError, ctx: Arc<ControllerContext>) -> Action {
    let key = identity_of(&ingress)
        .map(|i| i.to_string())
        .or_else(|| ingress.metadata.uid.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&key);

    if kind == ErrorKind::Invariant {
        error!(object = %key, error = %error, "Invariant violated");
    } else {
        warn!(
            object = %key,
            error = %error,
            attempt = attempt,
            error_kind = ?kind,
            "Reconciliation error"
        );
    }

    compute_backoff(attempt, kind)
}

/// Run the Ingress controller.
///
/// `triggers` re-enqueues Ingresses on cluster readiness changes and
/// certificate completions. The WorkloadCluster watch runs alongside,
/// reading the controller's own cache to find affected Ingresses.
pub async fn run(ctx: Arc<ControllerContext>, triggers: mpsc::UnboundedReceiver<ObjectRef<Ingress>>) {
    let ingresses: Api<Ingress> = Api::all(ctx.kube_client.clone());

    let controller = Controller::new(ingresses, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(ctx.settings.workers))
        .reconcile_on(UnboundedReceiverStream::new(triggers));
    let store = controller.store();

    info!(
        workers = ctx.settings.workers,
        field_manager = FIELD_MANAGER,
        "Starting Ingress controller"
    );

    let reconciles = controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = ?e, "Ingress controller stream error");
            }
        });

    tokio::select! {
        _ = reconciles => info!("Ingress controller stopped"),
        _ = super::cluster::run(ctx.clone(), store) => warn!("WorkloadCluster watch stopped"),
    }
}
