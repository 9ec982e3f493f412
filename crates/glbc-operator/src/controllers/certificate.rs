//! Certificate issuance worker and Certificate watch
//!
//! Orders queued by the Ingress controller are submitted to the certificate
//! provider here. Outcomes arrive through the Certificate watch and are fed
//! back to the coordinator, which re-enqueues the owning Ingress.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::Api;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::labels;
use crate::tls::cert_manager::{issuance_event, Certificate};
use crate::tls::{CertificateError, CertificateEvent, CertificateOrder};

use super::ControllerContext;

/// Feed an outcome to the coordinator and wake the owner.
pub(crate) fn complete(ctx: &ControllerContext, event: CertificateEvent) {
    if let Some(owner) = ctx.certificates.complete(event) {
        ctx.trigger.enqueue(&owner);
    }
}

/// Submit one order. A failed submission counts as a failed issuance.
pub(crate) async fn submit(ctx: &ControllerContext, order: CertificateOrder) {
    let limit = ctx.settings.call_timeout;
    let result = tokio::time::timeout(limit, ctx.certificate_provider.request(&order))
        .await
        .unwrap_or_else(|_| Err(CertificateError::Timeout(limit)));

    match result {
        Ok(()) => debug!(host = %order.host, "Certificate order submitted"),
        Err(e) => {
            warn!(host = %order.host, error = %e, "Certificate order failed");
            complete(
                ctx,
                CertificateEvent::Failed {
                    host: order.host,
                    message: e.to_string(),
                },
            );
        }
    }
}

/// Drain the order queue until every sender is gone.
pub async fn run_issuance(ctx: Arc<ControllerContext>, mut orders: mpsc::UnboundedReceiver<CertificateOrder>) {
    info!(issuer = ctx.certificates.issuer(), "Starting certificate issuance worker");

    while let Some(order) = orders.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move { submit(&ctx, order).await });
    }

    debug!("Certificate order queue closed");
}

/// Watch operator-managed Certificates and report their outcomes.
pub async fn watch_certificates(ctx: Arc<ControllerContext>) {
    let api: Api<Certificate> = Api::all(ctx.kube_client.clone());
    let selector = format!("{}={}", labels::MANAGED_BY, labels::MANAGED_BY_VALUE);

    info!("Starting Certificate watch");

    watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .applied_objects()
        .for_each(|certificate| {
            let ctx = ctx.clone();
            async move {
                match certificate {
                    Ok(certificate) => {
                        if let Some(event) = issuance_event(&certificate) {
                            complete(&ctx, event);
                        }
                    }
                    Err(e) => warn!(error = %e, "Certificate watch error"),
                }
            }
        })
        .await;
}

/// Run the issuance worker and the Certificate watch together.
pub async fn run(ctx: Arc<ControllerContext>, orders: mpsc::UnboundedReceiver<CertificateOrder>) {
    tokio::select! {
        _ = run_issuance(ctx.clone(), orders) => warn!("Certificate issuance worker stopped"),
        _ = watch_certificates(ctx.clone()) => warn!("Certificate watch stopped"),
    }
}
