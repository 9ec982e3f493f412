//! WorkloadCluster watch
//!
//! Keeps the cluster directory current and re-enqueues every Ingress placed
//! on a cluster whose readiness changed.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use crate::cluster::WorkloadCluster;
use crate::object::{identity_of, tenant_of};
use crate::placement::references_cluster;

use super::ControllerContext;

/// Enqueue the Ingresses in the cluster's workspace that are placed on it.
/// Returns how many were enqueued.
fn fan_out(ctx: &ControllerContext, ingresses: &[Arc<Ingress>], cluster: &WorkloadCluster) -> usize {
    let tenant = tenant_of(&cluster.metadata);
    let name = cluster.name_any();

    let mut enqueued = 0;
    for ingress in ingresses {
        if tenant_of(&ingress.metadata) != tenant || !references_cluster(ingress, &name) {
            continue;
        }
        if let Some(identity) = identity_of(ingress) {
            ctx.trigger.enqueue(&identity);
            enqueued += 1;
        }
    }

    info!(
        workspace = tenant,
        cluster = %name,
        ingresses = enqueued,
        "Cluster readiness changed"
    );
    enqueued
}

/// Apply one watch event. Returns how many Ingresses were enqueued.
pub(crate) fn handle_event(
    ctx: &ControllerContext,
    ingresses: &[Arc<Ingress>],
    event: Event<WorkloadCluster>,
) -> usize {
    match event {
        Event::Apply(cluster) | Event::InitApply(cluster) => {
            if ctx.clusters.observe(&cluster) {
                fan_out(ctx, ingresses, &cluster)
            } else {
                debug!(cluster = %cluster.name_any(), "Cluster heartbeat");
                0
            }
        }
        Event::Delete(cluster) => {
            if ctx.clusters.remove(&cluster) {
                fan_out(ctx, ingresses, &cluster)
            } else {
                0
            }
        }
        Event::Init | Event::InitDone => 0,
    }
}

/// Watch WorkloadClusters until the stream ends.
pub async fn run(ctx: Arc<ControllerContext>, ingresses: Store<Ingress>) {
    let api: Api<WorkloadCluster> = Api::all(ctx.kube_client.clone());

    info!("Starting WorkloadCluster watch");

    watcher(api, watcher::Config::default())
        .default_backoff()
        .for_each(|event| {
            let ctx = ctx.clone();
            let ingresses = ingresses.clone();
            async move {
                match event {
                    Ok(event) => {
                        handle_event(&ctx, &ingresses.state(), event);
                    }
                    Err(e) => warn!(error = %e, "WorkloadCluster watch error"),
                }
            }
        })
        .await;
}
