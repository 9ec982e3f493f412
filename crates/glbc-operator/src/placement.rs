//! Placement aggregation
//!
//! Reads where an Ingress is scheduled from the labels and annotations the kcp
//! scheduler and syncers write on it, joins that with cluster readiness, and
//! reduces it to the set of clusters actually serving traffic.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::networking::v1::{Ingress, IngressStatus};
use tracing::warn;

use crate::cluster::ClusterDirectory;
use crate::config::{annotations, labels};
use crate::object::tenant_of;

/// One workload cluster an Ingress is placed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPlacement {
    pub cluster: String,
    pub ready: bool,
    pub endpoint: Option<IpAddr>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Clusters named in the Ingress's placement labels, with whether the
/// scheduler reports them as syncing.
fn scheduled_clusters(ingress: &Ingress) -> BTreeMap<String, bool> {
    let mut clusters = BTreeMap::new();
    let Some(object_labels) = ingress.metadata.labels.as_ref() else {
        return clusters;
    };

    if let Some(cluster) = object_labels
        .get(labels::LEGACY_CLUSTER)
        .filter(|c| !c.is_empty())
    {
        clusters.insert(cluster.clone(), true);
    }

    for (key, value) in object_labels {
        if let Some(cluster) = key.strip_prefix(labels::CLUSTER_STATE_PREFIX) {
            if !cluster.is_empty() {
                clusters.insert(cluster.to_string(), value == labels::STATE_SYNC);
            }
        }
    }

    clusters
}

/// Load balancer IP reported by one cluster's syncer.
fn reported_endpoint(ingress: &Ingress, cluster: &str) -> Option<IpAddr> {
    let key = format!("{}{}", annotations::CLUSTER_STATUS_PREFIX, cluster);
    let raw = ingress.metadata.annotations.as_ref()?.get(&key)?;

    let status: IngressStatus = match serde_json::from_str(raw) {
        Ok(status) => status,
        Err(e) => {
            warn!(cluster, error = %e, "Ignoring malformed cluster status annotation");
            return None;
        }
    };

    // Hostname-only load balancers cannot back an A record
    status
        .load_balancer?
        .ingress?
        .into_iter()
        .find_map(|lb| lb.ip.and_then(|ip| ip.parse().ok()))
}

/// Every cluster the Ingress is placed on, ready or not.
///
/// A cluster the directory has never seen is trusted to the scheduler's
/// label; a cluster the directory knows to be unready is never ready.
pub fn placements(ingress: &Ingress, directory: &ClusterDirectory) -> Vec<ClusterPlacement> {
    let tenant = tenant_of(&ingress.metadata);

    scheduled_clusters(ingress)
        .into_iter()
        .map(|(cluster, syncing)| {
            let state = directory.state(tenant, &cluster);
            ClusterPlacement {
                ready: syncing && state.map_or(true, |s| s.ready),
                endpoint: reported_endpoint(ingress, &cluster),
                observed_at: state.and_then(|s| s.observed_at),
                cluster,
            }
        })
        .collect()
}

/// Placements that are ready and have an endpoint.
pub fn aggregate(ingress: &Ingress, directory: &ClusterDirectory) -> Vec<ClusterPlacement> {
    placements(ingress, directory)
        .into_iter()
        .filter(|p| p.ready && p.endpoint.is_some())
        .collect()
}

/// Whether the Ingress is placed on the named cluster at all.
pub fn references_cluster(ingress: &Ingress, cluster: &str) -> bool {
    scheduled_clusters(ingress).contains_key(cluster)
}
