//! Workload clusters and their readiness
//!
//! The directory is fed by the WorkloadCluster watch and read at the start of
//! every Ingress reconcile. It only answers "is this cluster ready"; which
//! clusters an Ingress is placed on comes from the Ingress itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::object::tenant_of;

/// WorkloadCluster spec (subset used by the operator)
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "workload.kcp.dev",
    version = "v1alpha1",
    kind = "WorkloadCluster",
    plural = "workloadclusters",
    status = "WorkloadClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterSpec {
    /// Cluster accepts no new placements
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    /// Last heartbeat written by the syncer
    pub last_syncer_heartbeat_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Readiness of one workload cluster as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterState {
    pub ready: bool,
    pub observed_at: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn from_cluster(cluster: &WorkloadCluster) -> Self {
        let status = cluster.status.as_ref();
        let ready = status
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            // Unschedulable clusters keep serving existing placements
            ready,
            observed_at: status.and_then(|s| s.last_syncer_heartbeat_time),
        }
    }
}

/// Readiness of every known cluster, keyed by (logical cluster, name)
#[derive(Debug, Default)]
pub struct ClusterDirectory {
    clusters: RwLock<HashMap<(String, String), ClusterState>>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest state of a cluster.
    ///
    /// Returns true if readiness changed, meaning every Ingress placed on the
    /// cluster has to be reconciled again. Heartbeat-only updates return false.
    pub fn observe(&self, cluster: &WorkloadCluster) -> bool {
        let Some(name) = cluster.metadata.name.clone() else {
            return false;
        };
        let key = (tenant_of(&cluster.metadata).to_string(), name);
        let state = ClusterState::from_cluster(cluster);

        let mut clusters = self.clusters.write();
        let previous = clusters.insert(key, state);
        previous.map(|p| p.ready) != Some(state.ready)
    }

    /// Record a deleted cluster as not ready.
    ///
    /// The entry stays as a tombstone: an unknown cluster is trusted to the
    /// scheduler's label, a deleted one must never serve traffic again.
    /// Returns true if readiness changed.
    pub fn remove(&self, cluster: &WorkloadCluster) -> bool {
        let Some(name) = cluster.metadata.name.clone() else {
            return false;
        };
        let key = (tenant_of(&cluster.metadata).to_string(), name);
        let tombstone = ClusterState {
            ready: false,
            observed_at: None,
        };

        let previous = self.clusters.write().insert(key, tombstone);
        previous.map(|p| p.ready) != Some(false)
    }

    pub fn state(&self, tenant: &str, cluster: &str) -> Option<ClusterState> {
        self.clusters
            .read()
            .get(&(tenant.to_string(), cluster.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }
}
