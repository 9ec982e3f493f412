//! Reconcile status persisted on the Ingress
//!
//! The status lives in a JSON annotation so it survives restarts and can be
//! read back to skip work that was already done.

use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::annotations;
use crate::dns::ProviderOutcome;
use crate::tls::CertificateState;

/// How far an Ingress has progressed. Recomputed on every pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReconcilePhase {
    #[default]
    Observed,
    HostAssigned,
    Placed,
    DnsSynced,
    CertRequested,
    Converged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlbcStatus {
    pub phase: ReconcilePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateState>,

    /// Digest of the last record the provider accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_condition: Option<ProviderOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Set once the admission latency has been recorded
    #[serde(default)]
    pub admitted: bool,
}

impl GlbcStatus {
    /// Status persisted on the Ingress, or the default if absent or unreadable.
    pub fn from_ingress(ingress: &Ingress) -> Self {
        let Some(raw) = ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::STATUS))
        else {
            return Self::default();
        };

        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable status annotation");
            Self::default()
        })
    }

    pub fn to_annotation(&self) -> String {
        // Plain strings and enums only
        serde_json::to_string(self).unwrap_or_default()
    }
}
