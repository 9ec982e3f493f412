//! DNS publishing
//!
//! [`record`] builds the weighted record for an Ingress; a [`DnsProvider`]
//! makes it durable. The Kubernetes-backed provider in [`dnsrecord`] stores
//! each record as a `DNSRecord` custom resource next to its Ingress.

pub mod dnsrecord;
pub mod record;

use std::time::Duration;

use async_trait::async_trait;
use glbc_common::{GeneratedHost, ObjectIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dnsrecord::KubeDnsProvider;
pub use record::{synthesize, DnsRecord, Endpoint, WeightPolicy};

/// Reason reported when the provider accepted a record
pub const PROVIDER_SUCCESS_REASON: &str = "ProviderSuccess";
pub const PROVIDER_SUCCESS_MESSAGE: &str = "The DNS provider succeeded in ensuring the record";

#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Backend could not be reached; retry with backoff
    #[error("DNS backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the record
    #[error("DNS backend rejected record for {host}: {reason}")]
    Rejected { host: String, reason: String },

    #[error("DNS call timed out after {0:?}")]
    Timeout(Duration),
}

/// Provider-reported result of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub reason: String,
    pub message: String,
}

impl ProviderOutcome {
    pub fn success() -> Self {
        Self {
            reason: PROVIDER_SUCCESS_REASON.to_string(),
            message: PROVIDER_SUCCESS_MESSAGE.to_string(),
        }
    }
}

/// Durable store for published records.
///
/// Both operations are idempotent: upserting an identical record and deleting
/// an absent one succeed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Replace the whole endpoint set of the record.
    async fn upsert(&self, record: &DnsRecord) -> Result<ProviderOutcome, DnsProviderError>;

    /// Remove the record published for `owner` under `host`.
    async fn delete(
        &self,
        owner: &ObjectIdentity,
        host: &GeneratedHost,
    ) -> Result<(), DnsProviderError>;

    /// Whether the backend is reachable.
    async fn check_readiness(&self) -> Result<bool, DnsProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_outcome() {
        let outcome = ProviderOutcome::success();
        assert_eq!(outcome.reason, "ProviderSuccess");
        assert_eq!(
            outcome.message,
            "The DNS provider succeeded in ensuring the record"
        );
    }

    #[test]
    fn test_error_display() {
        let err = DnsProviderError::Rejected {
            host: "abc.hcpapps.net".to_string(),
            reason: "zone is read-only".to_string(),
        };
        assert!(err.to_string().contains("abc.hcpapps.net"));
        assert!(err.to_string().contains("zone is read-only"));

        let err = DnsProviderError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
