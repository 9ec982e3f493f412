//! Weighted DNS record synthesis
//!
//! Turns the ready placements of an Ingress into one `A` endpoint per cluster
//! under the generated host. Output is canonical: endpoints are sorted by IP
//! so the same placements always produce the same record and digest.

use std::fmt;
use std::net::IpAddr;

use glbc_common::{GeneratedHost, ObjectIdentity};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::placement::ClusterPlacement;

pub const RECORD_TYPE_A: &str = "A";

/// Provider-specific property carrying the routing weight
pub const WEIGHT_PROPERTY: &str = "aws/weight";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderSpecificProperty {
    pub name: String,
    pub value: String,
}

/// A single published endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,
    pub targets: Vec<String>,
    pub record_type: String,
    #[serde(rename = "recordTTL")]
    pub record_ttl: i64,
    /// Distinguishes endpoints sharing the same name
    pub set_identifier: String,
    #[serde(default)]
    pub provider_specific: Vec<ProviderSpecificProperty>,
}

impl Endpoint {
    pub fn weight(&self) -> Option<u32> {
        self.provider_specific
            .iter()
            .find(|p| p.name == WEIGHT_PROPERTY)
            .and_then(|p| p.value.parse().ok())
    }
}

/// The full record for one Ingress
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    pub owner: ObjectIdentity,
    pub host: GeneratedHost,
    pub endpoints: Vec<Endpoint>,
}

impl DnsRecord {
    /// Stable fingerprint of the published content.
    ///
    /// Persisted on the Ingress so unchanged records are not rewritten, even
    /// after a restart.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        };

        field(self.host.as_str());
        for endpoint in &self.endpoints {
            field(&endpoint.dns_name);
            for target in &endpoint.targets {
                field(target);
            }
            field(&endpoint.record_type);
            field(&endpoint.record_ttl.to_string());
            field(&endpoint.set_identifier);
            for property in &endpoint.provider_specific {
                field(&property.name);
                field(&property.value);
            }
        }

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Assigns weights to `count` endpoints in canonical order.
pub trait WeightPolicy: Send + Sync + fmt::Debug {
    fn weights(&self, count: usize) -> Vec<u32>;
}

/// Smallest weight published; a zero weight would stop traffic to a ready
/// endpoint.
pub const MIN_WEIGHT: u32 = 1;

/// Same weight for every endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWeight(pub u32);

impl Default for FixedWeight {
    fn default() -> Self {
        Self(100)
    }
}

impl WeightPolicy for FixedWeight {
    fn weights(&self, count: usize) -> Vec<u32> {
        vec![self.0; count]
    }
}

/// Splits a total evenly; the remainder goes one unit at a time to the
/// first endpoints. No endpoint gets less than [`MIN_WEIGHT`], so the sum
/// exceeds `total` when there are more endpoints than units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvenSplit {
    pub total: u32,
}

impl WeightPolicy for EvenSplit {
    fn weights(&self, count: usize) -> Vec<u32> {
        if count == 0 {
            return Vec::new();
        }
        let count_u32 = u32::try_from(count).unwrap_or(u32::MAX);
        let base = self.total / count_u32;
        let remainder = (self.total % count_u32) as usize;
        (0..count)
            .map(|i| (base + u32::from(i < remainder)).max(MIN_WEIGHT))
            .collect()
    }
}

/// Build the record for a set of ready placements.
///
/// Returns `None` when no placement has an endpoint. Placements sharing an IP
/// collapse into one endpoint.
pub fn synthesize(
    owner: &ObjectIdentity,
    host: &GeneratedHost,
    placements: &[ClusterPlacement],
    ttl: u32,
    policy: &dyn WeightPolicy,
) -> Option<DnsRecord> {
    let mut ips: Vec<IpAddr> = placements
        .iter()
        .filter(|p| p.ready)
        .filter_map(|p| p.endpoint)
        .collect();
    ips.sort();
    ips.dedup();

    if ips.is_empty() {
        return None;
    }

    let mut weights = policy.weights(ips.len());
    if weights.len() != ips.len() {
        warn!(
            %host,
            endpoints = ips.len(),
            weights = weights.len(),
            "Weight policy returned the wrong number of weights"
        );
        weights.resize(ips.len(), MIN_WEIGHT);
    }
    let endpoints = ips
        .iter()
        .zip(weights.into_iter().map(|w| w.max(MIN_WEIGHT)))
        .map(|(ip, weight)| Endpoint {
            dns_name: host.to_string(),
            targets: vec![ip.to_string()],
            record_type: RECORD_TYPE_A.to_string(),
            record_ttl: i64::from(ttl),
            set_identifier: ip.to_string(),
            provider_specific: vec![ProviderSpecificProperty {
                name: WEIGHT_PROPERTY.to_string(),
                value: weight.to_string(),
            }],
        })
        .collect();

    Some(DnsRecord {
        owner: owner.clone(),
        host: host.clone(),
        endpoints,
    })
}
