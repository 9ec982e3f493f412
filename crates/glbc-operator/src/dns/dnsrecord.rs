//! `DNSRecord` custom resource and the provider that writes it

use std::collections::BTreeMap;

use async_trait::async_trait;
use glbc_common::{GeneratedHost, ObjectIdentity};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::record::{DnsRecord, Endpoint};
use super::{DnsProvider, DnsProviderError, ProviderOutcome};
use crate::config::{annotations, labels, FIELD_MANAGER};
use crate::object::scoped_name;

/// DNSRecord spec: the complete endpoint set for one host
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kuadrant.dev",
    version = "v1",
    kind = "DNSRecord",
    plural = "dnsrecords",
    namespaced = true,
    status = "DNSRecordStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.endpoints[0].dnsName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordSpec {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordStatus {
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub zones: Vec<DNSZoneStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSZoneStatus {
    pub dns_zone: DNSZone,
    #[serde(default)]
    pub conditions: Vec<DNSZoneCondition>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DNSZone {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSZoneCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Option<String>,
    pub observed_generation: Option<i64>,
}

impl DNSZoneCondition {
    /// The zone's `Failed` condition, false when the provider succeeded
    pub fn failed(failed: bool, outcome: &ProviderOutcome, generation: Option<i64>) -> Self {
        Self {
            type_: "Failed".to_string(),
            status: if failed { "True" } else { "False" }.to_string(),
            reason: outcome.reason.clone(),
            message: outcome.message.clone(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            observed_generation: generation,
        }
    }
}

/// Name of the DNSRecord owned by an Ingress
pub fn resource_name(owner: &ObjectIdentity) -> String {
    scoped_name(owner, &owner.name)
}

/// Build the resource for a synthesized record.
pub fn to_resource(record: &DnsRecord) -> DNSRecord {
    let mut resource = DNSRecord::new(
        &resource_name(&record.owner),
        DNSRecordSpec {
            endpoints: record.endpoints.clone(),
        },
    );
    resource.metadata.namespace = Some(record.owner.namespace.clone());
    resource.metadata.labels = Some(BTreeMap::from([(
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_VALUE.to_string(),
    )]));
    resource.metadata.annotations = Some(BTreeMap::from([
        (
            annotations::GENERATED_HOST.to_string(),
            record.host.to_string(),
        ),
        (
            annotations::LOGICAL_CLUSTER.to_string(),
            record.owner.tenant.clone(),
        ),
    ]));
    resource
}

fn map_api_error(host: &str, error: kube::Error) -> DnsProviderError {
    match error {
        kube::Error::Api(response) if matches!(response.code, 400 | 403 | 422) => {
            DnsProviderError::Rejected {
                host: host.to_string(),
                reason: response.message,
            }
        }
        other => DnsProviderError::Unavailable(other.to_string()),
    }
}

/// Stores records as `DNSRecord` resources in the Ingress namespace.
///
/// The resource carries the Ingress name; after a successful write the
/// provider records the outcome as the zone's `Failed=False` condition.
#[derive(Clone)]
pub struct KubeDnsProvider {
    client: Client,
    zone_id: String,
}

impl KubeDnsProvider {
    pub fn new(client: Client, zone_id: impl Into<String>) -> Self {
        Self {
            client,
            zone_id: zone_id.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DNSRecord> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DnsProvider for KubeDnsProvider {
    #[instrument(skip_all, fields(host = %record.host, endpoints = record.endpoints.len()))]
    async fn upsert(&self, record: &DnsRecord) -> Result<ProviderOutcome, DnsProviderError> {
        let api = self.api(&record.owner.namespace);
        let name = resource_name(&record.owner);
        let host = record.host.as_str();

        let applied = api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&to_resource(record)),
            )
            .await
            .map_err(|e| map_api_error(host, e))?;

        let outcome = ProviderOutcome::success();
        let generation = applied.metadata.generation;
        let status = DNSRecordStatus {
            observed_generation: generation,
            zones: vec![DNSZoneStatus {
                dns_zone: DNSZone {
                    id: self.zone_id.clone(),
                },
                conditions: vec![DNSZoneCondition::failed(false, &outcome, generation)],
            }],
        };
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await
        .map_err(|e| map_api_error(host, e))?;

        debug!("DNSRecord applied");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(owner = %owner, host = %host))]
    async fn delete(
        &self,
        owner: &ObjectIdentity,
        host: &GeneratedHost,
    ) -> Result<(), DnsProviderError> {
        match self
            .api(&owner.namespace)
            .delete(&resource_name(owner), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!("DNSRecord deleted");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("DNSRecord already absent");
                Ok(())
            }
            Err(e) => Err(map_api_error(host.as_str(), e)),
        }
    }

    async fn check_readiness(&self) -> Result<bool, DnsProviderError> {
        let api: Api<DNSRecord> = Api::all(self.client.clone());
        api.list_metadata(&ListParams::default().limit(1))
            .await
            .map(|_| true)
            .map_err(|e| DnsProviderError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::record::{synthesize, FixedWeight};
    use crate::placement::ClusterPlacement;
    use kube::core::ErrorResponse;

    fn record() -> DnsRecord {
        let owner = ObjectIdentity::new("root:acme", "default", "echo");
        let host = GeneratedHost::from_persisted("abc.hcpapps.net").unwrap();
        let placements = [ClusterPlacement {
            cluster: "us-east".to_string(),
            ready: true,
            endpoint: Some("10.0.0.1".parse().unwrap()),
            observed_at: None,
        }];
        synthesize(&owner, &host, &placements, 60, &FixedWeight::default()).unwrap()
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "denied".to_string(),
            reason: "Forbidden".to_string(),
            code,
        })
    }

    #[test]
    fn test_to_resource() {
        let resource = to_resource(&record());

        assert_eq!(
            resource.metadata.name,
            Some(resource_name(&ObjectIdentity::new("root:acme", "default", "echo")))
        );
        assert_eq!(resource.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(resource.spec.endpoints.len(), 1);
        assert_eq!(
            resource
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(annotations::GENERATED_HOST))
                .map(String::as_str),
            Some("abc.hcpapps.net")
        );

        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["apiVersion"], "kuadrant.dev/v1");
        assert_eq!(json["kind"], "DNSRecord");
        assert_eq!(json["spec"]["endpoints"][0]["recordType"], "A");
    }

    #[test]
    fn test_records_of_different_workspaces_do_not_share_a_resource() {
        let root = ObjectIdentity::new("root", "default", "echo");
        let acme = ObjectIdentity::new("root:acme", "default", "echo");
        let other = ObjectIdentity::new("root:other", "default", "echo");

        assert_eq!(resource_name(&root), "echo");
        assert_ne!(resource_name(&acme), resource_name(&root));
        assert_ne!(resource_name(&acme), resource_name(&other));
    }

    #[test]
    fn test_failed_condition_on_success() {
        let condition = DNSZoneCondition::failed(false, &ProviderOutcome::success(), Some(1));
        assert_eq!(condition.type_, "Failed");
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, "ProviderSuccess");
    }

    #[test]
    fn test_map_api_error() {
        assert!(matches!(
            map_api_error("abc.hcpapps.net", api_error(403)),
            DnsProviderError::Rejected { .. }
        ));
        assert!(matches!(
            map_api_error("abc.hcpapps.net", api_error(503)),
            DnsProviderError::Unavailable(_)
        ));
    }

    #[test]
    fn test_deserialize_status() {
        let yaml = r#"
observedGeneration: 2
zones:
  - dnsZone:
      id: Z0123
    conditions:
      - type: Failed
        status: "False"
        reason: ProviderSuccess
        message: The DNS provider succeeded in ensuring the record
"#;
        let status: DNSRecordStatus = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(status.zones[0].dns_zone.id, "Z0123");
        assert_eq!(status.zones[0].conditions[0].reason, "ProviderSuccess");
    }
}
