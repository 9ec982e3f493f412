//! cert-manager backed certificate provider
//!
//! Each order becomes a `cert-manager.io/v1` Certificate named after the
//! secret. cert-manager reports progress through the Certificate's
//! conditions, which the certificate watch maps back to events.

use std::collections::BTreeMap;

use async_trait::async_trait;
use glbc_common::GeneratedHost;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{CertificateError, CertificateEvent, CertificateOrder, CertificateProvider};
use crate::config::{annotations, labels, FIELD_MANAGER};

/// Certificate spec (subset written by the operator)
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced = true,
    status = "CertificateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
    pub not_after: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

fn condition<'a>(cert: &'a Certificate, type_: &str) -> Option<&'a CertificateCondition> {
    cert.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
}

/// Map a Certificate's conditions to an issuance outcome.
///
/// `Ready=True` means issued; `Issuing=False` with reason `Failed` means the
/// attempt failed. Anything else is still in flight.
pub fn issuance_event(cert: &Certificate) -> Option<CertificateEvent> {
    let host = cert
        .metadata
        .annotations
        .as_ref()?
        .get(annotations::GENERATED_HOST)
        .and_then(|h| GeneratedHost::from_persisted(h).ok())?;

    if condition(cert, "Ready").is_some_and(|c| c.status == "True") {
        return Some(CertificateEvent::Issued {
            host,
            secret: cert.spec.secret_name.clone(),
        });
    }

    let issuing = condition(cert, "Issuing")?;
    if issuing.status == "False" && issuing.reason.as_deref() == Some("Failed") {
        return Some(CertificateEvent::Failed {
            host,
            message: issuing
                .message
                .clone()
                .unwrap_or_else(|| "certificate issuance failed".to_string()),
        });
    }

    None
}

fn map_api_error(order: &CertificateOrder, error: kube::Error) -> CertificateError {
    match error {
        kube::Error::Api(response) if matches!(response.code, 400 | 403 | 422) => {
            CertificateError::Rejected {
                host: order.host.to_string(),
                reason: response.message,
            }
        }
        other => CertificateError::Unavailable(other.to_string()),
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Issues certificates through a cert-manager issuer
#[derive(Clone)]
pub struct CertManagerProvider {
    client: Client,
    issuer: String,
    issuer_kind: String,
}

impl CertManagerProvider {
    pub fn new(client: Client, issuer: impl Into<String>, issuer_kind: impl Into<String>) -> Self {
        Self {
            client,
            issuer: issuer.into(),
            issuer_kind: issuer_kind.into(),
        }
    }

    /// Certificate resource for an order
    pub fn to_resource(&self, order: &CertificateOrder) -> Certificate {
        let mut cert = Certificate::new(
            &order.secret_name,
            CertificateSpec {
                secret_name: order.secret_name.clone(),
                dns_names: vec![order.host.to_string()],
                issuer_ref: IssuerRef {
                    name: self.issuer.clone(),
                    kind: self.issuer_kind.clone(),
                    group: "cert-manager.io".to_string(),
                },
            },
        );
        cert.metadata.namespace = Some(order.owner.namespace.clone());
        cert.metadata.labels = Some(BTreeMap::from([(
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        )]));
        cert.metadata.annotations = Some(BTreeMap::from([
            (annotations::GENERATED_HOST.to_string(), order.host.to_string()),
            (
                annotations::LOGICAL_CLUSTER.to_string(),
                order.owner.tenant.clone(),
            ),
        ]));
        cert
    }
}

#[async_trait]
impl CertificateProvider for CertManagerProvider {
    #[instrument(skip_all, fields(host = %order.host, secret = %order.secret_name))]
    async fn request(&self, order: &CertificateOrder) -> Result<(), CertificateError> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), &order.owner.namespace);
        api.patch(
            &order.secret_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&self.to_resource(order)),
        )
        .await
        .map_err(|e| map_api_error(order, e))?;

        debug!("Certificate applied");
        Ok(())
    }

    #[instrument(skip_all, fields(host = %order.host, secret = %order.secret_name))]
    async fn release(&self, order: &CertificateOrder) -> Result<(), CertificateError> {
        let namespace = &order.owner.namespace;
        let certificates: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        match certificates
            .delete(&order.secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(map_api_error(order, e)),
        }

        // cert-manager leaves the secret behind when the Certificate goes
        match secrets
            .delete(&order.secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(map_api_error(order, e)),
        }

        debug!("Certificate and secret released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glbc_common::ObjectIdentity;

    fn order() -> CertificateOrder {
        CertificateOrder {
            host: GeneratedHost::from_persisted("abc.hcpapps.net").unwrap(),
            owner: ObjectIdentity::new("root:acme", "default", "echo"),
            secret_name: "hcg-tls-echo".to_string(),
        }
    }

    fn certificate(conditions: &[(&str, &str, Option<&str>)]) -> Certificate {
        Certificate {
            metadata: kube::api::ObjectMeta {
                name: Some("hcg-tls-echo".to_string()),
                annotations: Some(BTreeMap::from([(
                    annotations::GENERATED_HOST.to_string(),
                    "abc.hcpapps.net".to_string(),
                )])),
                ..Default::default()
            },
            spec: CertificateSpec {
                secret_name: "hcg-tls-echo".to_string(),
                dns_names: vec!["abc.hcpapps.net".to_string()],
                issuer_ref: IssuerRef {
                    name: "glbc-ca".to_string(),
                    kind: "ClusterIssuer".to_string(),
                    group: "cert-manager.io".to_string(),
                },
            },
            status: Some(CertificateStatus {
                conditions: conditions
                    .iter()
                    .map(|(type_, status, reason)| CertificateCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        reason: reason.map(str::to_string),
                        message: Some("issuer said no".to_string()),
                    })
                    .collect(),
                not_after: None,
            }),
        }
    }

    #[test]
    fn test_ready_certificate_is_issued() {
        let event = issuance_event(&certificate(&[("Ready", "True", Some("Ready"))]));
        assert_eq!(
            event,
            Some(CertificateEvent::Issued {
                host: GeneratedHost::from_persisted("abc.hcpapps.net").unwrap(),
                secret: "hcg-tls-echo".to_string(),
            })
        );
    }

    #[test]
    fn test_failed_issuing_condition() {
        let event = issuance_event(&certificate(&[
            ("Ready", "False", Some("DoesNotExist")),
            ("Issuing", "False", Some("Failed")),
        ]));
        assert!(matches!(
            event,
            Some(CertificateEvent::Failed { ref message, .. }) if message == "issuer said no"
        ));
    }

    #[test]
    fn test_in_flight_certificate_has_no_event() {
        assert!(issuance_event(&certificate(&[
            ("Ready", "False", Some("DoesNotExist")),
            ("Issuing", "True", Some("Requested")),
        ]))
        .is_none());
        assert!(issuance_event(&certificate(&[])).is_none());

        let mut unannotated = certificate(&[("Ready", "True", None)]);
        unannotated.metadata.annotations = None;
        assert!(issuance_event(&unannotated).is_none());
    }

    #[tokio::test]
    async fn test_to_resource() {
        let cert = CertManagerProvider::new(
            crate::testing::mock_kube_client(),
            "glbc-ca",
            "ClusterIssuer",
        )
        .to_resource(&order());

        assert_eq!(cert.metadata.name.as_deref(), Some("hcg-tls-echo"));
        assert_eq!(cert.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(cert.spec.dns_names, vec!["abc.hcpapps.net"]);
        assert_eq!(cert.spec.issuer_ref.name, "glbc-ca");

        let json = serde_json::to_value(&cert).unwrap();
        assert_eq!(json["apiVersion"], "cert-manager.io/v1");
        assert_eq!(json["spec"]["secretName"], "hcg-tls-echo");
    }
}
