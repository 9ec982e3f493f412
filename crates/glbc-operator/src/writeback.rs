//! Ingress write-back
//!
//! The engine describes what the Ingress should look like in a
//! [`DesiredState`]; [`diff`] reduces it to the fields that actually differ so
//! a converged object produces an empty patch and no API call.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use glbc_common::{GeneratedHost, ObjectIdentity};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressRule, IngressTLS,
};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::config::{annotations, labels, FIELD_MANAGER};
use crate::placement::ClusterPlacement;
use crate::status::GlbcStatus;

/// What the engine wants the Ingress to carry after a pass
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub status: GlbcStatus,
    /// Set once a host is assigned
    pub host: Option<GeneratedHost>,
    /// Set once the Ingress is known to be valid
    pub routing: Option<Routing>,
}

/// Routing fields written on a valid Ingress
#[derive(Debug, Clone, Default)]
pub struct Routing {
    /// Ready placements with an endpoint
    pub ready: Vec<ClusterPlacement>,
    /// Secret to reference from the TLS block, once issued
    pub tls_secret: Option<String>,
}

/// Changes to apply to one Ingress. Empty when nothing differs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressPatch {
    pub annotations: BTreeMap<String, String>,
    /// `None` removes the label
    pub labels: BTreeMap<String, Option<String>>,
    pub rules: Option<Vec<IngressRule>>,
    pub tls: Option<Vec<IngressTLS>>,
    pub load_balancer: Option<Vec<IngressLoadBalancerIngress>>,
}

impl IngressPatch {
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
            && self.labels.is_empty()
            && self.rules.is_none()
            && self.tls.is_none()
            && self.load_balancer.is_none()
    }

    /// Whether applying the patch changes the Ingress spec, which bumps
    /// `metadata.generation` by one.
    pub fn changes_spec(&self) -> bool {
        self.rules.is_some() || self.tls.is_some()
    }

    /// JSON merge patch for metadata and spec, if any of them changed.
    pub fn metadata_patch(&self) -> Option<Value> {
        let mut metadata = Map::new();
        if !self.annotations.is_empty() {
            metadata.insert("annotations".to_string(), json!(self.annotations));
        }
        if !self.labels.is_empty() {
            metadata.insert("labels".to_string(), json!(self.labels));
        }

        let mut spec = Map::new();
        if let Some(rules) = &self.rules {
            spec.insert("rules".to_string(), json!(rules));
        }
        if let Some(tls) = &self.tls {
            spec.insert("tls".to_string(), json!(tls));
        }

        if metadata.is_empty() && spec.is_empty() {
            return None;
        }

        let mut patch = Map::new();
        if !metadata.is_empty() {
            patch.insert("metadata".to_string(), Value::Object(metadata));
        }
        if !spec.is_empty() {
            patch.insert("spec".to_string(), Value::Object(spec));
        }
        Some(Value::Object(patch))
    }

    /// JSON merge patch for the status subresource, if the load balancer changed.
    pub fn status_patch(&self) -> Option<Value> {
        self.load_balancer.as_ref().map(|ingress| {
            json!({ "status": { "loadBalancer": { "ingress": ingress } } })
        })
    }
}

fn current_annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// User hosts replaced so far: those already recorded plus any rule host
/// that is not the generated one.
fn replaced_hosts(ingress: &Ingress, host: &GeneratedHost) -> BTreeSet<String> {
    let mut replaced: BTreeSet<String> = current_annotation(ingress, annotations::CUSTOM_HOSTS_REPLACED)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
        .into_iter()
        .collect();

    replaced.extend(
        rules(ingress)
            .iter()
            .filter_map(|r| r.host.as_deref())
            .filter(|h| !h.is_empty() && *h != host.as_str())
            .map(str::to_string),
    );
    replaced
}

fn rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_deref())
        .unwrap_or_default()
}

/// Compute the patch that takes `current` to `desired`.
pub fn diff(current: &Ingress, desired: &DesiredState) -> IngressPatch {
    let mut patch = IngressPatch::default();

    let status = desired.status.to_annotation();
    if current_annotation(current, annotations::STATUS) != Some(status.as_str()) {
        patch
            .annotations
            .insert(annotations::STATUS.to_string(), status);
    }

    let Some(host) = &desired.host else {
        return patch;
    };
    if current_annotation(current, annotations::GENERATED_HOST) != Some(host.as_str()) {
        patch
            .annotations
            .insert(annotations::GENERATED_HOST.to_string(), host.to_string());
    }

    if let Some(routing) = &desired.routing {
        diff_routing(current, host, routing, &mut patch);
    }
    patch
}

fn diff_routing(current: &Ingress, host: &GeneratedHost, routing: &Routing, patch: &mut IngressPatch) {
    let replaced = replaced_hosts(current, host);
    if !replaced.is_empty() {
        let value = json!(replaced).to_string();
        if current_annotation(current, annotations::CUSTOM_HOSTS_REPLACED) != Some(value.as_str()) {
            patch
                .annotations
                .insert(annotations::CUSTOM_HOSTS_REPLACED.to_string(), value);
        }
    }

    let wanted: BTreeSet<String> = routing
        .ready
        .iter()
        .map(|p| format!("{}{}", labels::PLACEMENT_PREFIX, p.cluster))
        .collect();
    let existing = current.metadata.labels.clone().unwrap_or_default();
    for key in &wanted {
        if existing.get(key).map(String::as_str) != Some(labels::PLACEMENT_READY) {
            patch
                .labels
                .insert(key.clone(), Some(labels::PLACEMENT_READY.to_string()));
        }
    }
    for key in existing.keys() {
        if key.starts_with(labels::PLACEMENT_PREFIX) && !wanted.contains(key) {
            patch.labels.insert(key.clone(), None);
        }
    }

    let current_rules = rules(current);
    let rewritten: Vec<IngressRule> = current_rules
        .iter()
        .cloned()
        .map(|mut rule| {
            rule.host = Some(host.to_string());
            rule
        })
        .collect();
    if rewritten.as_slice() != current_rules {
        patch.rules = Some(rewritten);
    }

    if let Some(secret) = &routing.tls_secret {
        let tls = vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: Some(secret.clone()),
        }];
        let current_tls = current.spec.as_ref().and_then(|s| s.tls.as_ref());
        if current_tls != Some(&tls) {
            patch.tls = Some(tls);
        }
    }

    let mut ips: Vec<_> = routing.ready.iter().filter_map(|p| p.endpoint).collect();
    ips.sort();
    let load_balancer: Vec<IngressLoadBalancerIngress> = ips
        .into_iter()
        .map(|ip| IngressLoadBalancerIngress {
            ip: Some(ip.to_string()),
            ..Default::default()
        })
        .collect();
    let current_lb = current
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default();
    if current_lb != load_balancer {
        patch.load_balancer = Some(load_balancer);
    }
}

/// Applies patches to Ingresses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngressWriter: Send + Sync {
    async fn write(&self, owner: &ObjectIdentity, patch: &IngressPatch) -> Result<(), kube::Error>;
}

/// Writes through the Kubernetes API with merge patches
#[derive(Clone)]
pub struct KubeIngressWriter {
    client: Client,
}

impl KubeIngressWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressWriter for KubeIngressWriter {
    #[instrument(skip_all, fields(namespace = %owner.namespace, name = %owner.name))]
    async fn write(&self, owner: &ObjectIdentity, patch: &IngressPatch) -> Result<(), kube::Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &owner.namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        if let Some(body) = patch.metadata_patch() {
            api.patch(&owner.name, &params, &Patch::Merge(&body)).await?;
        }
        if let Some(body) = patch.status_patch() {
            api.patch_status(&owner.name, &params, &Patch::Merge(&body))
                .await?;
        }

        debug!(
            annotations = patch.annotations.len(),
            labels = patch.labels.len(),
            "Ingress patched"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::status::ReconcilePhase;
    use k8s_openapi::api::networking::v1::{
        IngressLoadBalancerStatus, IngressSpec, IngressStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn host() -> GeneratedHost {
        GeneratedHost::from_persisted("abc.hcpapps.net").unwrap()
    }

    fn ready(cluster: &str, ip: &str) -> ClusterPlacement {
        ClusterPlacement {
            cluster: cluster.to_string(),
            ready: true,
            endpoint: Some(ip.parse().unwrap()),
            observed_at: None,
        }
    }

    fn ingress(rule_hosts: &[&str]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("echo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    rule_hosts
                        .iter()
                        .map(|h| IngressRule {
                            host: Some(h.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn desired(placements: Vec<ClusterPlacement>, tls_secret: Option<&str>) -> DesiredState {
        DesiredState {
            status: GlbcStatus {
                phase: ReconcilePhase::DnsSynced,
                ..Default::default()
            },
            host: Some(host()),
            routing: Some(Routing {
                ready: placements,
                tls_secret: tls_secret.map(str::to_string),
            }),
        }
    }

    /// Apply a patch the way the API server's merge patch would
    pub(crate) fn apply(mut ingress: Ingress, patch: &IngressPatch) -> Ingress {
        let annotations = ingress.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.extend(patch.annotations.clone());

        let object_labels = ingress.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in &patch.labels {
            match value {
                Some(v) => {
                    object_labels.insert(key.clone(), v.clone());
                }
                None => {
                    object_labels.remove(key);
                }
            }
        }

        // The API server bumps the generation on spec changes
        if patch.changes_spec() {
            ingress.metadata.generation = ingress.metadata.generation.map(|g| g + 1);
        }

        let spec = ingress.spec.get_or_insert_with(Default::default);
        if let Some(rules) = &patch.rules {
            spec.rules = Some(rules.clone());
        }
        if let Some(tls) = &patch.tls {
            spec.tls = Some(tls.clone());
        }
        if let Some(lb) = &patch.load_balancer {
            ingress.status = Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus {
                    ingress: Some(lb.clone()),
                }),
            });
        }
        ingress
    }

    #[test]
    fn test_first_pass_writes_everything() {
        let current = ingress(&["echo.example.com"]);
        let patch = diff(
            &current,
            &desired(vec![ready("us-east", "10.0.0.2"), ready("eu-west", "10.0.0.1")], None),
        );

        assert_eq!(
            patch.annotations.get(annotations::GENERATED_HOST).map(String::as_str),
            Some("abc.hcpapps.net")
        );
        assert_eq!(
            patch.annotations.get(annotations::CUSTOM_HOSTS_REPLACED).map(String::as_str),
            Some(r#"["echo.example.com"]"#)
        );
        assert!(patch.annotations.contains_key(annotations::STATUS));
        assert_eq!(
            patch.labels.get("placement.kuadrant.dev/us-east"),
            Some(&Some("ready".to_string()))
        );
        assert_eq!(
            patch.rules.as_ref().unwrap()[0].host.as_deref(),
            Some("abc.hcpapps.net")
        );
        assert!(patch.tls.is_none());

        let ips: Vec<_> = patch
            .load_balancer
            .as_ref()
            .unwrap()
            .iter()
            .map(|lb| lb.ip.clone().unwrap())
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_converged_object_needs_no_patch() {
        let target = desired(vec![ready("us-east", "10.0.0.1")], Some("hcg-tls-echo"));
        let first = diff(&ingress(&["echo.example.com"]), &target);
        assert!(!first.is_empty());

        let written = apply(ingress(&["echo.example.com"]), &first);
        let second = diff(&written, &target);
        assert!(second.is_empty(), "unexpected patch: {second:?}");
        assert!(second.metadata_patch().is_none());
        assert!(second.status_patch().is_none());
    }

    #[test]
    fn test_replaced_hosts_are_remembered() {
        let target = desired(vec![ready("us-east", "10.0.0.1")], None);
        let written = apply(ingress(&["echo.example.com"]), &diff(&ingress(&["echo.example.com"]), &target));

        // Rules now carry the generated host only; the list must not shrink
        assert_eq!(
            replaced_hosts(&written, &host()),
            BTreeSet::from(["echo.example.com".to_string()])
        );
    }

    #[test]
    fn test_stale_placement_labels_removed() {
        let target = desired(vec![ready("us-east", "10.0.0.1"), ready("eu-west", "10.0.0.2")], None);
        let written = apply(ingress(&["echo.example.com"]), &diff(&ingress(&["echo.example.com"]), &target));

        let patch = diff(&written, &desired(vec![ready("us-east", "10.0.0.1")], None));
        assert_eq!(patch.labels.get("placement.kuadrant.dev/eu-west"), Some(&None));
        assert!(!patch.labels.contains_key("placement.kuadrant.dev/us-east"));
        assert_eq!(patch.load_balancer.as_ref().map(Vec::len), Some(1));

        let body = patch.metadata_patch().unwrap();
        assert!(body["metadata"]["labels"]["placement.kuadrant.dev/eu-west"].is_null());
    }

    #[test]
    fn test_tls_block_once_issued() {
        let patch = diff(
            &ingress(&["abc.hcpapps.net"]),
            &desired(vec![ready("us-east", "10.0.0.1")], Some("hcg-tls-echo")),
        );

        let tls = patch.tls.unwrap();
        assert_eq!(tls[0].hosts.as_deref(), Some(&["abc.hcpapps.net".to_string()][..]));
        assert_eq!(tls[0].secret_name.as_deref(), Some("hcg-tls-echo"));
        assert!(patch.rules.is_none());
        assert!(!patch.annotations.contains_key(annotations::CUSTOM_HOSTS_REPLACED));
    }

    #[test]
    fn test_status_patch_shape() {
        let patch = diff(&ingress(&["abc.hcpapps.net"]), &desired(vec![ready("us-east", "10.0.0.1")], None));
        let body = patch.status_patch().unwrap();
        assert_eq!(body["status"]["loadBalancer"]["ingress"][0]["ip"], "10.0.0.1");
    }

    #[test]
    fn test_invalid_object_keeps_routing_untouched() {
        let mut current = ingress(&["*.example.com"]);
        current.metadata.labels = Some(BTreeMap::from([(
            "placement.kuadrant.dev/us-east".to_string(),
            "ready".to_string(),
        )]));

        let patch = diff(
            &current,
            &DesiredState {
                status: GlbcStatus {
                    last_error: Some("wildcard".to_string()),
                    ..Default::default()
                },
                host: Some(host()),
                routing: None,
            },
        );

        assert!(patch.annotations.contains_key(annotations::STATUS));
        assert!(patch.annotations.contains_key(annotations::GENERATED_HOST));
        assert!(patch.labels.is_empty());
        assert!(patch.rules.is_none());
        assert!(patch.load_balancer.is_none());
    }

    #[test]
    fn test_status_only_without_host() {
        let patch = diff(&ingress(&["echo.example.com"]), &DesiredState::default());
        assert_eq!(patch.annotations.len(), 1);
        assert!(patch.annotations.contains_key(annotations::STATUS));
    }
}
