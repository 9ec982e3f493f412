//! Identity helpers for Ingresses living in kcp logical clusters

use glbc_common::ObjectIdentity;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use sha2::{Digest, Sha256};

use crate::config::{annotations, DEFAULT_TENANT};

/// Bytes of the workspace hash appended to derived resource names
const TENANT_SUFFIX_BYTES: usize = 4;

/// Logical cluster (workspace) an object belongs to.
pub fn tenant_of(meta: &ObjectMeta) -> &str {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(annotations::LOGICAL_CLUSTER))
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TENANT)
}

/// Identity of an Ingress, or `None` if it has no name or namespace.
pub fn identity_of(ingress: &Ingress) -> Option<ObjectIdentity> {
    let name = ingress.metadata.name.as_deref()?;
    let namespace = ingress.metadata.namespace.as_deref()?;
    Some(ObjectIdentity::new(
        tenant_of(&ingress.metadata),
        namespace,
        name,
    ))
}

/// Name of a resource derived from an Ingress.
///
/// Objects in the default workspace keep `base`. Elsewhere a short hash of
/// the workspace is appended, so the same namespace and name in two
/// workspaces never share a DNSRecord, Certificate or Secret.
pub fn scoped_name(identity: &ObjectIdentity, base: &str) -> String {
    if identity.tenant == DEFAULT_TENANT {
        return base.to_string();
    }
    let suffix: String = Sha256::digest(identity.tenant.as_bytes())[..TENANT_SUFFIX_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("{base}-{suffix}")
}

/// Controller queue key for an identity.
///
/// The kube-rs queue and reflector store key on namespace and name only; the
/// workspace is recovered from the object's annotation when it is reconciled.
pub fn object_ref(identity: &ObjectIdentity) -> ObjectRef<Ingress> {
    ObjectRef::new(&identity.name).within(&identity.namespace)
}
