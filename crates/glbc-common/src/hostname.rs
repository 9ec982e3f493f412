//! Deterministic host generation for load-balanced objects
//!
//! Every managed object gets a host of the form `<hash>.<base-domain>`, where
//! `<hash>` is derived only from the object's identity. The same identity
//! always maps to the same host, across reconciliations and restarts.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::validation::{validate_hostname, ValidationError, ValidationResult};

/// Number of digest bytes kept in the generated label (160 bits).
pub const HASH_BYTES: usize = 20;

/// Length of the hex-encoded hash label.
pub const HASH_LABEL_LEN: usize = HASH_BYTES * 2;

/// Longest base domain that still leaves room for `<hash>.`
pub const MAX_BASE_DOMAIN_LEN: usize = 253 - HASH_LABEL_LEN - 1;

/// Identity of a routed object: the logical cluster (tenant workspace) it
/// lives in, plus its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// A validated DNS suffix under which hosts are generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDomain(String);

impl BaseDomain {
    pub fn new(domain: &str) -> ValidationResult<Self> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.contains('*') {
            return Err(ValidationError::WildcardHost(domain));
        }
        let domain = validate_hostname(&domain)?;
        if domain.len() > MAX_BASE_DOMAIN_LEN {
            return Err(ValidationError::BaseDomainTooLong {
                domain,
                max: MAX_BASE_DOMAIN_LEN,
            });
        }
        Ok(Self(domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host assigned to an object. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratedHost(String);

impl GeneratedHost {
    /// Rebuild a host previously persisted on an object.
    ///
    /// Persisted hosts are kept verbatim even if the base domain has since
    /// changed; only their syntax is checked.
    pub fn from_persisted(host: &str) -> ValidationResult<Self> {
        validate_hostname(host).map(|h| Self(h.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneratedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GeneratedHost {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generate the host for an object identity.
///
/// Each identity field is length-prefixed before hashing so that
/// `("a/b", "c")` and `("a", "b/c")` cannot produce the same input.
pub fn generate(identity: &ObjectIdentity, domain: &BaseDomain) -> GeneratedHost {
    let mut hasher = Sha256::new();
    for field in [&identity.tenant, &identity.namespace, &identity.name] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();

    let mut host = String::with_capacity(HASH_LABEL_LEN + 1 + domain.0.len());
    for byte in &digest[..HASH_BYTES] {
        // Writing to a String cannot fail
        let _ = write!(host, "{byte:02x}");
    }
    host.push('.');
    host.push_str(&domain.0);
    GeneratedHost(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn domain() -> BaseDomain {
        BaseDomain::new("hcpapps.net").unwrap()
    }

    #[test]
    fn test_generate_shape() {
        let host = generate(&ObjectIdentity::new("root:acme", "default", "echo"), &domain());
        let (label, rest) = host.as_str().split_once('.').unwrap();

        assert_eq!(label.len(), HASH_LABEL_LEN);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(rest, "hcpapps.net");
    }

    #[test]
    fn test_generate_depends_on_every_identity_field() {
        let base = ObjectIdentity::new("root:acme", "default", "echo");
        let host = generate(&base, &domain());

        let other_tenant = ObjectIdentity::new("root:other", "default", "echo");
        let other_namespace = ObjectIdentity::new("root:acme", "prod", "echo");
        let other_name = ObjectIdentity::new("root:acme", "default", "echo-2");

        assert_ne!(host, generate(&other_tenant, &domain()));
        assert_ne!(host, generate(&other_namespace, &domain()));
        assert_ne!(host, generate(&other_name, &domain()));
    }

    #[test]
    fn test_generate_field_boundaries_are_unambiguous() {
        let a = ObjectIdentity::new("t", "a/b", "c");
        let b = ObjectIdentity::new("t", "a", "b/c");
        assert_ne!(generate(&a, &domain()), generate(&b, &domain()));
    }

    #[test]
    fn test_base_domain_normalization() {
        let domain = BaseDomain::new(" Example.COM. ").unwrap();
        assert_eq!(domain.as_str(), "example.com");
    }

    #[test]
    fn test_base_domain_rejections() {
        assert!(matches!(
            BaseDomain::new("*.example.com"),
            Err(ValidationError::WildcardHost(_))
        ));
        assert!(BaseDomain::new("bad_domain.com").is_err());

        let long = vec!["a".repeat(45); 5].join(".");
        assert!(long.len() > MAX_BASE_DOMAIN_LEN);
        assert!(matches!(
            BaseDomain::new(&long),
            Err(ValidationError::BaseDomainTooLong { .. })
        ));
    }

    #[test]
    fn test_persisted_host_survives_domain_change() {
        let host = generate(&ObjectIdentity::new("root", "default", "echo"), &domain());
        let restored = GeneratedHost::from_persisted(host.as_str()).unwrap();
        assert_eq!(restored, host);

        assert!(GeneratedHost::from_persisted("not a host").is_err());
    }

    #[test]
    fn test_generated_host_serializes_as_string() {
        let host = GeneratedHost::from_persisted("abc.example.com").unwrap();
        assert_eq!(
            serde_json::to_string(&host).unwrap(),
            "\"abc.example.com\""
        );
    }

    proptest! {
        /// Generation is deterministic and always yields a valid hostname
        #[test]
        fn proptest_generate_is_deterministic(
            tenant in "[a-z:]{1,20}",
            namespace in "[a-z0-9-]{1,63}",
            name in "[a-z0-9.-]{1,253}",
        ) {
            let identity = ObjectIdentity::new(tenant, namespace, name);
            let first = generate(&identity, &domain());
            let second = generate(&identity.clone(), &domain());

            prop_assert_eq!(&first, &second);
            prop_assert!(validate_hostname(first.as_str()).is_ok());
        }
    }
}
