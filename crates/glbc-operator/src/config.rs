//! Command-line and environment configuration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use glbc_common::{BaseDomain, ValidationError};
use thiserror::Error;

use crate::dns::record::{EvenSplit, FixedWeight, WeightPolicy};

/// Annotation keys read or written by the operator
pub mod annotations {
    /// Host generated for the Ingress
    pub const GENERATED_HOST: &str = "kuadrant.dev/host.generated";
    /// JSON list of user-declared hosts replaced by the generated host
    pub const CUSTOM_HOSTS_REPLACED: &str = "kuadrant.dev/custom-hosts.replaced";
    /// JSON reconcile status
    pub const STATUS: &str = "kuadrant.dev/glbc.status";
    /// kcp logical cluster of an object
    pub const LOGICAL_CLUSTER: &str = "kcp.dev/cluster";
    /// Per-cluster status reported by the kcp syncer, suffixed with the cluster name
    pub const CLUSTER_STATUS_PREFIX: &str = "experimental.status.workload.kcp.dev/";
}

/// Label keys read or written by the operator
pub mod labels {
    /// Per-cluster sync state set by the kcp scheduler, suffixed with the cluster name
    pub const CLUSTER_STATE_PREFIX: &str = "state.workload.kcp.dev/";
    /// Single-cluster placement label
    pub const LEGACY_CLUSTER: &str = "workloads.kcp.dev/cluster";
    /// Sync state meaning the cluster is serving the object
    pub const STATE_SYNC: &str = "Sync";
    /// Written for every ready cluster, suffixed with the cluster name
    pub const PLACEMENT_PREFIX: &str = "placement.kuadrant.dev/";
    pub const PLACEMENT_READY: &str = "ready";
    /// Marks resources created by the operator
    pub const MANAGED_BY: &str = "kuadrant.dev/managed-by";
    pub const MANAGED_BY_VALUE: &str = "glbc";
}

/// Finalizer guarding DNS and certificate teardown
pub const FINALIZER: &str = "kuadrant.dev/glbc";

/// Logical cluster assumed when an object carries none
pub const DEFAULT_TENANT: &str = "root";

/// Server-side apply field manager
pub const FIELD_MANAGER: &str = "kcp-glbc";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid base domain: {0}")]
    InvalidDomain(#[from] ValidationError),
    #[error("DNS TTL must be between 1 and 86400 seconds, got {0}")]
    InvalidTtl(u32),
    #[error("DNS weight must be greater than zero")]
    ZeroWeight,
    #[error("Worker count must be greater than zero")]
    ZeroWorkers,
    #[error("Call timeout must be greater than zero")]
    ZeroTimeout,
    #[error("TLS issuer name cannot be empty")]
    EmptyIssuer,
}

/// How endpoint weights are assigned across ready clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WeightPolicyKind {
    /// Every endpoint carries `--dns-weight`
    Fixed,
    /// `--dns-weight` is split evenly across endpoints
    EvenSplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "glbc-operator", version, about)]
pub struct Args {
    /// Domain under which hosts are generated
    #[arg(long, env = "GLBC_DOMAIN", default_value = "hcpapps.net")]
    pub domain: String,

    /// TTL of published DNS records, in seconds
    #[arg(long, env = "GLBC_DNS_TTL", default_value_t = 60)]
    pub dns_ttl: u32,

    #[arg(long, env = "GLBC_DNS_WEIGHT_POLICY", value_enum, default_value_t = WeightPolicyKind::Fixed)]
    pub dns_weight_policy: WeightPolicyKind,

    /// Weight per endpoint (fixed) or total weight (even-split)
    #[arg(long, env = "GLBC_DNS_WEIGHT", default_value_t = 100)]
    pub dns_weight: u32,

    /// Zone reported in DNSRecord status
    #[arg(long, env = "GLBC_DNS_ZONE_ID", default_value = "glbc")]
    pub dns_zone_id: String,

    #[arg(long, env = "GLBC_TLS_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub tls_enabled: bool,

    /// cert-manager issuer used for generated hosts
    #[arg(long, env = "GLBC_TLS_ISSUER", default_value = "glbc-ca")]
    pub tls_issuer: String,

    #[arg(long, env = "GLBC_TLS_ISSUER_KIND", default_value = "ClusterIssuer")]
    pub tls_issuer_kind: String,

    /// Ingresses reconciled concurrently
    #[arg(long, env = "GLBC_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Upper bound for each DNS, certificate, or API call, in seconds
    #[arg(long, env = "GLBC_CALL_TIMEOUT", default_value_t = 30)]
    pub call_timeout_secs: u64,

    #[arg(long, env = "GLBC_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    #[arg(long, env = "GLBC_HEALTH_PORT", default_value_t = crate::health::DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    #[arg(long, env = "GLBC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log whole objects at debug level on every reconcile
    #[arg(long, env = "GLBC_LOG_OBJECTS", default_value_t = false, action = ArgAction::Set)]
    pub log_objects: bool,
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub ttl: u32,
    pub policy: WeightPolicyKind,
    pub weight: u32,
    pub zone_id: String,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub enabled: bool,
    pub issuer: String,
    pub issuer_kind: String,
}

/// Validated runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_domain: BaseDomain,
    pub dns: DnsSettings,
    pub tls: TlsSettings,
    pub workers: u16,
    pub call_timeout: Duration,
    pub log_objects: bool,
}

impl Args {
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let base_domain = BaseDomain::new(&self.domain)?;
        if self.dns_ttl == 0 || self.dns_ttl > 86_400 {
            return Err(ConfigError::InvalidTtl(self.dns_ttl));
        }
        if self.dns_weight == 0 {
            return Err(ConfigError::ZeroWeight);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.tls_enabled && self.tls_issuer.trim().is_empty() {
            return Err(ConfigError::EmptyIssuer);
        }

        Ok(Settings {
            base_domain,
            dns: DnsSettings {
                ttl: self.dns_ttl,
                policy: self.dns_weight_policy,
                weight: self.dns_weight,
                zone_id: self.dns_zone_id.clone(),
            },
            tls: TlsSettings {
                enabled: self.tls_enabled,
                issuer: self.tls_issuer.trim().to_string(),
                issuer_kind: self.tls_issuer_kind.clone(),
            },
            workers: self.workers,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            log_objects: self.log_objects,
        })
    }
}

impl DnsSettings {
    pub fn weight_policy(&self) -> Arc<dyn WeightPolicy> {
        match self.policy {
            WeightPolicyKind::Fixed => Arc::new(FixedWeight(self.weight)),
            WeightPolicyKind::EvenSplit => Arc::new(EvenSplit { total: self.weight }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["glbc-operator"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&[]).settings().unwrap();

        assert_eq!(settings.base_domain.as_str(), "hcpapps.net");
        assert_eq!(settings.dns.ttl, 60);
        assert_eq!(settings.dns.weight, 100);
        assert_eq!(settings.dns.policy, WeightPolicyKind::Fixed);
        assert!(settings.tls.enabled);
        assert_eq!(settings.tls.issuer, "glbc-ca");
        assert_eq!(settings.tls.issuer_kind, "ClusterIssuer");
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let settings = parse(&[
            "--domain",
            "apps.example.com",
            "--dns-weight-policy",
            "even-split",
            "--dns-weight",
            "240",
            "--tls-enabled",
            "false",
        ])
        .settings()
        .unwrap();

        assert_eq!(settings.base_domain.as_str(), "apps.example.com");
        assert_eq!(settings.dns.policy, WeightPolicyKind::EvenSplit);
        assert_eq!(settings.dns.weight_policy().weights(2), vec![120, 120]);
        assert!(!settings.tls.enabled);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            parse(&["--domain", "*.example.com"]).settings(),
            Err(ConfigError::InvalidDomain(_))
        ));
        assert!(matches!(
            parse(&["--dns-ttl", "0"]).settings(),
            Err(ConfigError::InvalidTtl(0))
        ));
        assert!(matches!(
            parse(&["--dns-weight", "0"]).settings(),
            Err(ConfigError::ZeroWeight)
        ));
        assert!(matches!(
            parse(&["--workers", "0"]).settings(),
            Err(ConfigError::ZeroWorkers)
        ));
        assert!(matches!(
            parse(&["--tls-issuer", " "]).settings(),
            Err(ConfigError::EmptyIssuer)
        ));
    }
}
