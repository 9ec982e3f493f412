//! TLS certificate coordination
//!
//! The [`CertificateCoordinator`] owns the map from generated host to its
//! certificate request. Issuance itself is asynchronous: the engine gets an
//! order to submit, and the outcome arrives later as a [`CertificateEvent`].

pub mod cert_manager;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glbc_common::{GeneratedHost, ObjectIdentity};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::counters;
use crate::object::scoped_name;

pub use cert_manager::CertManagerProvider;

/// Prefix of the Secret (and Certificate) holding a generated host's key pair
pub const SECRET_PREFIX: &str = "hcg-tls-";

/// Secret name for an Ingress
pub fn secret_name(owner: &ObjectIdentity) -> String {
    scoped_name(owner, &format!("{}{}", SECRET_PREFIX, owner.name))
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate backend unavailable: {0}")]
    Unavailable(String),

    #[error("Certificate backend rejected request for {host}: {reason}")]
    Rejected { host: String, reason: String },

    #[error("Certificate call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Host {host} already has a certificate request owned by {owner}")]
    DuplicateRequest { host: String, owner: String },
}

/// Lifecycle of a certificate request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum CertificateState {
    Pending,
    Succeeded { secret: String },
    Failed { message: String },
}

impl CertificateState {
    /// Issued or failed; nothing left to wait for
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub host: GeneratedHost,
    pub owner: ObjectIdentity,
    pub secret_name: String,
    pub state: CertificateState,
    pub requested_at: Instant,
}

/// Work handed to the certificate provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOrder {
    pub host: GeneratedHost,
    pub owner: ObjectIdentity,
    pub secret_name: String,
}

/// Asynchronous issuance outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateEvent {
    Issued { host: GeneratedHost, secret: String },
    Failed { host: GeneratedHost, message: String },
}

impl CertificateEvent {
    pub fn host(&self) -> &GeneratedHost {
        match self {
            Self::Issued { host, .. } | Self::Failed { host, .. } => host,
        }
    }
}

/// Result of [`CertificateCoordinator::ensure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured {
    /// A new request was created; the order must be submitted
    Submit(CertificateOrder),
    /// A request already exists
    Existing(CertificateState),
}

/// Backend that issues and revokes certificates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Start issuance. Completion is reported out of band.
    async fn request(&self, order: &CertificateOrder) -> Result<(), CertificateError>;

    /// Remove the certificate and its secret. Absent counts as released.
    async fn release(&self, order: &CertificateOrder) -> Result<(), CertificateError>;
}

/// Keyed store of certificate requests, at most one per host
#[derive(Debug)]
pub struct CertificateCoordinator {
    issuer: String,
    requests: Mutex<HashMap<GeneratedHost, CertificateRequest>>,
}

impl CertificateCoordinator {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Make sure a request exists for `host`.
    ///
    /// Creates a Pending request the first time; afterwards returns the
    /// current state unchanged.
    pub fn ensure(
        &self,
        host: &GeneratedHost,
        owner: &ObjectIdentity,
        secret_name: &str,
    ) -> Result<Ensured, CertificateError> {
        let mut requests = self.requests.lock();
        if let Some(existing) = requests.get(host) {
            if &existing.owner != owner {
                return Err(CertificateError::DuplicateRequest {
                    host: host.to_string(),
                    owner: existing.owner.to_string(),
                });
            }
            return Ok(Ensured::Existing(existing.state.clone()));
        }

        requests.insert(
            host.clone(),
            CertificateRequest {
                host: host.clone(),
                owner: owner.clone(),
                secret_name: secret_name.to_string(),
                state: CertificateState::Pending,
                requested_at: Instant::now(),
            },
        );
        counters::certificate_requested(&self.issuer);
        info!(%host, "Certificate requested");

        Ok(Ensured::Submit(CertificateOrder {
            host: host.clone(),
            owner: owner.clone(),
            secret_name: secret_name.to_string(),
        }))
    }

    /// Apply an issuance outcome.
    ///
    /// Only Pending requests move; repeated or unknown events are ignored so
    /// nothing is counted twice. Returns the owner to re-enqueue.
    pub fn complete(&self, event: CertificateEvent) -> Option<ObjectIdentity> {
        let mut requests = self.requests.lock();
        let Some(request) = requests.get_mut(event.host()) else {
            debug!(host = %event.host(), "Ignoring event for unknown certificate request");
            return None;
        };
        if request.state != CertificateState::Pending {
            debug!(host = %request.host, "Ignoring event for settled certificate request");
            return None;
        }

        let elapsed = request.requested_at.elapsed();
        request.state = match event {
            CertificateEvent::Issued { secret, .. } => {
                counters::certificate_issued(&self.issuer, elapsed);
                info!(host = %request.host, %secret, "Certificate issued");
                CertificateState::Succeeded { secret }
            }
            CertificateEvent::Failed { message, .. } => {
                counters::certificate_failed(&self.issuer, elapsed);
                warn!(host = %request.host, %message, "Certificate issuance failed");
                CertificateState::Failed { message }
            }
        };
        Some(request.owner.clone())
    }

    /// Request a failed certificate again.
    pub fn retry(&self, host: &GeneratedHost) -> Option<CertificateOrder> {
        let mut requests = self.requests.lock();
        let request = requests.get_mut(host)?;
        if !matches!(request.state, CertificateState::Failed { .. }) {
            return None;
        }

        request.state = CertificateState::Pending;
        request.requested_at = Instant::now();
        counters::certificate_requested(&self.issuer);
        info!(%host, "Certificate re-requested");

        Some(CertificateOrder {
            host: host.clone(),
            owner: request.owner.clone(),
            secret_name: request.secret_name.clone(),
        })
    }

    /// Track an already settled request, e.g. one recorded on the Ingress
    /// before a restart. Does not count as a new request.
    pub fn adopt(
        &self,
        host: &GeneratedHost,
        owner: &ObjectIdentity,
        secret_name: &str,
        state: CertificateState,
    ) {
        if !state.is_terminal() {
            return;
        }
        let mut requests = self.requests.lock();
        if requests.contains_key(host) {
            return;
        }
        if matches!(state, CertificateState::Succeeded { .. }) {
            counters::secret_adopted(&self.issuer);
        }
        requests.insert(
            host.clone(),
            CertificateRequest {
                host: host.clone(),
                owner: owner.clone(),
                secret_name: secret_name.to_string(),
                state,
                requested_at: Instant::now(),
            },
        );
    }

    /// Forget the request for `host` if `owner` made it.
    pub fn release(
        &self,
        host: &GeneratedHost,
        owner: &ObjectIdentity,
    ) -> Option<CertificateRequest> {
        let mut requests = self.requests.lock();
        let holder = requests.get(host).map(|r| r.owner.clone())?;
        if &holder != owner {
            debug!(%host, %holder, %owner, "Certificate request held by another object");
            return None;
        }
        let request = requests.remove(host)?;
        drop(requests);

        match request.state {
            CertificateState::Pending => counters::certificate_abandoned(&self.issuer),
            CertificateState::Succeeded { .. } => counters::secret_released(&self.issuer),
            CertificateState::Failed { .. } => {}
        }
        debug!(%host, "Certificate request released");
        Some(request)
    }

    pub fn state(&self, host: &GeneratedHost) -> Option<CertificateState> {
        self.requests.lock().get(host).map(|r| r.state.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|r| r.state == CertificateState::Pending)
            .count()
    }
}
