//! Controllers and the state they share

pub mod certificate;
pub mod cluster;
pub mod ingress;
pub mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glbc_common::{GeneratedHost, ObjectIdentity};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::ObjectRef;
use kube::Client;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::cluster::ClusterDirectory;
use crate::config::Settings;
use crate::dns::{DnsProvider, WeightPolicy};
use crate::metrics::counters;
use crate::object::object_ref;
use crate::tls::{CertificateCoordinator, CertificateOrder, CertificateProvider};
use crate::writeback::IngressWriter;

use self::retry::RetryTracker;

/// Shared state for all controllers
pub struct ControllerContext {
    /// Kubernetes API client (shared across controllers)
    pub kube_client: Client,
    pub settings: Arc<Settings>,
    pub dns: Arc<dyn DnsProvider>,
    pub certificates: Arc<CertificateCoordinator>,
    pub certificate_provider: Arc<dyn CertificateProvider>,
    /// Orders waiting for the issuance worker
    pub issuance: mpsc::UnboundedSender<CertificateOrder>,
    pub writer: Arc<dyn IngressWriter>,
    pub clusters: Arc<ClusterDirectory>,
    pub hosts: Arc<HostIndex>,
    pub managed: Arc<ManagedObjects>,
    pub retry_tracker: Arc<RetryTracker>,
    pub weight_policy: Arc<dyn WeightPolicy>,
    /// Re-enqueues Ingresses from outside the Ingress watch
    pub trigger: Trigger,
}

/// Sender side of the controller's extra trigger stream
#[derive(Debug, Clone)]
pub struct Trigger(mpsc::UnboundedSender<ObjectRef<Ingress>>);

impl Trigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ObjectRef<Ingress>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn enqueue(&self, identity: &ObjectIdentity) {
        if self.0.send(object_ref(identity)).is_err() {
            // Only happens once the controller has shut down
            debug!(object = %identity, "Trigger dropped, controller stopped");
        }
    }
}

/// Two live objects claimed the same generated host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCollision {
    pub host: GeneratedHost,
    pub holder: ObjectIdentity,
}

/// Which object holds each generated host
#[derive(Debug, Default)]
pub struct HostIndex {
    claims: Mutex<HashMap<GeneratedHost, ObjectIdentity>>,
}

impl HostIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `host` for `owner`. Claiming an already held host again is a no-op.
    pub fn claim(&self, host: &GeneratedHost, owner: &ObjectIdentity) -> Result<(), HostCollision> {
        let mut claims = self.claims.lock();
        match claims.get(host) {
            Some(holder) if holder != owner => {
                error!(%host, %holder, claimant = %owner, "Generated host collision");
                Err(HostCollision {
                    host: host.clone(),
                    holder: holder.clone(),
                })
            }
            Some(_) => Ok(()),
            None => {
                claims.insert(host.clone(), owner.clone());
                Ok(())
            }
        }
    }

    /// Release `host` if `owner` holds it.
    pub fn release(&self, host: &GeneratedHost, owner: &ObjectIdentity) {
        let mut claims = self.claims.lock();
        if claims.get(host) == Some(owner) {
            claims.remove(host);
        }
    }

    pub fn holder(&self, host: &GeneratedHost) -> Option<ObjectIdentity> {
        self.claims.lock().get(host).cloned()
    }
}

/// Ingresses currently under management, mirrored in the managed-object gauge
#[derive(Debug, Default)]
pub struct ManagedObjects {
    objects: Mutex<HashSet<ObjectIdentity>>,
}

impl ManagedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: &ObjectIdentity) {
        let mut objects = self.objects.lock();
        if objects.insert(identity.clone()) {
            counters::set_managed_objects(objects.len());
        }
    }

    pub fn remove(&self, identity: &ObjectIdentity) {
        let mut objects = self.objects.lock();
        if objects.remove(identity) {
            counters::set_managed_objects(objects.len());
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}
