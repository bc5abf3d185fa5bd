// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Config-entry kind for intention entries.
pub const SERVICE_INTENTIONS_KIND: &str = "service-intentions";

/// The namespace Consul reports for un-namespaced services. For comparison
/// purposes it is interchangeable with the empty string.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Collapse the `default` namespace sentinel to the empty string.
pub fn canonical_namespace(namespace: &str) -> &str {
    if namespace == DEFAULT_NAMESPACE {
        ""
    } else {
        namespace
    }
}

/// A (namespace, name) pair identifying a service in the catalog.
///
/// Equality, ordering, and hashing all treat an empty namespace and the
/// `default` namespace as the same value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ServiceName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn canonical_namespace(&self) -> &str {
        canonical_namespace(&self.namespace)
    }
}

impl PartialEq for ServiceName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.canonical_namespace() == other.canonical_namespace()
    }
}

impl Eq for ServiceName {}

impl Hash for ServiceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_namespace().hash(state);
        self.name.hash(state);
    }
}

impl Ord for ServiceName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.canonical_namespace(), &self.name).cmp(&(other.canonical_namespace(), &other.name))
    }
}

impl PartialOrd for ServiceName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.canonical_namespace();
        if ns.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", ns, self.name)
        }
    }
}

/// Identifies this gateway to the control plane and in SPIFFE paths.
/// Created at process start and never mutated.
#[derive(Clone, Debug)]
pub struct GatewayId {
    pub namespace: String,
    pub service: String,
}

impl GatewayId {
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        GatewayId {
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    pub fn canonical_namespace(&self) -> &str {
        canonical_namespace(&self.namespace)
    }

    pub fn service_name(&self) -> ServiceName {
        ServiceName::new(self.canonical_namespace(), self.service.clone())
    }
}

impl PartialEq for GatewayId {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.canonical_namespace() == other.canonical_namespace()
    }
}

impl Eq for GatewayId {}

impl Hash for GatewayId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_namespace().hash(state);
        self.service.hash(state);
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.canonical_namespace();
        if ns.is_empty() {
            write!(f, "{}", self.service)
        } else {
            write!(f, "{}/{}", ns, self.service)
        }
    }
}

/// One listener exposed by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// A short-lived certificate issued for this gateway's service identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafCert {
    pub pem_cert: String,
    pub pem_key: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub serial: String,
}

/// One certificate-authority root known to the control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaRoot {
    pub id: String,
    pub name: String,
    pub pem_cert: String,
    pub active: bool,
    pub trust_domain: String,
}

/// The set of CA roots, exactly one of which is active.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaRootSet {
    pub active_root_id: String,
    pub roots: Vec<CaRoot>,
}

impl CaRootSet {
    pub fn active_root(&self) -> Option<&CaRoot> {
        self.roots
            .iter()
            .find(|root| root.active && root.id == self.active_root_id)
            .or_else(|| self.roots.iter().find(|root| root.active))
    }
}

/// Options carried on blocking-query reads.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Raft index the read should block past. Zero means return immediately.
    pub min_index: u64,
    /// Maximum time the server should hold the query open.
    pub wait: Option<Duration>,
    pub namespace: Option<String>,
    pub partition: Option<String>,
}

impl QueryOptions {
    pub fn blocking(min_index: u64) -> Self {
        QueryOptions {
            min_index,
            wait: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }
}

/// Metadata returned with every read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Raft index of the returned value.
    pub index: u64,
}

/// Token returned by an ACL login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclToken {
    pub accessor_id: String,
    pub secret_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Passing => write!(f, "passing"),
            CheckStatus::Warning => write!(f, "warning"),
            CheckStatus::Critical => write!(f, "critical"),
        }
    }
}

/// A TCP readiness probe declared alongside the registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpCheck {
    pub check_id: String,
    pub name: String,
    pub tcp: String,
    pub interval: Duration,
    pub deregister_critical_after: Option<Duration>,
}

/// A TTL check the sidecar reports on itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlCheck {
    pub check_id: String,
    pub name: String,
    pub ttl: Duration,
}

/// The catalog registration for this sidecar process.
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistration {
    /// Process-unique registration id (UUID v4 assigned at construction).
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub partition: Option<String>,
    /// Service kind, e.g. `ingress-gateway`.
    pub kind: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub tcp_check: Option<TcpCheck>,
    pub ttl_check: Option<TtlCheck>,
}

/// The agent's view of a registered service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentService {
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentionAction {
    Allow,
    Deny,
}

/// One source allowed (or denied) by a `service-intentions` entry.
///
/// Two sources are equal iff their names agree and their namespaces agree
/// after canonicalizing empty and `default` to the same value.
#[derive(Clone, Debug)]
pub struct IntentionSource {
    pub name: String,
    pub namespace: String,
    pub action: IntentionAction,
    pub description: String,
}

impl IntentionSource {
    pub fn matches(&self, name: &str, namespace: &str) -> bool {
        self.name == name && canonical_namespace(&self.namespace) == canonical_namespace(namespace)
    }
}

impl PartialEq for IntentionSource {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.name, &other.namespace)
    }
}

impl Eq for IntentionSource {}

/// A `service-intentions` config entry for one destination service.
#[derive(Clone, Debug, Default)]
pub struct ServiceIntentionsEntry {
    pub name: String,
    pub namespace: Option<String>,
    pub sources: Vec<IntentionSource>,
    pub meta: HashMap<String, String>,
}

impl ServiceIntentionsEntry {
    pub fn empty(service: &ServiceName) -> Self {
        let namespace = match service.canonical_namespace() {
            "" => None,
            ns => Some(ns.to_owned()),
        };
        ServiceIntentionsEntry {
            name: service.name.clone(),
            namespace,
            sources: Vec::new(),
            meta: HashMap::new(),
        }
    }

    pub fn service_name(&self) -> ServiceName {
        ServiceName::new(self.namespace.clone().unwrap_or_default(), self.name.clone())
    }
}

/// The set of reachable targets compiled for one upstream service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryChain {
    pub service_name: String,
    pub namespace: String,
    pub targets: Vec<ServiceName>,
}
