// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Error;
use crate::types::{
    AclToken, AgentService, CaRootSet, CheckStatus, DiscoveryChain, LeafCert, QueryMeta,
    QueryOptions, ServiceIntentionsEntry, ServiceName, ServiceRegistration,
};

/// ACL login for the sidecar's identity.
#[async_trait]
pub trait AclClient {
    /// Exchange a bearer token for a session token via the named auth method.
    /// `meta` is carried verbatim in the login request.
    async fn login(
        &self,
        auth_method: &str,
        namespace: Option<&str>,
        bearer_token: &str,
        meta: &HashMap<String, String>,
    ) -> Result<AclToken, Error>;
}

/// Registration and health reporting against the local agent.
#[async_trait]
pub trait AgentClient {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), Error>;

    async fn deregister_service(&self, service_id: &str) -> Result<(), Error>;

    /// Read back one registration. Returns `Error::NotFound` when the agent
    /// does not know the id.
    async fn service(&self, service_id: &str) -> Result<AgentService, Error>;

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: CheckStatus,
    ) -> Result<(), Error>;
}

/// Connect certificate-authority reads. Both endpoints support blocking
/// queries keyed by the returned raft index.
#[async_trait]
pub trait ConnectCaClient {
    async fn ca_roots(&self, options: &QueryOptions) -> Result<(CaRootSet, QueryMeta), Error>;

    async fn leaf_cert(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<(LeafCert, QueryMeta), Error>;
}

/// Compiled discovery-chain reads, one per upstream.
#[async_trait]
pub trait DiscoveryChainClient {
    async fn discovery_chain(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> Result<(DiscoveryChain, QueryMeta), Error>;
}

/// Reads and check-and-set writes of `service-intentions` config entries.
#[async_trait]
pub trait ConfigEntryClient {
    /// Returns `Error::NotFound` when no entry exists for the service.
    async fn get_service_intentions(
        &self,
        service: &ServiceName,
    ) -> Result<(ServiceIntentionsEntry, QueryMeta), Error>;

    /// Check-and-set write using the modify index from the prior read.
    /// Returns `false` when the index did not match.
    async fn put_service_intentions_cas(
        &self,
        entry: &ServiceIntentionsEntry,
        index: u64,
    ) -> Result<bool, Error>;

    /// Delete is not CAS-guarded; the underlying API does not support it.
    async fn delete_service_intentions(&self, service: &ServiceName) -> Result<(), Error>;
}

/// The full control-plane surface the sidecar core depends on.
pub trait Client:
    AclClient + AgentClient + ConnectCaClient + DiscoveryChainClient + ConfigEntryClient + Send + Sync
{
    /// Install the session token used to authenticate subsequent calls.
    fn set_token(&self, token: &str);
}
