// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! In-memory control plane for tests.
//!
//! Implements every client trait over a single mutex-protected state table,
//! with raft-index bookkeeping so blocking queries behave like the real
//! thing. Tests program failures by arming `fail_next_*` counters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::client::{
    AclClient, AgentClient, Client, ConfigEntryClient, ConnectCaClient, DiscoveryChainClient,
};
use crate::error::Error;
use crate::types::{
    AclToken, AgentService, CaRootSet, CheckStatus, DiscoveryChain, LeafCert, QueryMeta,
    QueryOptions, ServiceIntentionsEntry, ServiceName, ServiceRegistration,
};

#[derive(Default)]
struct State {
    index: u64,
    token: String,

    login_token: Option<AclToken>,
    logins: Vec<(String, HashMap<String, String>)>,
    fail_next_logins: u32,

    services: HashMap<String, ServiceRegistration>,
    register_calls: u32,
    deregister_calls: u32,
    ttl_updates: Vec<(String, CheckStatus)>,

    roots: Option<CaRootSet>,
    leaf: Option<LeafCert>,
    fail_next_leaf: u32,
    leaf_fetches: u32,

    chains: HashMap<ServiceName, DiscoveryChain>,

    intentions: HashMap<ServiceName, (ServiceIntentionsEntry, u64)>,
    intention_writes: u32,
    intention_deletes: u32,
    fail_next_cas: u32,
}

pub struct MemoryConsul {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for MemoryConsul {
    fn default() -> Self {
        MemoryConsul {
            state: Mutex::new(State {
                index: 1,
                login_token: Some(AclToken {
                    accessor_id: "test-accessor".to_owned(),
                    secret_id: "test-secret".to_owned(),
                }),
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }
}

impl MemoryConsul {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(state: &mut State) -> u64 {
        state.index += 1;
        state.index
    }

    pub fn set_roots(&self, roots: CaRootSet) {
        let mut state = self.state.lock().unwrap();
        state.roots = Some(roots);
        Self::bump(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn set_leaf(&self, leaf: LeafCert) {
        let mut state = self.state.lock().unwrap();
        state.leaf = Some(leaf);
        Self::bump(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn set_chain(&self, upstream: ServiceName, chain: DiscoveryChain) {
        let mut state = self.state.lock().unwrap();
        state.chains.insert(upstream, chain);
        Self::bump(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn fail_next_logins(&self, count: u32) {
        self.state.lock().unwrap().fail_next_logins = count;
    }

    pub fn fail_next_leaf(&self, count: u32) {
        self.state.lock().unwrap().fail_next_leaf = count;
    }

    pub fn token(&self) -> String {
        self.state.lock().unwrap().token.clone()
    }

    pub fn logins(&self) -> Vec<(String, HashMap<String, String>)> {
        self.state.lock().unwrap().logins.clone()
    }

    pub fn leaf_fetches(&self) -> u32 {
        self.state.lock().unwrap().leaf_fetches
    }

    pub fn registered_services(&self) -> Vec<ServiceRegistration> {
        self.state.lock().unwrap().services.values().cloned().collect()
    }

    pub fn register_calls(&self) -> u32 {
        self.state.lock().unwrap().register_calls
    }

    pub fn deregister_calls(&self) -> u32 {
        self.state.lock().unwrap().deregister_calls
    }

    /// Drop a registration behind the registry's back, as an agent restart
    /// would.
    pub fn forget_service(&self, service_id: &str) {
        self.state.lock().unwrap().services.remove(service_id);
    }

    pub fn ttl_updates(&self) -> Vec<(String, CheckStatus)> {
        self.state.lock().unwrap().ttl_updates.clone()
    }

    pub fn intention(&self, service: &ServiceName) -> Option<ServiceIntentionsEntry> {
        self.state
            .lock()
            .unwrap()
            .intentions
            .get(service)
            .map(|(entry, _)| entry.clone())
    }

    pub fn put_intention(&self, entry: ServiceIntentionsEntry) {
        let mut state = self.state.lock().unwrap();
        let index = Self::bump(&mut state);
        state.intentions.insert(entry.service_name(), (entry, index));
    }

    pub fn intention_writes(&self) -> u32 {
        self.state.lock().unwrap().intention_writes
    }

    pub fn intention_deletes(&self) -> u32 {
        self.state.lock().unwrap().intention_deletes
    }

    /// Force the next `count` CAS writes to report a conflict.
    pub fn fail_next_cas(&self, count: u32) {
        self.state.lock().unwrap().fail_next_cas = count;
    }

    /// Drop an intention entry behind the reconciler's back.
    pub fn delete_intention(&self, service: &ServiceName) {
        let mut state = self.state.lock().unwrap();
        state.intentions.remove(service);
        Self::bump(&mut state);
    }

    /// Park until the state index moves past `min_index`, honoring the
    /// query's wait budget scaled down for tests.
    async fn block_for_index(&self, options: &QueryOptions) {
        if options.min_index == 0 {
            return;
        }
        let wait = options.wait.unwrap_or(Duration::from_millis(50));
        let deadline = tokio::time::Instant::now() + wait.min(Duration::from_millis(250));
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.index > options.min_index {
                    return;
                }
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return,
            }
        }
    }
}

impl Client for MemoryConsul {
    fn set_token(&self, token: &str) {
        self.state.lock().unwrap().token = token.to_owned();
    }
}

#[async_trait]
impl AclClient for MemoryConsul {
    async fn login(
        &self,
        auth_method: &str,
        _namespace: Option<&str>,
        _bearer_token: &str,
        meta: &HashMap<String, String>,
    ) -> Result<AclToken, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_logins > 0 {
            state.fail_next_logins -= 1;
            return Err(Error::transport("acl login", "injected failure"));
        }
        state.logins.push((auth_method.to_owned(), meta.clone()));
        state
            .login_token
            .clone()
            .ok_or_else(|| Error::Unauthorized {
                operation: "acl login".to_owned(),
                message: "no token configured".to_owned(),
            })
    }
}

#[async_trait]
impl AgentClient for MemoryConsul {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.register_calls += 1;
        state
            .services
            .insert(registration.id.clone(), registration.clone());
        Self::bump(&mut state);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.deregister_calls += 1;
        if state.services.remove(service_id).is_none() {
            return Err(Error::NotFound(format!("service {service_id}")));
        }
        Self::bump(&mut state);
        Ok(())
    }

    async fn service(&self, service_id: &str) -> Result<AgentService, Error> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(service_id)
            .map(|registration| AgentService {
                id: registration.id.clone(),
                name: registration.name.clone(),
                namespace: registration.namespace.clone(),
                address: registration.address.clone(),
                port: registration.port,
            })
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        _output: &str,
        status: CheckStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.ttl_updates.push((check_id.to_owned(), status));
        Ok(())
    }
}

#[async_trait]
impl ConnectCaClient for MemoryConsul {
    async fn ca_roots(&self, options: &QueryOptions) -> Result<(CaRootSet, QueryMeta), Error> {
        self.block_for_index(options).await;
        let state = self.state.lock().unwrap();
        let roots = state
            .roots
            .clone()
            .ok_or_else(|| Error::NotFound("ca roots".to_owned()))?;
        Ok((roots, QueryMeta { index: state.index }))
    }

    async fn leaf_cert(
        &self,
        _service: &str,
        options: &QueryOptions,
    ) -> Result<(LeafCert, QueryMeta), Error> {
        self.block_for_index(options).await;
        let mut state = self.state.lock().unwrap();
        state.leaf_fetches += 1;
        if state.fail_next_leaf > 0 {
            state.fail_next_leaf -= 1;
            return Err(Error::transport("read leaf cert", "injected failure"));
        }
        let leaf = state
            .leaf
            .clone()
            .ok_or_else(|| Error::NotFound("leaf cert".to_owned()))?;
        Ok((leaf, QueryMeta { index: state.index }))
    }
}

#[async_trait]
impl DiscoveryChainClient for MemoryConsul {
    async fn discovery_chain(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> Result<(DiscoveryChain, QueryMeta), Error> {
        self.block_for_index(options).await;
        let state = self.state.lock().unwrap();
        let chain = state
            .chains
            .get(service)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("discovery chain for {service}")))?;
        Ok((chain, QueryMeta { index: state.index }))
    }
}

#[async_trait]
impl ConfigEntryClient for MemoryConsul {
    async fn get_service_intentions(
        &self,
        service: &ServiceName,
    ) -> Result<(ServiceIntentionsEntry, QueryMeta), Error> {
        let state = self.state.lock().unwrap();
        state
            .intentions
            .get(service)
            .map(|(entry, index)| (entry.clone(), QueryMeta { index: *index }))
            .ok_or_else(|| Error::NotFound(format!("service-intentions for {service}")))
    }

    async fn put_service_intentions_cas(
        &self,
        entry: &ServiceIntentionsEntry,
        index: u64,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_cas > 0 {
            state.fail_next_cas -= 1;
            return Ok(false);
        }
        let service = entry.service_name();
        let existing_index = state
            .intentions
            .get(&service)
            .map(|(_, index)| *index)
            .unwrap_or(0);
        if existing_index != index {
            return Ok(false);
        }
        state.intention_writes += 1;
        let new_index = Self::bump(&mut state);
        state
            .intentions
            .insert(service, (entry.clone(), new_index));
        Ok(true)
    }

    async fn delete_service_intentions(&self, service: &ServiceName) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.intention_deletes += 1;
        if state.intentions.remove(service).is_none() {
            return Err(Error::NotFound(format!("service-intentions for {service}")));
        }
        Self::bump(&mut state);
        Ok(())
    }
}
