// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Control-plane presence for the sidecar: ACL login and the catalog
//! registration kept alive for the lifetime of the process.

pub mod auth;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use consul::types::{NamedPort, ServiceRegistration, TcpCheck, TtlCheck};
use consul::{AgentClient, CheckStatus};
use grpc_util::retry::{retry_constant, RetryConfig, RetryError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use auth::{Authenticator, AuthenticatorConfig};

pub const INGRESS_GATEWAY_KIND: &str = "ingress-gateway";

const DEFAULT_ENSURE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TTL: Duration = Duration::from_secs(20);
const DEFAULT_TTL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(10);
const DEREGISTER_AFTER_CRITICAL: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control plane: {0}")]
    Consul(#[from] consul::Error),

    #[error("registration failed: {0}")]
    Register(String),

    #[error("deregistration failed: {0}")]
    Deregister(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct ServiceRegistryConfig {
    pub name: String,
    pub namespace: Option<String>,
    pub partition: Option<String>,
    /// Address the gateway serves on; also the target of the readiness
    /// probe against the admin port.
    pub address: String,
    pub admin_port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    /// One entry per gateway listener, recorded in the service meta so
    /// operators can see what the gateway exposes.
    pub listeners: Vec<NamedPort>,
    /// Declare and feed the TTL self-check.
    pub enable_ttl: bool,
    pub ttl: Duration,
    pub ttl_interval: Duration,
    pub ensure_interval: Duration,
    pub retry: RetryConfig,
}

impl ServiceRegistryConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>, admin_port: u16) -> Self {
        ServiceRegistryConfig {
            name: name.into(),
            namespace: None,
            partition: None,
            address: address.into(),
            admin_port,
            tags: Vec::new(),
            meta: HashMap::new(),
            listeners: Vec::new(),
            enable_ttl: true,
            ttl: DEFAULT_TTL,
            ttl_interval: DEFAULT_TTL_INTERVAL,
            ensure_interval: DEFAULT_ENSURE_INTERVAL,
            retry: RetryConfig::default(),
        }
    }
}

struct BackgroundLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Idempotent register/deregister of this sidecar, with a periodic
/// re-ensure loop and TTL health reporting while registered.
pub struct ServiceRegistry<C> {
    client: Arc<C>,
    config: ServiceRegistryConfig,
    /// Process-unique registration id, assigned once at construction.
    id: String,
    loops: Mutex<Option<BackgroundLoops>>,
}

impl<C> ServiceRegistry<C>
where
    C: AgentClient + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, config: ServiceRegistryConfig) -> Self {
        ServiceRegistry {
            client,
            config,
            id: uuid::Uuid::new_v4().to_string(),
            loops: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn ttl_check_id(&self) -> String {
        format!("{}-ttl", self.id)
    }

    fn registration(&self) -> ServiceRegistration {
        let mut meta = self.config.meta.clone();
        for listener in &self.config.listeners {
            meta.insert(
                format!("gateway-listener-{}", listener.name),
                format!("{}:{}", listener.address, listener.port),
            );
        }
        ServiceRegistration {
            id: self.id.clone(),
            name: self.config.name.clone(),
            namespace: self.config.namespace.clone(),
            partition: self.config.partition.clone(),
            kind: INGRESS_GATEWAY_KIND.to_owned(),
            address: self.config.address.clone(),
            port: self.config.admin_port,
            tags: self.config.tags.clone(),
            meta,
            tcp_check: Some(TcpCheck {
                check_id: format!("{}-ready", self.id),
                name: format!("{} readiness", self.config.name),
                tcp: format!("{}:{}", self.config.address, self.config.admin_port),
                interval: DEFAULT_READINESS_INTERVAL,
                deregister_critical_after: Some(DEREGISTER_AFTER_CRITICAL),
            }),
            ttl_check: self.config.enable_ttl.then(|| TtlCheck {
                check_id: self.ttl_check_id(),
                name: format!("{} heartbeat", self.config.name),
                ttl: self.config.ttl,
            }),
        }
    }

    /// Publish the registration and start the background loops. Safe to
    /// call again once registered; the extra call is a no-op.
    pub async fn register(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return Ok(());
        }

        let registration = self.registration();
        let result = retry_constant(cancel, self.config.retry, "register service", || {
            let registration = registration.clone();
            async move { self.client.register_service(&registration).await }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return Err(Error::Cancelled),
            Err(RetryError::Exhausted { source, .. }) => {
                return Err(Error::Register(source.to_string()));
            }
        }
        log::info!(
            "registered service {} with id {}",
            self.config.name,
            self.id
        );

        let loop_cancel = cancel.child_token();
        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.clone().ensure_loop(loop_cancel.clone()),
        ));
        if self.config.enable_ttl {
            handles.push(tokio::spawn(self.clone().ttl_loop(loop_cancel.clone())));
        }
        *loops = Some(BackgroundLoops {
            cancel: loop_cancel,
            handles,
        });
        Ok(())
    }

    /// Re-submit the registration whenever the agent loses it. Runs until
    /// cancelled; every failure is logged and retried on the next tick.
    async fn ensure_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.ensure_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            match self.client.service(&self.id).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    log::warn!("registration {} lost; re-registering", self.id);
                    if let Err(err) = self.client.register_service(&self.registration()).await {
                        log::error!("failed to re-register {}: {err}", self.id);
                    }
                }
                Err(err) => {
                    log::error!("failed to verify registration {}: {err}", self.id);
                }
            }
        }
    }

    /// Report the TTL check as passing at a cadence comfortably inside the
    /// declared TTL.
    async fn ttl_loop(self: Arc<Self>, cancel: CancellationToken) {
        let check_id = self.ttl_check_id();
        let mut ticker = tokio::time::interval(self.config.ttl_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            if let Err(err) = self
                .client
                .update_ttl(&check_id, "ok", CheckStatus::Passing)
                .await
            {
                log::error!("failed to update ttl check {check_id}: {err}");
            }
        }
    }

    /// Stop the background loops and withdraw the registration. Runs on
    /// its own token because the root context is already cancelled during
    /// shutdown; deregistering something that no longer exists succeeds.
    pub async fn deregister(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if let Some(loops) = self.loops.lock().await.take() {
            loops.cancel.cancel();
            for handle in loops.handles {
                let _ = handle.await;
            }
        }

        let result = retry_constant(cancel, self.config.retry, "deregister service", || async move {
            match self.client.deregister_service(&self.id).await {
                Ok(()) => Ok(()),
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await;
        match result {
            Ok(()) => {
                log::info!("deregistered service id {}", self.id);
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { source, .. }) => {
                Err(Error::Deregister(source.to_string()))
            }
        }
    }
}
