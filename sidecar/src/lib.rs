// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The supervisor: starts the subsystems in dependency order, waits for the
//! first certificate write, renders the proxy bootstrap, then runs the SDS
//! server, the intentions reconciler, and the proxy process as one error
//! group. The first failure cancels everything; deregistration always runs
//! last on a fresh cancellation token.

use std::time::Duration;

use std::sync::Arc;

use certs::CertManager;
use consul::{Client, GatewayId, ServiceName};
use intentions::IntentionsReconciler;
use proxy::{BootstrapConfig, ProxyManager};
use registry::{Authenticator, ServiceRegistry};
use sds::SdsServer;
use secrets::SecretManager;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FIRST_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication: {0}")]
    Auth(#[from] registry::auth::Error),

    #[error("service registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("certificates: {0}")]
    Certs(#[from] certs::Error),

    #[error("sds server: {0}")]
    Sds(#[from] sds::Error),

    #[error("intentions: {0}")]
    Intentions(#[from] intentions::Error),

    #[error("proxy: {0}")]
    Proxy(#[from] proxy::Error),

    #[error("subsystem task failed: {0}")]
    Join(String),
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub gateway: GatewayId,
    /// Control-plane xDS endpoint the proxy's ADS connection dials.
    pub xds_address: String,
    pub xds_port: u16,
    pub admin_address: String,
    pub admin_port: u16,
    pub ready_port: u16,
    /// Upstreams whose discovery chains drive intention reconciliation.
    pub upstreams: Vec<ServiceName>,
    pub first_write_timeout: Duration,
}

pub struct Supervisor<C> {
    client: Arc<C>,
    config: SupervisorConfig,
    authenticator: Authenticator<C>,
    registry: Arc<ServiceRegistry<C>>,
    cert_manager: Arc<CertManager<C>>,
    reconciler: Arc<IntentionsReconciler<C>>,
    secret_manager: Arc<SecretManager>,
    sds_server: SdsServer,
    proxy_manager: ProxyManager,
}

impl<C> Supervisor<C>
where
    C: Client + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<C>,
        config: SupervisorConfig,
        authenticator: Authenticator<C>,
        registry: Arc<ServiceRegistry<C>>,
        cert_manager: Arc<CertManager<C>>,
        reconciler: Arc<IntentionsReconciler<C>>,
        secret_manager: Arc<SecretManager>,
        sds_server: SdsServer,
        proxy_manager: ProxyManager,
    ) -> Self {
        Supervisor {
            client,
            config,
            authenticator,
            registry,
            cert_manager,
            reconciler,
            secret_manager,
            sds_server,
            proxy_manager,
        }
    }

    /// Run until cancellation or the first subsystem failure. Always
    /// attempts deregistration on the way out.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        log::info!("starting sidecar for gateway {}", self.config.gateway);
        let token = self
            .authenticator
            .authenticate(&cancel, &self.config.gateway.service)
            .await?;
        self.client.set_token(&token);

        let registry = self.registry.clone();
        let result = self.run_registered(&cancel, token).await;

        // Shutdown runs in reverse of startup; by now every subsystem has
        // been cancelled or dropped, so withdraw the registration last, on
        // a fresh token because the root is already cancelled.
        cancel.cancel();
        if let Err(err) = registry.deregister(&CancellationToken::new()).await {
            log::error!("deregistration during shutdown failed: {err}");
        }
        result
    }

    async fn run_registered(
        self,
        cancel: &CancellationToken,
        token: String,
    ) -> Result<(), Error> {
        self.registry.register(cancel).await?;

        // Certificates next; nothing else can serve until the first write.
        let mut manage = {
            let cert_manager = self.cert_manager.clone();
            let manage_cancel = cancel.child_token();
            tokio::spawn(async move { cert_manager.manage(manage_cancel).await })
        };
        tokio::select! {
            result = self.cert_manager.wait_for_write(self.config.first_write_timeout) => result?,
            result = &mut manage => {
                return Err(match result {
                    Ok(Ok(())) => Error::Join("certificate watch exited early".to_owned()),
                    Ok(Err(err)) => Error::Certs(err),
                    Err(err) => Error::Join(err.to_string()),
                });
            }
        }

        let sds_cluster = self.cert_manager.render_sds_config()?;
        let bootstrap_config = BootstrapConfig {
            node_id: self.registry.id().to_owned(),
            node_cluster: self.config.gateway.service.clone(),
            namespace: match self.config.gateway.canonical_namespace() {
                "" => None,
                ns => Some(ns.to_owned()),
            },
            xds_address: self.config.xds_address.clone(),
            xds_port: self.config.xds_port,
            token,
            admin_address: self.config.admin_address.clone(),
            admin_port: self.config.admin_port,
            ready_port: self.config.ready_port,
        };
        self.proxy_manager
            .write_bootstrap(&proxy::render(&bootstrap_config, sds_cluster))?;

        let bound_sds = self.sds_server.bind().await?;

        for upstream in &self.config.upstreams {
            self.reconciler.watch_upstream(cancel, upstream.clone());
        }

        // Everything long-lived runs in one error group; the first failure
        // wins and the rest are torn down with it.
        let cert_group = async {
            match manage.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Error::Certs(err)),
                Err(err) => Err(Error::Join(err.to_string())),
            }
        };
        let sds_group = bound_sds.serve(cancel.clone());
        let reconciler = self.reconciler.clone();
        let reconciler_group = reconciler.run(cancel.clone());
        let secret_manager = self.secret_manager.clone();
        let secrets_group = async {
            secret_manager.manage(cancel.child_token()).await;
            Ok::<(), Error>(())
        };
        let proxy_group = self.proxy_manager.run(cancel.clone());

        tokio::try_join!(
            cert_group,
            async { sds_group.await.map_err(Error::Sds) },
            async { reconciler_group.await.map_err(Error::Intentions) },
            secrets_group,
            async { proxy_group.await.map_err(Error::Proxy) },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
