// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::Arc;

use certs::{CertManager, CertManagerConfig};
use clap::{Arg, Command};
use consul::http::HttpClient;
use consul::{GatewayId, ServiceName};
use grpc_util::logging::setup_logging;
use intentions::{IntentionsReconciler, ReconcilerConfig};
use proxy::{ProxyManager, ProxyManagerConfig};
use registry::{Authenticator, AuthenticatorConfig, ServiceRegistry, ServiceRegistryConfig};
use sds::{DeltaCache, MemoryGatewayRegistry, SdsServer, SdsServerConfig};
use secrets::{FileSecretClient, MultiSecretClient, SecretManager, SecretManagerConfig, FILE_PROTOCOL};
use sidecar::{Supervisor, SupervisorConfig, DEFAULT_FIRST_WRITE_TIMEOUT};
use tokio_util::sync::CancellationToken;

mod config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("gateway_sidecar")
        .arg(
            Arg::new("config")
                .short('c')
                .required(true)
                .value_name("FILE"),
        )
        .get_matches();

    let config = {
        let filename = matches.get_one::<String>("config").unwrap();
        let config_content = tokio::fs::read_to_string(&filename)
            .await
            .map_err(|err| format!("Failed to read config from {}: {}", &filename, err))?;
        config::Config::from_str(&config_content)?
    };

    setup_logging(&config.log.level, config.log.json)?;
    log::info!("sidecar config: {config:?}");

    let gateway = GatewayId::new(
        config.gateway.namespace.clone().unwrap_or_default(),
        config.gateway.name.clone(),
    );
    let client = Arc::new(HttpClient::new(&config.consul)?);

    let mut auth_config =
        AuthenticatorConfig::new(config.auth.method.clone(), &config.auth.bearer_token_path);
    auth_config.namespace = config.auth.namespace.clone();
    let authenticator = Authenticator::new(client.clone(), auth_config);

    let mut registry_config = ServiceRegistryConfig::new(
        config.gateway.name.clone(),
        config.envoy.admin_address.clone(),
        config.envoy.ready_port,
    );
    registry_config.namespace = config.gateway.namespace.clone();
    registry_config.partition = config.gateway.partition.clone();
    registry_config.listeners = config
        .listeners
        .iter()
        .map(|listener| consul::NamedPort {
            name: listener.name.clone(),
            address: listener.address.clone(),
            port: listener.port,
        })
        .collect();
    let registry = Arc::new(ServiceRegistry::new(client.clone(), registry_config));

    let cert_manager = Arc::new(CertManager::new(
        client.clone(),
        gateway.clone(),
        CertManagerConfig::new(
            &config.certs_directory,
            config.sds.address.clone(),
            config.sds.port,
        ),
    ));

    let reconciler = Arc::new(IntentionsReconciler::new(
        client.clone(),
        gateway.clone(),
        ReconcilerConfig::default(),
    ));

    let mut secret_client = MultiSecretClient::new();
    secret_client.register(FILE_PROTOCOL, Arc::new(FileSecretClient));
    let cache = Arc::new(DeltaCache::new());
    let secret_manager = Arc::new(SecretManager::new(
        Arc::new(secret_client),
        cache.clone(),
        SecretManagerConfig::default(),
    ));

    let store = Arc::new(MemoryGatewayRegistry::new());
    store.add_gateway(gateway.clone());
    for secret in &config.secrets {
        store.grant(&gateway, secret);
    }
    let sds_server = SdsServer::new(
        SdsServerConfig {
            address: config.sds.address.clone(),
            port: config.sds.port,
        },
        cert_manager.clone(),
        store,
        secret_manager.clone(),
        cache,
    );

    proxy::check_binary(&config.envoy.binary_path)?;
    let proxy_manager = ProxyManager::new(ProxyManagerConfig {
        binary_path: config.envoy.binary_path.clone(),
        bootstrap_path: config.envoy.bootstrap_path.clone(),
        log_level: config.envoy.log_level.clone(),
        log_format: config.envoy.log_format.clone(),
    });

    let upstreams = config
        .upstreams
        .iter()
        .map(|upstream| ServiceName::new(upstream.namespace.clone(), upstream.name.clone()))
        .collect();
    let supervisor = Supervisor::new(
        client,
        SupervisorConfig {
            gateway,
            xds_address: config.envoy.xds_address.clone(),
            xds_port: config.envoy.xds_port,
            admin_address: config.envoy.admin_address.clone(),
            admin_port: config.envoy.admin_port,
            ready_port: config.envoy.ready_port,
            upstreams,
            first_write_timeout: DEFAULT_FIRST_WRITE_TIMEOUT,
        },
        authenticator,
        registry,
        cert_manager,
        reconciler,
        secret_manager,
        sds_server,
        proxy_manager,
    );

    // SIGINT/SIGTERM cancel the root token; the supervisor unwinds in
    // reverse start order and deregisters before we exit 0.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("attach SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("attach SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            log::info!("Received shutdown signal. Starting graceful shutdown ...");
            cancel.cancel();
        });
    }

    supervisor.run(cancel).await?;
    Ok(())
}
