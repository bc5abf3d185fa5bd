// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use certs::TlsMaterialSource;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;
use secrets::SecretManager;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::cache::DeltaCache;
use crate::service::SdsService;
use crate::store::GatewayRegistry;
use crate::tls::{server_config, TlsConnection};
use crate::Error;

/// How long a cancelled server waits for open streams before stopping hard.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SdsServerConfig {
    pub address: String,
    pub port: u16,
}

pub struct SdsServer {
    config: SdsServerConfig,
    tls_source: Arc<dyn TlsMaterialSource>,
    service: SdsService,
}

/// A server that has bound its listener but not yet started serving.
/// Splitting bind from serve lets callers learn the bound port first.
pub struct BoundSdsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls_source: Arc<dyn TlsMaterialSource>,
    service: SdsService,
}

impl SdsServer {
    pub fn new(
        config: SdsServerConfig,
        tls_source: Arc<dyn TlsMaterialSource>,
        store: Arc<dyn GatewayRegistry>,
        secrets: Arc<SecretManager>,
        cache: Arc<DeltaCache>,
    ) -> Self {
        SdsServer {
            config,
            tls_source,
            service: SdsService::new(store, secrets, cache),
        }
    }

    pub async fn bind(self) -> Result<BoundSdsServer, Error> {
        let address = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&address).await.map_err(|err| Error::Bind {
            address: address.clone(),
            message: err.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|err| Error::Bind {
            address,
            message: err.to_string(),
        })?;
        Ok(BoundSdsServer {
            listener,
            local_addr,
            tls_source: self.tls_source,
            service: self.service,
        })
    }
}

impl BoundSdsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until cancelled, then stop gracefully with a hard deadline.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), Error> {
        let (conn_tx, conn_rx) = mpsc::channel::<Result<TlsConnection, std::io::Error>>(16);

        // Accept loop: every connection gets a TLS config built from the
        // cert manager's state at that instant, so rotations apply on the
        // very next handshake.
        let accept_cancel = cancel.clone();
        let tls_source = self.tls_source.clone();
        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_cancel.cancelled() => return,
                };
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::error!("sds accept failed: {err}");
                        continue;
                    }
                };
                let snapshot = match tls_source.snapshot() {
                    Some(snapshot) => snapshot,
                    None => {
                        log::warn!("rejecting sds connection from {remote_addr}: no TLS material yet");
                        continue;
                    }
                };
                let config = match server_config(&snapshot) {
                    Ok(config) => config,
                    Err(err) => {
                        log::error!("unable to build sds TLS config: {err}");
                        continue;
                    }
                };
                let acceptor = TlsAcceptor::from(Arc::new(config));
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let _ = conn_tx
                                .send(Ok(TlsConnection::new(tls_stream, Some(remote_addr))))
                                .await;
                        }
                        Err(err) => {
                            log::warn!("sds handshake with {remote_addr} failed: {err}");
                        }
                    }
                });
            }
        });

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<SecretDiscoveryServiceServer<SdsService>>()
            .await;

        log::info!("serving sds on {}", self.local_addr);
        let serve = Server::builder()
            .add_service(health_service)
            .add_service(SecretDiscoveryServiceServer::new(self.service))
            .serve_with_incoming_shutdown(ReceiverStream::new(conn_rx), cancel.clone().cancelled_owned());

        let forced_stop = async {
            cancel.cancelled().await;
            tokio::time::sleep(GRACEFUL_STOP_TIMEOUT).await;
        };
        tokio::select! {
            result = serve => result.map_err(Error::Transport),
            _ = forced_stop => {
                log::warn!("sds graceful stop timed out; stopping hard");
                Ok(())
            }
        }
    }
}
