// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, Resource,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService;
use envoy_types::pb::google::protobuf::Any;
use futures::Stream;
use parking_lot::Mutex;
use prost::Message;
use secrets::SecretManager;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::auth;
use crate::cache::{DeltaCache, DeltaUpdate};
use crate::store::GatewayRegistry;
use crate::tls::SdsConnectInfo;
use crate::SECRET_TYPE_URL;

const ACTIVE_STREAMS_GAUGE: &str = "sds_active_streams";

struct StreamContext {
    gateway: consul::GatewayId,
    /// Node id persisted from the first request that carried one.
    node_id: Option<String>,
}

struct SdsServiceInner {
    store: Arc<dyn GatewayRegistry>,
    secrets: Arc<SecretManager>,
    cache: Arc<DeltaCache>,
    /// Explicit per-stream contexts; a missing entry means the stream
    /// already closed and handlers no-op.
    streams: Mutex<HashMap<u64, StreamContext>>,
    next_stream_id: AtomicU64,
}

#[derive(Clone)]
pub struct SdsService {
    inner: Arc<SdsServiceInner>,
}

impl SdsService {
    pub fn new(
        store: Arc<dyn GatewayRegistry>,
        secrets: Arc<SecretManager>,
        cache: Arc<DeltaCache>,
    ) -> Self {
        SdsService {
            inner: Arc::new(SdsServiceInner {
                store,
                secrets,
                cache,
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU64::new(1),
            }),
        }
    }
}

impl SdsServiceInner {
    fn open_stream(&self, gateway: consul::GatewayId) -> u64 {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(
            stream_id,
            StreamContext {
                gateway,
                node_id: None,
            },
        );
        metrics::increment_gauge!(ACTIVE_STREAMS_GAUGE, 1.0);
        stream_id
    }

    async fn close_stream(&self, stream_id: u64) {
        let context = self.streams.lock().remove(&stream_id);
        if let Some(context) = context {
            if let Some(node_id) = context.node_id {
                self.secrets.unwatch_all(&node_id).await;
            }
            metrics::decrement_gauge!(ACTIVE_STREAMS_GAUGE, 1.0);
        }
        self.cache.drop_stream(stream_id);
    }

    /// Apply one delta request: persist the node id, authorize and watch
    /// the subscribe set, unwatch the unsubscribe set.
    async fn handle_request(
        &self,
        stream_id: u64,
        request: DeltaDiscoveryRequest,
    ) -> Result<(), Status> {
        if request.type_url != SECRET_TYPE_URL {
            return Err(Status::unimplemented(format!(
                "unsupported type URL {:?}",
                request.type_url
            )));
        }
        if let Some(detail) = &request.error_detail {
            log::warn!("sds client rejected a previous response: {}", detail.message);
        }

        let (gateway, node_id) = {
            let mut streams = self.streams.lock();
            let context = match streams.get_mut(&stream_id) {
                Some(context) => context,
                // Stream already closed; nothing to do.
                None => return Ok(()),
            };
            if context.node_id.is_none() {
                let from_request = request
                    .node
                    .as_ref()
                    .map(|node| node.id.clone())
                    .filter(|id| !id.is_empty());
                context.node_id = from_request;
            }
            (context.gateway.clone(), context.node_id.clone())
        };
        let node_id = node_id
            .ok_or_else(|| Status::invalid_argument("first request carried no node id"))?;

        if !request.resource_names_subscribe.is_empty() {
            if !self
                .store
                .can_fetch(&gateway, &request.resource_names_subscribe)
            {
                log::error!(
                    "gateway {gateway} requested secrets it was not granted: {:?}",
                    request.resource_names_subscribe
                );
                return Err(Status::permission_denied(
                    "gateway is not allowed to fetch the requested secrets",
                ));
            }
            // Subscribe before watching so the fetch-triggered update is
            // not lost between the two calls.
            self.cache
                .subscribe(stream_id, &request.resource_names_subscribe);
            self.secrets
                .watch(&request.resource_names_subscribe, &node_id)
                .await
                .map_err(|err| {
                    log::error!("failed to watch secrets for node {node_id}: {err}");
                    Status::internal("unable to fetch requested secrets")
                })?;
        }

        if !request.resource_names_unsubscribe.is_empty() {
            self.secrets
                .unwatch(&request.resource_names_unsubscribe, &node_id)
                .await;
            self.cache
                .unsubscribe(stream_id, &request.resource_names_unsubscribe);
        }
        Ok(())
    }
}

fn delta_response(update: DeltaUpdate, nonce: u64) -> DeltaDiscoveryResponse {
    let resources = update
        .updated
        .into_iter()
        .map(|versioned| Resource {
            name: versioned.name,
            version: versioned.version.to_string(),
            resource: Some(Any {
                type_url: SECRET_TYPE_URL.to_owned(),
                value: versioned.secret.encode_to_vec(),
            }),
            ..Default::default()
        })
        .collect();
    DeltaDiscoveryResponse {
        system_version_info: update.system_version.to_string(),
        resources,
        type_url: SECRET_TYPE_URL.to_owned(),
        removed_resources: update.removed,
        nonce: nonce.to_string(),
        ..Default::default()
    }
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;
type SotwResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

#[tonic::async_trait]
impl SecretDiscoveryService for SdsService {
    type DeltaSecretsStream = ResponseStream;
    type StreamSecretsStream = SotwResponseStream;

    #[tracing::instrument(skip_all)]
    async fn delta_secrets(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        let connect_info = request
            .extensions()
            .get::<SdsConnectInfo>()
            .cloned()
            .ok_or_else(|| Status::unauthenticated("connection carried no TLS information"))?;
        let gateway = auth::authorize(self.inner.store.as_ref(), &connect_info.peer_certificates)?;
        log::info!("sds stream opened by gateway {gateway}");

        let stream_id = self.inner.open_stream(gateway);
        let mut cache_rx = self.inner.cache.register_stream(stream_id);
        let (response_tx, response_rx) = mpsc::channel::<Result<DeltaDiscoveryResponse, Status>>(16);

        let inner = self.inner.clone();
        let mut inbound = request.into_inner();
        tokio::spawn(async move {
            let mut nonce = 0u64;
            loop {
                tokio::select! {
                    message = inbound.message() => match message {
                        Ok(Some(request)) => {
                            if let Err(status) = inner.handle_request(stream_id, request).await {
                                let _ = response_tx.send(Err(status)).await;
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(status) => {
                            log::debug!("sds stream {stream_id} failed: {status}");
                            break;
                        }
                    },
                    update = cache_rx.recv() => match update {
                        Some(update) => {
                            nonce += 1;
                            if response_tx
                                .send(Ok(delta_response(update, nonce)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            inner.close_stream(stream_id).await;
            log::info!("sds stream {stream_id} closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(response_rx))))
    }

    async fn stream_secrets(
        &self,
        _request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        Err(Status::unimplemented(
            "state-of-the-world SDS is not served; use the delta variant",
        ))
    }

    async fn fetch_secrets(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented(
            "state-of-the-world SDS is not served; use the delta variant",
        ))
    }
}
