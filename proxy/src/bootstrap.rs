// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Rendering of the proxy's bootstrap document: admin endpoint, node
//! identity, the ADS connection back to the control plane (authenticated
//! with the session token), the SDS cluster snippet, and a fixed readiness
//! listener on the admin port.

use serde_json::{json, Value};

pub const XDS_CLUSTER_NAME: &str = "consul-xds";
pub const READY_LISTENER_NAME: &str = "ready";
pub const READY_PATH: &str = "/ready";

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Node id the proxy reports to the control plane; the registration id.
    pub node_id: String,
    /// Gateway service name, used as the node cluster.
    pub node_cluster: String,
    pub namespace: Option<String>,
    /// Control-plane xDS endpoint.
    pub xds_address: String,
    pub xds_port: u16,
    /// Session token carried as `x-consul-token` initial metadata on ADS
    /// calls.
    pub token: String,
    /// Local admin endpoint; the readiness listener binds its port + 1.
    pub admin_address: String,
    pub admin_port: u16,
    pub ready_port: u16,
}

/// Render the full bootstrap document. `sds_cluster` is the snippet the
/// cert manager produced for the local SDS endpoint.
pub fn render(config: &BootstrapConfig, sds_cluster: Value) -> Value {
    let mut node_metadata = serde_json::Map::new();
    if let Some(namespace) = config.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        node_metadata.insert("namespace".to_owned(), json!(namespace));
    }

    json!({
        "admin": {
            "access_log_path": "/dev/null",
            "address": {
                "socket_address": {
                    "address": config.admin_address,
                    "port_value": config.admin_port,
                },
            },
        },
        "node": {
            "id": config.node_id,
            "cluster": config.node_cluster,
            "metadata": Value::Object(node_metadata),
        },
        "static_resources": {
            "clusters": [xds_cluster(config), sds_cluster],
            "listeners": [ready_listener(config)],
        },
        "dynamic_resources": {
            "lds_config": {
                "ads": {},
                "resource_api_version": "V3",
            },
            "cds_config": {
                "ads": {},
                "resource_api_version": "V3",
            },
            "ads_config": {
                "api_type": "DELTA_GRPC",
                "transport_api_version": "V3",
                "grpc_services": [{
                    "initial_metadata": [{
                        "key": "x-consul-token",
                        "value": config.token,
                    }],
                    "envoy_grpc": {
                        "cluster_name": XDS_CLUSTER_NAME,
                    },
                }],
            },
        },
        "stats_config": {
            "stats_tags": [{
                "tag_name": "gateway",
                "fixed_value": config.node_cluster,
            }],
        },
    })
}

fn xds_cluster(config: &BootstrapConfig) -> Value {
    json!({
        "name": XDS_CLUSTER_NAME,
        "connect_timeout": "5s",
        "type": "STRICT_DNS",
        "typed_extension_protocol_options": {
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                "explicit_http_config": {
                    "http2_protocol_options": {},
                },
            },
        },
        "load_assignment": {
            "cluster_name": XDS_CLUSTER_NAME,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": {
                        "address": {
                            "socket_address": {
                                "address": config.xds_address,
                                "port_value": config.xds_port,
                            },
                        },
                    },
                }],
            }],
        },
    })
}

/// A static listener answering 200 on the readiness path, so the TCP and
/// HTTP health probes have something to hit before any gateway listener is
/// configured.
fn ready_listener(config: &BootstrapConfig) -> Value {
    json!({
        "name": READY_LISTENER_NAME,
        "address": {
            "socket_address": {
                "address": config.admin_address,
                "port_value": config.ready_port,
            },
        },
        "filter_chains": [{
            "filters": [{
                "name": "envoy.filters.network.http_connection_manager",
                "typed_config": {
                    "@type": "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                    "stat_prefix": "ready",
                    "route_config": {
                        "virtual_hosts": [{
                            "name": "ready",
                            "domains": ["*"],
                            "routes": [{
                                "match": { "path": READY_PATH },
                                "direct_response": {
                                    "status": 200,
                                    "body": { "inline_string": "OK" },
                                },
                            }],
                        }],
                    },
                    "http_filters": [{
                        "name": "envoy.filters.http.router",
                        "typed_config": {
                            "@type": "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router",
                        },
                    }],
                },
            }],
        }],
    })
}
