// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Rendering of the SDS bootstrap material the proxy consumes: two on-disk
//! secret-resource files pointing at the persisted PEMs, and the static
//! cluster snippet that tells the proxy where the SDS endpoint lives.

use std::net::IpAddr;
use std::path::Path;

use serde_json::{json, Value};

use crate::{Error, CLIENT_CERT_FILE, CLIENT_KEY_FILE, ROOT_CA_FILE};

pub const TLS_SDS_FILE: &str = "tls-sds.json";
pub const VALIDATION_CONTEXT_SDS_FILE: &str = "validation-context-sds.json";

pub const TLS_CERT_RESOURCE_NAME: &str = "tls-sds";
pub const VALIDATION_CONTEXT_RESOURCE_NAME: &str = "validation-context-sds";

const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

pub const SDS_CLUSTER_NAME: &str = "sds-cluster";

/// Write `tls-sds.json` and `validation-context-sds.json` into `directory`,
/// referencing the identity files the cert manager persists there.
pub fn write_sds_resource_files(directory: &Path) -> Result<(), Error> {
    let tls = json!({
        "resources": [{
            "@type": SECRET_TYPE_URL,
            "name": TLS_CERT_RESOURCE_NAME,
            "tls_certificate": {
                "certificate_chain": {
                    "filename": directory.join(CLIENT_CERT_FILE),
                },
                "private_key": {
                    "filename": directory.join(CLIENT_KEY_FILE),
                },
            },
        }],
    });
    let validation = json!({
        "resources": [{
            "@type": SECRET_TYPE_URL,
            "name": VALIDATION_CONTEXT_RESOURCE_NAME,
            "validation_context": {
                "trusted_ca": {
                    "filename": directory.join(ROOT_CA_FILE),
                },
            },
        }],
    });
    write_json(&directory.join(TLS_SDS_FILE), &tls)?;
    write_json(&directory.join(VALIDATION_CONTEXT_SDS_FILE), &validation)
}

fn write_json(path: &Path, value: &Value) -> Result<(), Error> {
    let rendered = serde_json::to_vec_pretty(value)
        .map_err(|err| Error::Persist(format!("{}: {err}", path.display())))?;
    std::fs::write(path, rendered)
        .map_err(|err| Error::Persist(format!("{}: {err}", path.display())))
}

/// The cluster snippet the proxy bootstrap embeds so it can dial the local
/// SDS endpoint over TLS with the persisted identity.
pub fn sds_cluster(sds_address: &str, sds_port: u16, directory: &Path) -> Value {
    let cluster_type = if sds_address.parse::<IpAddr>().is_ok() {
        "STATIC"
    } else {
        "STRICT_DNS"
    };
    json!({
        "name": SDS_CLUSTER_NAME,
        "connect_timeout": "5s",
        "type": cluster_type,
        "typed_extension_protocol_options": {
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                "explicit_http_config": {
                    "http2_protocol_options": {},
                },
            },
        },
        "transport_socket": {
            "name": "tls",
            "typed_config": {
                "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
                "common_tls_context": {
                    "tls_certificate_sds_secret_configs": [{
                        "name": TLS_CERT_RESOURCE_NAME,
                        "sds_config": {
                            "path": directory.join(TLS_SDS_FILE),
                            "resource_api_version": "V3",
                        },
                    }],
                    "validation_context_sds_secret_config": {
                        "name": VALIDATION_CONTEXT_RESOURCE_NAME,
                        "sds_config": {
                            "path": directory.join(VALIDATION_CONTEXT_SDS_FILE),
                            "resource_api_version": "V3",
                        },
                    },
                },
            },
        },
        "load_assignment": {
            "cluster_name": SDS_CLUSTER_NAME,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": {
                        "address": {
                            "socket_address": {
                                "address": sds_address,
                                "port_value": sds_port,
                            },
                        },
                    },
                }],
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{
        sds_cluster, write_sds_resource_files, TLS_SDS_FILE, VALIDATION_CONTEXT_SDS_FILE,
    };

    #[test]
    fn cluster_type_tracks_address_kind() {
        let dir = Path::new("/certs");
        let by_name = sds_cluster("localhost", 9090, dir);
        assert_eq!(by_name["type"], "STRICT_DNS");
        let by_ip = sds_cluster("127.0.0.1", 9090, dir);
        assert_eq!(by_ip["type"], "STATIC");

        let endpoint = &by_name["load_assignment"]["endpoints"][0]["lb_endpoints"][0]["endpoint"]
            ["address"]["socket_address"];
        assert_eq!(endpoint["address"], "localhost");
        assert_eq!(endpoint["port_value"], 9090);
    }

    #[test]
    fn resource_files_reference_identity_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_sds_resource_files(dir.path()).unwrap();

        let tls: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(TLS_SDS_FILE)).unwrap(),
        )
        .unwrap();
        let chain = tls["resources"][0]["tls_certificate"]["certificate_chain"]["filename"]
            .as_str()
            .unwrap();
        assert!(chain.ends_with("client.crt"));

        let validation: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(VALIDATION_CONTEXT_SDS_FILE)).unwrap(),
        )
        .unwrap();
        let ca = validation["resources"][0]["validation_context"]["trusted_ca"]["filename"]
            .as_str()
            .unwrap();
        assert!(ca.ends_with("root-ca.pem"));
    }
}
