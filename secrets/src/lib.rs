// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Reference-counted TLS-secret cache fronting pluggable secret sources.
//!
//! `SecretManager` tracks which SDS node watches which secret name, fetches
//! through a `SecretClient` on first subscription, pushes material into the
//! downstream `SecretCache` (which notifies open streams), and evicts both
//! sides together when the last watcher goes away.

pub mod manager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;

pub use manager::{SecretManager, SecretManagerConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The scheme of a secret name has no registered client.
    #[error("no secret client registered for protocol {0:?}")]
    InvalidSecretProtocol(String),

    /// The secret name is not a `scheme://` URI.
    #[error("invalid secret name {0:?}")]
    InvalidSecretName(String),

    #[error("failed to fetch secret {name}: {message}")]
    Fetch { name: String, message: String },
}

/// A fetched secret plus the instant it must be refreshed around.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedSecret {
    pub secret: tls_v3::Secret,
    pub expires_at: SystemTime,
}

/// Fetches TLS material by opaque secret-name URI.
#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn fetch_secret(&self, name: &str) -> Result<FetchedSecret, Error>;
}

/// The downstream resource cache feeding open SDS streams. Mutations are
/// synchronous so the manager can pair them with its own bookkeeping inside
/// one critical section.
pub trait SecretCache: Send + Sync {
    fn update_resource(&self, name: &str, secret: tls_v3::Secret);
    fn delete_resource(&self, name: &str);
}

/// Routes each fetch to the client registered for the scheme part of the
/// secret-name URI.
#[derive(Default)]
pub struct MultiSecretClient {
    clients: HashMap<String, Arc<dyn SecretClient>>,
}

impl MultiSecretClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: impl Into<String>, client: Arc<dyn SecretClient>) {
        self.clients.insert(protocol.into(), client);
    }
}

#[async_trait]
impl SecretClient for MultiSecretClient {
    async fn fetch_secret(&self, name: &str) -> Result<FetchedSecret, Error> {
        let (protocol, _) = name
            .split_once("://")
            .ok_or_else(|| Error::InvalidSecretName(name.to_owned()))?;
        let client = self
            .clients
            .get(protocol)
            .ok_or_else(|| Error::InvalidSecretProtocol(protocol.to_owned()))?;
        client.fetch_secret(name).await
    }
}

/// Reads `tls.crt`/`tls.key` out of the directory named by a
/// `file://<directory>` secret name. Expiry comes from the certificate
/// itself so the refresh loop picks up rotated files.
pub struct FileSecretClient;

pub const FILE_PROTOCOL: &str = "file";

const TLS_CERT_NAME: &str = "tls.crt";
const TLS_KEY_NAME: &str = "tls.key";

#[async_trait]
impl SecretClient for FileSecretClient {
    async fn fetch_secret(&self, name: &str) -> Result<FetchedSecret, Error> {
        let directory = name
            .strip_prefix("file://")
            .ok_or_else(|| Error::InvalidSecretName(name.to_owned()))?;
        let directory = std::path::Path::new(directory);
        let read = |file: &str| {
            let path = directory.join(file);
            std::fs::read(&path).map_err(|err| Error::Fetch {
                name: name.to_owned(),
                message: format!("{}: {err}", path.display()),
            })
        };
        let cert_pem = read(TLS_CERT_NAME)?;
        let key_pem = read(TLS_KEY_NAME)?;
        let expires_at = certificate_expiry(&cert_pem).ok_or_else(|| Error::Fetch {
            name: name.to_owned(),
            message: "unable to parse certificate expiry".to_owned(),
        })?;
        Ok(FetchedSecret {
            secret: tls_certificate_secret(name, &cert_pem, &key_pem),
            expires_at,
        })
    }
}

/// Wrap PEM material into the wire secret the proxy consumes.
pub fn tls_certificate_secret(name: &str, cert_pem: &[u8], key_pem: &[u8]) -> tls_v3::Secret {
    use envoy_types::pb::envoy::config::core::v3 as core_v3;

    tls_v3::Secret {
        name: name.to_owned(),
        r#type: Some(tls_v3::secret::Type::TlsCertificate(tls_v3::TlsCertificate {
            certificate_chain: Some(core_v3::DataSource {
                specifier: Some(core_v3::data_source::Specifier::InlineBytes(
                    cert_pem.to_vec(),
                )),
                ..Default::default()
            }),
            private_key: Some(core_v3::DataSource {
                specifier: Some(core_v3::data_source::Specifier::InlineBytes(
                    key_pem.to_vec(),
                )),
                ..Default::default()
            }),
            ..Default::default()
        })),
    }
}

fn certificate_expiry(cert_pem: &[u8]) -> Option<SystemTime> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem).ok()?;
    let cert = pem.parse_x509().ok()?;
    let timestamp = cert.validity().not_after.timestamp();
    u64::try_from(timestamp)
        .ok()
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;

    use super::{
        tls_certificate_secret, Error, FetchedSecret, FileSecretClient, MultiSecretClient,
        SecretClient,
    };

    struct StaticClient(FetchedSecret);

    #[async_trait]
    impl SecretClient for StaticClient {
        async fn fetch_secret(&self, _name: &str) -> Result<FetchedSecret, Error> {
            Ok(self.0.clone())
        }
    }

    fn fetched(name: &str) -> FetchedSecret {
        FetchedSecret {
            secret: tls_certificate_secret(name, b"cert", b"key"),
            expires_at: UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn multi_client_routes_by_scheme() {
        let mut multi = MultiSecretClient::new();
        multi.register("k8s", Arc::new(StaticClient(fetched("k8s://ns/name"))));

        let secret = multi.fetch_secret("k8s://ns/name").await.unwrap();
        assert_eq!(secret.secret.name, "k8s://ns/name");

        assert!(matches!(
            multi.fetch_secret("vault://path").await,
            Err(Error::InvalidSecretProtocol(protocol)) if protocol == "vault"
        ));
        assert!(matches!(
            multi.fetch_secret("no-scheme").await,
            Err(Error::InvalidSecretName(_))
        ));
    }

    #[tokio::test]
    async fn file_client_reads_material_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["svc".to_owned()]).unwrap();
        std::fs::write(dir.path().join("tls.crt"), certified.cert.pem()).unwrap();
        std::fs::write(dir.path().join("tls.key"), certified.key_pair.serialize_pem()).unwrap();

        let name = format!("file://{}", dir.path().display());
        let secret = FileSecretClient.fetch_secret(&name).await.unwrap();
        assert_eq!(secret.secret.name, name);
        assert!(secret.expires_at > SystemTime::now());

        let missing = format!("file://{}/nope", dir.path().display());
        assert!(matches!(
            FileSecretClient.fetch_secret(&missing).await,
            Err(Error::Fetch { .. })
        ));
    }
}
