// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Certificate lifecycle for the sidecar's service identity.
//!
//! `CertManager` watches the control plane's CA roots and the leaf
//! certificate issued for this gateway, keeps the current `(root, leaf,
//! key)` triple behind one lock so readers never observe a mismatched
//! pair, persists the PEMs for the proxy, and signals readiness exactly
//! once after the first successful persist.

pub mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use consul::types::{CaRootSet, LeafCert, QueryOptions};
use consul::{ConnectCaClient, GatewayId};
use grpc_util::retry::{retry_constant, RetryConfig, RetryError};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const ROOT_CA_FILE: &str = "root-ca.pem";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.pem";

const DEFAULT_EXPIRATION_BUFFER: Duration = Duration::from_secs(10 * 60);

/// Smallest delay before re-requesting a leaf that is already inside its
/// expiration buffer, so a short-lived certificate cannot hot-loop us.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control plane: {0}")]
    Consul(#[from] consul::Error),

    #[error("roots watch failed: {0}")]
    RootsWatch(String),

    #[error("leaf watch failed: {0}")]
    LeafWatch(String),

    #[error("unable to persist certificates: {0}")]
    Persist(String),

    #[error("timed out waiting for initial certificates")]
    FirstWriteTimeout,

    #[error("cancelled")]
    Cancelled,
}

/// One coherent view of the current TLS material. Built under a single
/// read lock so the root and leaf always belong together.
#[derive(Clone, Debug)]
pub struct CertSnapshot {
    /// PEM of the active root.
    pub root_ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// PEM of every root in the trust pool, active one included.
    pub root_pool: Vec<String>,
    pub not_after: SystemTime,
}

/// Read access to live TLS material, consulted on every TLS handshake.
pub trait TlsMaterialSource: Send + Sync {
    /// Returns `None` until the manager has both a root and a leaf.
    fn snapshot(&self) -> Option<CertSnapshot>;
}

#[derive(Clone, Debug)]
pub struct CertManagerConfig {
    /// Writable directory for `root-ca.pem`, `client.crt`, `client.pem`.
    pub directory: PathBuf,
    /// Address the embedded proxy will dial for SDS.
    pub sds_address: String,
    pub sds_port: u16,
    /// Renew the leaf this long before its `not_after`.
    pub expiration_buffer: Duration,
    pub retry: RetryConfig,
}

impl CertManagerConfig {
    pub fn new(directory: impl Into<PathBuf>, sds_address: impl Into<String>, sds_port: u16) -> Self {
        CertManagerConfig {
            directory: directory.into(),
            sds_address: sds_address.into(),
            sds_port,
            expiration_buffer: DEFAULT_EXPIRATION_BUFFER,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Default)]
struct CertState {
    roots: Option<CaRootSet>,
    /// PEM of the active root, cached out of the pool.
    root_pem: Option<String>,
    leaf: Option<LeafCert>,
}

impl CertState {
    fn initialized(&self) -> bool {
        self.root_pem.is_some() && self.leaf.is_some()
    }
}

pub struct CertManager<C> {
    client: Arc<C>,
    gateway: GatewayId,
    config: CertManagerConfig,
    state: RwLock<CertState>,
    first_write_tx: watch::Sender<bool>,
    first_write_rx: watch::Receiver<bool>,
}

impl<C> CertManager<C>
where
    C: ConnectCaClient + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, gateway: GatewayId, config: CertManagerConfig) -> Self {
        let (first_write_tx, first_write_rx) = watch::channel(false);
        CertManager {
            client,
            gateway,
            config,
            state: RwLock::new(CertState::default()),
            first_write_tx,
            first_write_rx,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    pub fn config(&self) -> &CertManagerConfig {
        &self.config
    }

    /// Block until the first persist has completed, within `timeout`.
    pub async fn wait_for_write(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.first_write_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::FirstWriteTimeout)?
    }

    /// Run the roots and leaf watches until cancellation or a terminal
    /// error. A torn-down roots watch is terminal; the supervisor treats it
    /// as fatal.
    pub async fn manage(&self, cancel: CancellationToken) -> Result<(), Error> {
        let roots = self.watch_roots(cancel.clone());
        let leaf = self.watch_leaf(cancel.clone());
        tokio::try_join!(roots, leaf).map(|_| ())
    }

    async fn watch_roots(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut index = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let options = QueryOptions::blocking(index);
            let result = retry_constant(&cancel, self.config.retry, "watch ca roots", || {
                let options = options.clone();
                async move { self.client.ca_roots(&options).await }
            })
            .await;
            let (roots, meta) = match result {
                Ok(ok) => ok,
                Err(RetryError::Cancelled) => return Ok(()),
                Err(RetryError::Exhausted { source, .. }) => {
                    return Err(Error::RootsWatch(source.to_string()));
                }
            };
            if meta.index < index {
                // The control plane may have been restored from a snapshot.
                index = 0;
                continue;
            }
            // Spurious wake: index has not advanced.
            if meta.index == index && index != 0 {
                continue;
            }
            index = meta.index;
            self.update_roots(roots)?;
        }
    }

    async fn watch_leaf(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut index = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let options = QueryOptions::blocking(index);
            let fetch = retry_constant(&cancel, self.config.retry, "watch leaf cert", || {
                let options = options.clone();
                async move { self.client.leaf_cert(&self.gateway.service, &options).await }
            });
            let result = match self.renewal_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        result = fetch => result,
                        _ = tokio::time::sleep(deadline) => {
                            // The leaf is inside its expiration buffer: drop
                            // the parked blocking query and ask again now.
                            index = 0;
                            continue;
                        }
                    }
                }
                None => fetch.await,
            };
            let (leaf, meta) = match result {
                Ok(ok) => ok,
                Err(RetryError::Cancelled) => return Ok(()),
                Err(RetryError::Exhausted { source, .. }) => {
                    return Err(Error::LeafWatch(source.to_string()));
                }
            };
            if meta.index < index {
                index = 0;
                continue;
            }
            if meta.index == index && index != 0 {
                continue;
            }
            index = meta.index;
            self.update_leaf(leaf)?;
        }
    }

    /// How long until the current leaf must be renewed, or `None` when
    /// there is no leaf yet and the blocking query alone drives fetching.
    fn renewal_deadline(&self) -> Option<Duration> {
        let state = self.state.read();
        let leaf = state.leaf.as_ref()?;
        let deadline = leaf
            .not_after
            .checked_sub(self.config.expiration_buffer)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .max(MIN_RENEWAL_DELAY),
        )
    }

    fn update_roots(&self, roots: CaRootSet) -> Result<(), Error> {
        let root_pem = match roots.active_root() {
            Some(root) => root.pem_cert.clone(),
            None => {
                log::warn!("ca roots update carried no active root; keeping previous pool");
                return Ok(());
            }
        };
        {
            let mut state = self.state.write();
            state.root_pem = Some(root_pem);
            state.roots = Some(roots);
        }
        log::info!("updated ca root pool for gateway {}", self.gateway);
        self.persist()
    }

    fn update_leaf(&self, leaf: LeafCert) -> Result<(), Error> {
        // Parse before touching cached state so a malformed push cannot
        // corrupt what the proxy is already using.
        if let Err(err) = validate_leaf(&leaf) {
            log::error!(
                "discarding malformed leaf certificate for gateway {}: {err}",
                self.gateway
            );
            return Ok(());
        }
        {
            let mut state = self.state.write();
            state.leaf = Some(leaf);
        }
        metrics::increment_counter!("sidecar_certificates_rotated_total");
        log::info!("rotated leaf certificate for gateway {}", self.gateway);
        self.persist()
    }

    /// Write the three identity files with mode 0600 and fire the one-shot
    /// first-write event once all of them exist.
    fn persist(&self) -> Result<(), Error> {
        let snapshot = {
            let state = self.state.read();
            if !state.initialized() {
                return Ok(());
            }
            let leaf = state.leaf.as_ref().expect("initialized");
            (
                state.root_pem.clone().expect("initialized"),
                leaf.pem_cert.clone(),
                leaf.pem_key.clone(),
            )
        };
        let directory = &self.config.directory;
        write_file_0600(&directory.join(ROOT_CA_FILE), snapshot.0.as_bytes())?;
        write_file_0600(&directory.join(CLIENT_CERT_FILE), snapshot.1.as_bytes())?;
        write_file_0600(&directory.join(CLIENT_KEY_FILE), snapshot.2.as_bytes())?;
        // Fires observers exactly once, on the first successful persist.
        self.first_write_tx.send_if_modified(|written| {
            if *written {
                false
            } else {
                *written = true;
                true
            }
        });
        Ok(())
    }

    /// Render the two on-disk SDS resource files and return the cluster
    /// snippet the proxy bootstrap embeds.
    pub fn render_sds_config(&self) -> Result<serde_json::Value, Error> {
        render::write_sds_resource_files(&self.config.directory)?;
        Ok(render::sds_cluster(
            &self.config.sds_address,
            self.config.sds_port,
            &self.config.directory,
        ))
    }
}

impl<C: Send + Sync> TlsMaterialSource for CertManager<C> {
    fn snapshot(&self) -> Option<CertSnapshot> {
        let state = self.state.read();
        let leaf = state.leaf.as_ref()?;
        let root_pem = state.root_pem.as_ref()?;
        let root_pool = state
            .roots
            .as_ref()
            .map(|roots| roots.roots.iter().map(|root| root.pem_cert.clone()).collect())
            .unwrap_or_default();
        Some(CertSnapshot {
            root_ca_pem: root_pem.clone(),
            cert_pem: leaf.pem_cert.clone(),
            key_pem: leaf.pem_key.clone(),
            root_pool,
            not_after: leaf.not_after,
        })
    }
}

/// Parse the certificate-key pair, rejecting anything x509-malformed.
fn validate_leaf(leaf: &LeafCert) -> Result<(), String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(leaf.pem_cert.as_bytes())
        .map_err(|err| format!("certificate PEM: {err}"))?;
    pem.parse_x509()
        .map_err(|err| format!("certificate body: {err}"))?;
    match rustls_pemfile::private_key(&mut leaf.pem_key.as_bytes()) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("private key PEM contained no key".to_owned()),
        Err(err) => Err(format!("private key PEM: {err}")),
    }
}

fn write_file_0600(path: &Path, contents: &[u8]) -> Result<(), Error> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| Error::Persist(format!("{}: {err}", path.display())))?;
    // An existing file keeps its old mode, so re-assert it.
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(0o600)
    };
    std::fs::set_permissions(path, permissions)
        .map_err(|err| Error::Persist(format!("{}: {err}", path.display())))?;
    file.write_all(contents)
        .map_err(|err| Error::Persist(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use consul::testutil::MemoryConsul;
    use consul::types::{CaRoot, CaRootSet, LeafCert};
    use consul::GatewayId;
    use grpc_util::retry::RetryConfig;
    use tokio_util::sync::CancellationToken;

    use super::{
        CertManager, CertManagerConfig, Error, TlsMaterialSource, CLIENT_CERT_FILE,
        CLIENT_KEY_FILE, ROOT_CA_FILE,
    };

    fn test_leaf(not_after: SystemTime) -> (LeafCert, String, String) {
        let certified = rcgen::generate_simple_self_signed(vec!["gateway".to_owned()]).unwrap();
        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();
        (
            LeafCert {
                pem_cert: cert_pem.clone(),
                pem_key: key_pem.clone(),
                not_before: SystemTime::now(),
                not_after,
                serial: "01".to_owned(),
            },
            cert_pem,
            key_pem,
        )
    }

    fn test_roots() -> (CaRootSet, String) {
        let certified = rcgen::generate_simple_self_signed(vec!["ca".to_owned()]).unwrap();
        let pem = certified.cert.pem();
        (
            CaRootSet {
                active_root_id: "root-1".to_owned(),
                roots: vec![CaRoot {
                    id: "root-1".to_owned(),
                    name: "root".to_owned(),
                    pem_cert: pem.clone(),
                    active: true,
                    trust_domain: "11111111-2222-3333-4444-555555555555.consul".to_owned(),
                }],
            },
            pem,
        )
    }

    fn manager(
        consul: &Arc<MemoryConsul>,
        dir: &tempfile::TempDir,
        retry: RetryConfig,
    ) -> CertManager<MemoryConsul> {
        let mut config = CertManagerConfig::new(dir.path(), "localhost", 9090);
        config.retry = retry;
        CertManager::new(
            consul.clone(),
            GatewayId::new("default", "gateway"),
            config,
        )
    }

    #[tokio::test]
    async fn first_write_fires_and_files_are_0600() {
        let consul = Arc::new(MemoryConsul::new());
        let (roots, root_pem) = test_roots();
        let (leaf, cert_pem, key_pem) = test_leaf(SystemTime::now() + Duration::from_secs(600));
        consul.set_roots(roots);
        consul.set_leaf(leaf);

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(
            &consul,
            &dir,
            RetryConfig::new(3, Duration::from_millis(1)),
        ));
        let cancel = CancellationToken::new();
        let manage = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.manage(cancel).await })
        };

        manager.wait_for_write(Duration::from_secs(5)).await.unwrap();

        for (file, expected) in [
            (ROOT_CA_FILE, &root_pem),
            (CLIENT_CERT_FILE, &cert_pem),
            (CLIENT_KEY_FILE, &key_pem),
        ] {
            let path = dir.path().join(file);
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(&contents, expected.as_str());
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let snapshot = manager.snapshot().unwrap();
        assert_eq!(snapshot.root_ca_pem, root_pem);
        assert_eq!(snapshot.cert_pem, cert_pem);
        assert_eq!(snapshot.key_pem, key_pem);

        cancel.cancel();
        manage.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn leaf_fetch_retries_through_transient_failures() {
        let consul = Arc::new(MemoryConsul::new());
        let (roots, _) = test_roots();
        let (leaf, _, _) = test_leaf(SystemTime::now() + Duration::from_secs(600));
        consul.set_roots(roots);
        consul.set_leaf(leaf);
        consul.fail_next_leaf(3);

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(
            &consul,
            &dir,
            RetryConfig::new(5, Duration::from_millis(1)),
        ));
        let cancel = CancellationToken::new();
        let manage = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.manage(cancel).await })
        };

        manager.wait_for_write(Duration::from_secs(5)).await.unwrap();
        assert!(consul.leaf_fetches() >= 4);

        cancel.cancel();
        manage.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn leaf_retry_exhaustion_is_terminal() {
        let consul = Arc::new(MemoryConsul::new());
        let (roots, _) = test_roots();
        let (leaf, _, _) = test_leaf(SystemTime::now() + Duration::from_secs(600));
        consul.set_roots(roots);
        consul.set_leaf(leaf);
        consul.fail_next_leaf(3);

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(
            &consul,
            &dir,
            RetryConfig::new(2, Duration::from_millis(1)),
        ));
        let cancel = CancellationToken::new();
        let err = manager.manage(cancel).await.unwrap_err();
        assert!(matches!(err, Error::LeafWatch(_)));
        assert!(manager.wait_for_write(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn malformed_leaf_is_discarded() {
        let consul = Arc::new(MemoryConsul::new());
        let (roots, _) = test_roots();
        consul.set_roots(roots);
        consul.set_leaf(LeafCert {
            pem_cert: "not a pem".to_owned(),
            pem_key: "not a key".to_owned(),
            not_before: SystemTime::now(),
            not_after: SystemTime::now() + Duration::from_secs(600),
            serial: "01".to_owned(),
        });

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(
            &consul,
            &dir,
            RetryConfig::new(2, Duration::from_millis(1)),
        ));
        let cancel = CancellationToken::new();
        let manage = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.manage(cancel).await })
        };

        assert!(manager.wait_for_write(Duration::from_millis(100)).await.is_err());
        assert!(manager.snapshot().is_none());

        // A good leaf afterwards recovers.
        let (leaf, _, _) = test_leaf(SystemTime::now() + Duration::from_secs(600));
        consul.set_leaf(leaf);
        manager.wait_for_write(Duration::from_secs(5)).await.unwrap();

        cancel.cancel();
        manage.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn snapshot_is_atomic_across_rotation() {
        let consul = Arc::new(MemoryConsul::new());
        let (roots, _) = test_roots();
        let (leaf, first_cert, first_key) =
            test_leaf(SystemTime::now() + Duration::from_secs(600));
        consul.set_roots(roots);
        consul.set_leaf(leaf);

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(
            &consul,
            &dir,
            RetryConfig::new(3, Duration::from_millis(1)),
        ));
        let cancel = CancellationToken::new();
        let manage = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.manage(cancel).await })
        };
        manager.wait_for_write(Duration::from_secs(5)).await.unwrap();

        let (second_leaf, second_cert, second_key) =
            test_leaf(SystemTime::now() + Duration::from_secs(1200));
        consul.set_leaf(second_leaf);

        // Every snapshot observed during rotation is one of the two
        // coherent pairs, never a mix.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = manager.snapshot().unwrap();
            let is_first = snapshot.cert_pem == first_cert && snapshot.key_pem == first_key;
            let is_second = snapshot.cert_pem == second_cert && snapshot.key_pem == second_key;
            assert!(is_first || is_second, "mixed certificate pair observed");
            if is_second {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "rotation never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        manage.await.unwrap().unwrap();
    }
}
