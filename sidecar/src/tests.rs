// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use certs::{CertManager, CertManagerConfig};
use consul::testutil::MemoryConsul;
use consul::types::{CaRoot, CaRootSet, LeafCert};
use consul::{GatewayId, ServiceName};
use grpc_util::retry::RetryConfig;
use intentions::{IntentionsReconciler, ReconcilerConfig};
use proxy::{ProxyManager, ProxyManagerConfig};
use registry::{Authenticator, AuthenticatorConfig, ServiceRegistry, ServiceRegistryConfig};
use sds::{DeltaCache, MemoryGatewayRegistry, SdsServer, SdsServerConfig};
use secrets::{MultiSecretClient, SecretManager, SecretManagerConfig};
use tokio_util::sync::CancellationToken;

use super::{Supervisor, SupervisorConfig};

struct Fixture {
    consul: Arc<MemoryConsul>,
    dir: tempfile::TempDir,
    _token_file: tempfile::NamedTempFile,
    supervisor: Supervisor<MemoryConsul>,
}

fn retry() -> RetryConfig {
    RetryConfig::new(3, Duration::from_millis(1))
}

fn fixture(upstreams: Vec<ServiceName>) -> Fixture {
    let consul = Arc::new(MemoryConsul::new());
    let dir = tempfile::tempdir().unwrap();
    let gateway = GatewayId::new("", "gateway");

    let mut token_file = tempfile::NamedTempFile::new().unwrap();
    token_file.write_all(b"bearer").unwrap();

    let mut auth_config = AuthenticatorConfig::new("gateway-auth", token_file.path());
    auth_config.retry = retry();
    let authenticator = Authenticator::new(consul.clone(), auth_config);

    let mut registry_config = ServiceRegistryConfig::new("gateway", "127.0.0.1", 19000);
    registry_config.retry = retry();
    let registry = Arc::new(ServiceRegistry::new(consul.clone(), registry_config));

    let mut cert_config = CertManagerConfig::new(dir.path(), "localhost", 0);
    cert_config.retry = retry();
    let cert_manager = Arc::new(CertManager::new(consul.clone(), gateway.clone(), cert_config));

    let reconciler = Arc::new(IntentionsReconciler::new(
        consul.clone(),
        gateway.clone(),
        ReconcilerConfig {
            sync_interval: Duration::from_millis(50),
            target_retry: retry(),
        },
    ));

    let cache = Arc::new(DeltaCache::new());
    let secret_manager = Arc::new(SecretManager::new(
        Arc::new(MultiSecretClient::new()),
        cache.clone(),
        SecretManagerConfig::default(),
    ));
    let store = Arc::new(MemoryGatewayRegistry::new());
    store.add_gateway(gateway.clone());
    let sds_server = SdsServer::new(
        SdsServerConfig {
            address: "127.0.0.1".to_owned(),
            port: 0,
        },
        cert_manager.clone(),
        store,
        secret_manager.clone(),
        cache,
    );

    let script = dir.path().join("fake-proxy");
    std::fs::write(&script, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let proxy_manager = ProxyManager::new(ProxyManagerConfig {
        binary_path: script,
        bootstrap_path: dir.path().join("bootstrap.json"),
        log_level: "info".to_owned(),
        log_format: "text".to_owned(),
    });

    let supervisor = Supervisor::new(
        consul.clone(),
        SupervisorConfig {
            gateway,
            xds_address: "127.0.0.1".to_owned(),
            xds_port: 8502,
            admin_address: "127.0.0.1".to_owned(),
            admin_port: 19000,
            ready_port: 19001,
            upstreams,
            first_write_timeout: Duration::from_secs(5),
        },
        authenticator,
        registry,
        cert_manager,
        reconciler,
        secret_manager,
        sds_server,
        proxy_manager,
    );

    Fixture {
        consul,
        dir,
        _token_file: token_file,
        supervisor,
    }
}

fn seed_certificates(consul: &MemoryConsul) {
    let ca = rcgen::generate_simple_self_signed(vec!["ca".to_owned()]).unwrap();
    consul.set_roots(CaRootSet {
        active_root_id: "root-1".to_owned(),
        roots: vec![CaRoot {
            id: "root-1".to_owned(),
            name: "root".to_owned(),
            pem_cert: ca.cert.pem(),
            active: true,
            trust_domain: "testing.consul".to_owned(),
        }],
    });
    let leaf = rcgen::generate_simple_self_signed(vec!["gateway".to_owned()]).unwrap();
    consul.set_leaf(LeafCert {
        pem_cert: leaf.cert.pem(),
        pem_key: leaf.key_pair.serialize_pem(),
        not_before: SystemTime::now(),
        not_after: SystemTime::now() + Duration::from_secs(3600),
        serial: "01".to_owned(),
    });
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn full_start_and_ordered_shutdown() {
    let fixture = fixture(vec![ServiceName::new("", "upstream")]);
    let consul = fixture.consul.clone();
    seed_certificates(&consul);
    consul.set_chain(
        ServiceName::new("", "upstream"),
        consul::types::DiscoveryChain {
            service_name: "upstream".to_owned(),
            namespace: String::new(),
            targets: vec![ServiceName::new("", "t1")],
        },
    );

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(fixture.supervisor.run(cancel))
    };

    let bootstrap_path = fixture.dir.path().join("bootstrap.json");
    wait_for("bootstrap render", || bootstrap_path.is_file()).await;

    // Session token installed on the client after login.
    assert_eq!(consul.token(), "test-secret");
    assert_eq!(consul.registered_services().len(), 1);

    // Identity files persisted before the proxy started.
    for file in ["root-ca.pem", "client.crt", "client.pem"] {
        assert!(fixture.dir.path().join(file).is_file(), "{file} missing");
    }

    let mode = std::fs::metadata(&bootstrap_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let bootstrap: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&bootstrap_path).unwrap()).unwrap();
    let clusters = bootstrap["static_resources"]["clusters"].as_array().unwrap();
    assert!(clusters.iter().any(|cluster| cluster["name"] == "sds-cluster"));
    assert_eq!(
        bootstrap["dynamic_resources"]["ads_config"]["grpc_services"][0]["initial_metadata"][0]
            ["value"],
        "test-secret"
    );

    // The reconciler converges on the upstream's chain target.
    wait_for("intention write", || {
        consul.intention(&ServiceName::new("", "t1")).is_some()
    })
    .await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    result.unwrap();

    // Deregistered on the fresh shutdown token.
    assert!(consul.registered_services().is_empty());
}

#[tokio::test]
async fn certificate_failure_is_fatal_and_still_deregisters() {
    let fixture = fixture(Vec::new());
    let consul = fixture.consul.clone();
    // Roots arrive but the leaf never does; the watch exhausts its retries.
    let ca = rcgen::generate_simple_self_signed(vec!["ca".to_owned()]).unwrap();
    consul.set_roots(CaRootSet {
        active_root_id: "root-1".to_owned(),
        roots: vec![CaRoot {
            id: "root-1".to_owned(),
            name: "root".to_owned(),
            pem_cert: ca.cert.pem(),
            active: true,
            trust_domain: "testing.consul".to_owned(),
        }],
    });

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        fixture.supervisor.run(cancel),
    )
    .await
    .unwrap();
    assert!(result.is_err());
    assert!(consul.registered_services().is_empty());
}
