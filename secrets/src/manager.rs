// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{Error, FetchedSecret, SecretCache, SecretClient};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_EXPIRATION_DELTA: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug)]
pub struct SecretManagerConfig {
    /// Cadence of the background refresh loop.
    pub refresh_interval: Duration,
    /// Refetch a secret this long before its recorded expiry.
    pub expiration_delta: Duration,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        SecretManagerConfig {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            expiration_delta: DEFAULT_EXPIRATION_DELTA,
        }
    }
}

struct RegistryEntry {
    secret: FetchedSecret,
    refs: HashSet<String>,
}

#[derive(Default)]
struct State {
    /// node id -> names that node watches.
    watchers: HashMap<String, HashSet<String>>,
    /// secret name -> fetched material plus the nodes referencing it.
    registry: HashMap<String, RegistryEntry>,
}

/// Reference-counted cache of TLS secrets.
///
/// Invariant, checked by the tests on every mutation: a name is in
/// `registry` iff some node watches it, and every registry mutation is
/// paired with the matching downstream-cache mutation inside the same
/// critical section.
pub struct SecretManager {
    client: Arc<dyn SecretClient>,
    cache: Arc<dyn SecretCache>,
    state: RwLock<State>,
    config: SecretManagerConfig,
}

impl SecretManager {
    pub fn new(
        client: Arc<dyn SecretClient>,
        cache: Arc<dyn SecretCache>,
        config: SecretManagerConfig,
    ) -> Self {
        SecretManager {
            client,
            cache,
            state: RwLock::new(State::default()),
            config,
        }
    }

    /// Subscribe `node` to every name. New names are fetched while the lock
    /// is held so the registry and downstream cache stay in step. A fetch
    /// error aborts the batch: earlier names stay watched and the caller
    /// must fail its stream.
    pub async fn watch(&self, names: &[String], node: &str) -> Result<(), Error> {
        let mut state = self.state.write().await;
        self.watch_locked(&mut state, names, node).await
    }

    async fn watch_locked(
        &self,
        state: &mut State,
        names: &[String],
        node: &str,
    ) -> Result<(), Error> {
        for name in names {
            state
                .watchers
                .entry(node.to_owned())
                .or_default()
                .insert(name.clone());
            if let Some(entry) = state.registry.get_mut(name) {
                entry.refs.insert(node.to_owned());
                continue;
            }
            let secret = match self.client.fetch_secret(name).await {
                Ok(secret) => secret,
                Err(err) => {
                    // Keep earlier names in the batch watched, but do not
                    // leave an unregistered name in the watch set.
                    if let Some(watched) = state.watchers.get_mut(node) {
                        watched.remove(name);
                        if watched.is_empty() {
                            state.watchers.remove(node);
                        }
                    }
                    return Err(err);
                }
            };
            self.cache.update_resource(name, secret.secret.clone());
            state.registry.insert(
                name.clone(),
                RegistryEntry {
                    secret,
                    refs: HashSet::from([node.to_owned()]),
                },
            );
            log::debug!("now watching secret {name} for node {node}");
        }
        Ok(())
    }

    /// Drop `node`'s subscription to every name, evicting entries whose
    /// last reference went away.
    pub async fn unwatch(&self, names: &[String], node: &str) {
        let mut state = self.state.write().await;
        self.unwatch_locked(&mut state, names, node);
    }

    fn unwatch_locked(&self, state: &mut State, names: &[String], node: &str) {
        for name in names {
            if let Some(watched) = state.watchers.get_mut(node) {
                watched.remove(name);
                if watched.is_empty() {
                    state.watchers.remove(node);
                }
            }
            let remove = match state.registry.get_mut(name) {
                Some(entry) => {
                    entry.refs.remove(node);
                    entry.refs.is_empty()
                }
                None => false,
            };
            if remove {
                state.registry.remove(name);
                self.cache.delete_resource(name);
                log::debug!("evicted secret {name} after last watcher left");
            }
        }
    }

    /// Drop everything `node` watches, then the node entry itself. Called
    /// when a stream closes.
    pub async fn unwatch_all(&self, node: &str) {
        let mut state = self.state.write().await;
        let names: Vec<String> = state
            .watchers
            .get(node)
            .map(|watched| watched.iter().cloned().collect())
            .unwrap_or_default();
        self.unwatch_locked(&mut state, &names, node);
        state.watchers.remove(node);
    }

    /// Reconcile `node`'s watch set to exactly `names`.
    pub async fn set_resources_for_node(&self, names: &[String], node: &str) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let current: HashSet<String> = state.watchers.get(node).cloned().unwrap_or_default();
        let wanted: HashSet<String> = names.iter().cloned().collect();
        let added: Vec<String> = wanted.difference(&current).cloned().collect();
        let removed: Vec<String> = current.difference(&wanted).cloned().collect();
        self.watch_locked(&mut state, &added, node).await?;
        self.unwatch_locked(&mut state, &removed, node);
        Ok(())
    }

    /// Node ids with at least one active watch.
    pub async fn nodes(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.watchers.keys().cloned().collect()
    }

    /// Names currently held in the registry.
    pub async fn resources(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.registry.keys().cloned().collect()
    }

    /// Refresh loop: refetch any entry inside its expiration window,
    /// preserving its reference set. Fetch errors are logged and retried on
    /// the next tick.
    pub async fn manage(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            self.refresh_expiring().await;
        }
    }

    async fn refresh_expiring(&self) {
        let now = SystemTime::now();
        let mut state = self.state.write().await;
        let expiring: Vec<String> = state
            .registry
            .iter()
            .filter(|(_, entry)| {
                entry
                    .secret
                    .expires_at
                    .checked_sub(self.config.expiration_delta)
                    .map(|deadline| deadline <= now)
                    .unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in expiring {
            match self.client.fetch_secret(&name).await {
                Ok(secret) => {
                    self.cache.update_resource(&name, secret.secret.clone());
                    if let Some(entry) = state.registry.get_mut(&name) {
                        entry.secret = secret;
                    }
                    log::debug!("refreshed secret {name}");
                }
                Err(err) => {
                    log::error!("failed to refresh secret {name}: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::{tls_certificate_secret, Error, FetchedSecret, SecretCache, SecretClient};

    use super::{SecretManager, SecretManagerConfig};

    #[derive(Default)]
    struct RecordingCache {
        entries: Mutex<HashMap<String, tls_v3::Secret>>,
        deletes: Mutex<Vec<String>>,
    }

    impl SecretCache for RecordingCache {
        fn update_resource(&self, name: &str, secret: tls_v3::Secret) {
            self.entries.lock().insert(name.to_owned(), secret);
        }

        fn delete_resource(&self, name: &str) {
            self.entries.lock().remove(name);
            self.deletes.lock().push(name.to_owned());
        }
    }

    struct FakeClient {
        expires_at: Mutex<SystemTime>,
        fail: Mutex<HashSet<String>>,
        fetches: Mutex<Vec<String>>,
    }

    impl Default for FakeClient {
        fn default() -> Self {
            FakeClient {
                expires_at: Mutex::new(SystemTime::now() + Duration::from_secs(3600)),
                fail: Mutex::default(),
                fetches: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl SecretClient for FakeClient {
        async fn fetch_secret(&self, name: &str) -> Result<FetchedSecret, Error> {
            self.fetches.lock().push(name.to_owned());
            if self.fail.lock().contains(name) {
                return Err(Error::Fetch {
                    name: name.to_owned(),
                    message: "injected failure".to_owned(),
                });
            }
            Ok(FetchedSecret {
                secret: tls_certificate_secret(name, b"cert", b"key"),
                expires_at: *self.expires_at.lock(),
            })
        }
    }

    fn setup() -> (Arc<FakeClient>, Arc<RecordingCache>, SecretManager) {
        let client = Arc::new(FakeClient::default());
        let cache = Arc::new(RecordingCache::default());
        let manager = SecretManager::new(
            client.clone(),
            cache.clone(),
            SecretManagerConfig {
                refresh_interval: Duration::from_millis(10),
                expiration_delta: Duration::from_secs(600),
            },
        );
        (client, cache, manager)
    }

    /// The §4.6 invariant: a name is cached iff some node watches it.
    async fn assert_invariant(manager: &SecretManager, cache: &RecordingCache) {
        let state = manager.state.read().await;
        let mut watched: HashSet<&String> = HashSet::new();
        for names in state.watchers.values() {
            watched.extend(names.iter());
        }
        let registered: HashSet<&String> = state.registry.keys().collect();
        assert_eq!(watched, registered, "registry diverged from watchers");
        let cached: HashSet<String> = cache.entries.lock().keys().cloned().collect();
        let registered: HashSet<String> = state.registry.keys().cloned().collect();
        assert_eq!(cached, registered, "downstream cache diverged from registry");
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[tokio::test]
    async fn refcount_gc_across_two_nodes() {
        let (_, cache, manager) = setup();
        manager.watch(&names(&["a", "b"]), "node-a").await.unwrap();
        manager.watch(&names(&["b", "c"]), "node-b").await.unwrap();
        assert_invariant(&manager, &cache).await;

        manager.unwatch_all("node-a").await;
        assert_invariant(&manager, &cache).await;
        let remaining: HashSet<String> = cache.entries.lock().keys().cloned().collect();
        assert_eq!(remaining, HashSet::from(["b".to_owned(), "c".to_owned()]));
        assert_eq!(cache.deletes.lock().clone(), vec!["a".to_owned()]);

        manager.unwatch_all("node-b").await;
        assert_invariant(&manager, &cache).await;
        assert!(cache.entries.lock().is_empty());
        let mut deletes = cache.deletes.lock().clone();
        deletes.sort();
        assert_eq!(deletes, names(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn shared_secret_fetched_once() {
        let (client, _, manager) = setup();
        manager.watch(&names(&["a"]), "node-a").await.unwrap();
        manager.watch(&names(&["a"]), "node-b").await.unwrap();
        assert_eq!(client.fetches.lock().len(), 1);

        manager.unwatch(&names(&["a"]), "node-a").await;
        assert_eq!(manager.resources().await, vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn fetch_error_aborts_batch_but_keeps_earlier_names() {
        let (client, cache, manager) = setup();
        client.fail.lock().insert("bad".to_owned());

        let err = manager
            .watch(&names(&["good", "bad"]), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));

        // `good` was admitted before the failure and is retained.
        assert_eq!(manager.resources().await, vec!["good".to_owned()]);
        assert!(cache.entries.lock().contains_key("good"));
    }

    #[tokio::test]
    async fn set_resources_diffs_watch_set() {
        let (_, cache, manager) = setup();
        manager
            .set_resources_for_node(&names(&["a", "b"]), "node-a")
            .await
            .unwrap();
        manager
            .set_resources_for_node(&names(&["b", "c"]), "node-a")
            .await
            .unwrap();
        assert_invariant(&manager, &cache).await;

        let mut resources = manager.resources().await;
        resources.sort();
        assert_eq!(resources, names(&["b", "c"]));
    }

    #[tokio::test]
    async fn invariant_holds_across_random_sequences() {
        let (_, cache, manager) = setup();
        let nodes = ["n1", "n2", "n3"];
        let all_names = ["a", "b", "c", "d"];
        // Deterministic pseudo-random walk over the mutation surface.
        let mut seed = 0x2545_f491u64;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let node = nodes[(seed >> 8) as usize % nodes.len()];
            let name = all_names[(seed >> 16) as usize % all_names.len()];
            match (seed >> 24) % 4 {
                0 => manager.watch(&names(&[name]), node).await.unwrap(),
                1 => manager.unwatch(&names(&[name]), node).await,
                2 => manager.unwatch_all(node).await,
                _ => manager
                    .set_resources_for_node(&names(&[name]), node)
                    .await
                    .unwrap(),
            }
            assert_invariant(&manager, &cache).await;
        }
    }

    #[tokio::test]
    async fn manage_refreshes_expiring_secrets() {
        let (client, cache, manager) = setup();
        *client.expires_at.lock() = SystemTime::now() + Duration::from_secs(30);
        manager.watch(&names(&["a"]), "node-a").await.unwrap();
        assert_eq!(client.fetches.lock().len(), 1);

        // Push expiry far out so the refresh settles after one refetch.
        *client.expires_at.lock() = SystemTime::now() + Duration::from_secs(3600);

        let manager = Arc::new(manager);
        let cancel = CancellationToken::new();
        let run = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.manage(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        run.await.unwrap();

        assert!(client.fetches.lock().len() >= 2);
        assert_invariant(&manager, &cache).await;
    }

    #[tokio::test]
    async fn refresh_errors_keep_entry_and_refs() {
        let (client, cache, manager) = setup();
        *client.expires_at.lock() = UNIX_EPOCH;
        manager.watch(&names(&["a"]), "node-a").await.unwrap();
        client.fail.lock().insert("a".to_owned());

        manager.refresh_expiring().await;
        assert_eq!(manager.resources().await, vec!["a".to_owned()]);
        assert_invariant(&manager, &cache).await;
    }
}
