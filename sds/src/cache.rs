// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! In-process secret cache feeding the delta streams.
//!
//! The secret manager pushes material in via the `secrets::SecretCache`
//! trait; each open stream holds a subscription and receives updates for
//! exactly the names it subscribed, in the order the updates landed.

use std::collections::{HashMap, HashSet};

use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as tls_v3;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One batch of changes for a subscribed stream.
#[derive(Clone, Debug, Default)]
pub struct DeltaUpdate {
    pub updated: Vec<VersionedSecret>,
    pub removed: Vec<String>,
    /// Cache version after this change.
    pub system_version: u64,
}

#[derive(Clone, Debug)]
pub struct VersionedSecret {
    pub name: String,
    pub version: u64,
    pub secret: tls_v3::Secret,
}

struct CachedSecret {
    secret: tls_v3::Secret,
    version: u64,
}

struct StreamSubscription {
    tx: mpsc::UnboundedSender<DeltaUpdate>,
    names: HashSet<String>,
}

#[derive(Default)]
struct CacheState {
    version: u64,
    resources: HashMap<String, CachedSecret>,
    streams: HashMap<u64, StreamSubscription>,
}

/// Versioned resource cache with per-stream subscriptions.
#[derive(Default)]
pub struct DeltaCache {
    state: Mutex<CacheState>,
}

impl DeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stream; updates for subscribed names arrive on the
    /// returned channel.
    pub fn register_stream(&self, stream_id: u64) -> mpsc::UnboundedReceiver<DeltaUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.streams.insert(
            stream_id,
            StreamSubscription {
                tx,
                names: HashSet::new(),
            },
        );
        rx
    }

    pub fn drop_stream(&self, stream_id: u64) {
        self.state.lock().streams.remove(&stream_id);
    }

    /// Subscribe a stream to `names`. Material already cached is delivered
    /// immediately so late subscribers catch up.
    pub fn subscribe(&self, stream_id: u64, names: &[String]) {
        let mut state = self.state.lock();
        let version = state.version;
        let initial: Vec<VersionedSecret> = names
            .iter()
            .filter_map(|name| {
                state.resources.get(name).map(|cached| VersionedSecret {
                    name: name.clone(),
                    version: cached.version,
                    secret: cached.secret.clone(),
                })
            })
            .collect();
        if let Some(subscription) = state.streams.get_mut(&stream_id) {
            subscription.names.extend(names.iter().cloned());
            if !initial.is_empty() {
                let _ = subscription.tx.send(DeltaUpdate {
                    updated: initial,
                    removed: Vec::new(),
                    system_version: version,
                });
            }
        }
    }

    pub fn unsubscribe(&self, stream_id: u64, names: &[String]) {
        let mut state = self.state.lock();
        if let Some(subscription) = state.streams.get_mut(&stream_id) {
            for name in names {
                subscription.names.remove(name);
            }
        }
    }

    pub fn system_version(&self) -> u64 {
        self.state.lock().version
    }
}

impl secrets::SecretCache for DeltaCache {
    fn update_resource(&self, name: &str, secret: tls_v3::Secret) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        state.resources.insert(
            name.to_owned(),
            CachedSecret {
                secret: secret.clone(),
                version,
            },
        );
        for subscription in state.streams.values() {
            if subscription.names.contains(name) {
                let _ = subscription.tx.send(DeltaUpdate {
                    updated: vec![VersionedSecret {
                        name: name.to_owned(),
                        version,
                        secret: secret.clone(),
                    }],
                    removed: Vec::new(),
                    system_version: version,
                });
            }
        }
    }

    fn delete_resource(&self, name: &str) {
        let mut state = self.state.lock();
        if state.resources.remove(name).is_none() {
            return;
        }
        state.version += 1;
        let version = state.version;
        for subscription in state.streams.values() {
            if subscription.names.contains(name) {
                let _ = subscription.tx.send(DeltaUpdate {
                    updated: Vec::new(),
                    removed: vec![name.to_owned()],
                    system_version: version,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use secrets::{tls_certificate_secret, SecretCache};

    use super::DeltaCache;

    #[test]
    fn updates_reach_only_subscribed_streams_in_order() {
        let cache = DeltaCache::new();
        let mut rx_a = cache.register_stream(1);
        let mut rx_b = cache.register_stream(2);

        cache.subscribe(1, &["a".to_owned()]);
        cache.subscribe(2, &["b".to_owned()]);

        cache.update_resource("a", tls_certificate_secret("a", b"c1", b"k1"));
        cache.update_resource("b", tls_certificate_secret("b", b"c2", b"k2"));
        cache.update_resource("a", tls_certificate_secret("a", b"c3", b"k3"));

        let first = rx_a.try_recv().unwrap();
        let second = rx_a.try_recv().unwrap();
        assert!(first.updated[0].version < second.updated[0].version);
        assert!(rx_a.try_recv().is_err());

        let only = rx_b.try_recv().unwrap();
        assert_eq!(only.updated[0].name, "b");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn late_subscribers_get_current_material() {
        let cache = DeltaCache::new();
        cache.update_resource("a", tls_certificate_secret("a", b"cert", b"key"));

        let mut rx = cache.register_stream(1);
        cache.subscribe(1, &["a".to_owned(), "missing".to_owned()]);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.updated.len(), 1);
        assert_eq!(update.updated[0].name, "a");
    }

    #[test]
    fn deletes_notify_and_second_delete_is_silent() {
        let cache = DeltaCache::new();
        cache.update_resource("a", tls_certificate_secret("a", b"cert", b"key"));
        let mut rx = cache.register_stream(1);
        cache.subscribe(1, &["a".to_owned()]);
        let _ = rx.try_recv().unwrap();

        cache.delete_resource("a");
        let update = rx.try_recv().unwrap();
        assert_eq!(update.removed, vec!["a".to_owned()]);

        cache.delete_resource("a");
        assert!(rx.try_recv().is_err());

        cache.unsubscribe(1, &["a".to_owned()]);
        cache.update_resource("a", tls_certificate_secret("a", b"cert", b"key"));
        assert!(rx.try_recv().is_err());

        cache.drop_stream(1);
    }
}
