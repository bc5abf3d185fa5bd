// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use consul::types::QueryOptions;
use consul::{DiscoveryChainClient, ServiceName};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::index::ServiceNameIndex;

/// Pause after a failed read so a broken control plane cannot hot-loop us.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Target-set diff observed for one upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryChainResult {
    /// The upstream whose chain produced the diff.
    pub requester: ServiceName,
    pub added: Vec<ServiceName>,
    pub removed: Vec<ServiceName>,
}

impl DiscoveryChainResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Long-polls the compiled discovery chain for one upstream and emits
/// target diffs into the reconciler's shared mailbox.
pub struct DiscoveryChainWatcher<C> {
    client: Arc<C>,
    upstream: ServiceName,
    results: mpsc::Sender<DiscoveryChainResult>,
}

impl<C> DiscoveryChainWatcher<C>
where
    C: DiscoveryChainClient + Send + Sync,
{
    pub fn new(
        client: Arc<C>,
        upstream: ServiceName,
        results: mpsc::Sender<DiscoveryChainResult>,
    ) -> Self {
        DiscoveryChainWatcher {
            client,
            upstream,
            results,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut index = 0u64;
        let mut observed = ServiceNameIndex::new();
        loop {
            let options = QueryOptions::blocking(index);
            let result = tokio::select! {
                result = self.client.discovery_chain(&self.upstream, &options) => result,
                _ = cancel.cancelled() => break,
            };
            let (chain, meta) = match result {
                Ok(ok) => ok,
                Err(err) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    log::error!(
                        "failed to read discovery chain for upstream {}: {err}",
                        self.upstream
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };
            if meta.index < index {
                // The control plane may have been restored from a snapshot.
                index = 0;
                continue;
            }
            if meta.index == index {
                // Spurious wake.
                continue;
            }
            index = meta.index;

            let (added, removed) = observed.replace(&chain.targets);
            let result = DiscoveryChainResult {
                requester: self.upstream.clone(),
                added,
                removed,
            };
            if result.is_empty() {
                continue;
            }
            if self.results.send(result).await.is_err() {
                // Mailbox consumer went away; nothing left to report to.
                return;
            }
        }

        // Cancelled: release every target this upstream was holding so the
        // reconciler can retire intentions that no other upstream needs.
        let removed = observed.all();
        if !removed.is_empty() {
            let _ = self
                .results
                .send(DiscoveryChainResult {
                    requester: self.upstream.clone(),
                    added: Vec::new(),
                    removed,
                })
                .await;
        }
    }
}
