// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use consul::types::{IntentionAction, IntentionSource, ServiceIntentionsEntry};
use consul::{ConfigEntryClient, DiscoveryChainClient, GatewayId, ServiceName};
use grpc_util::retry::{retry_constant, RetryConfig, RetryError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::index::RefCountedTargetIndex;
use crate::watcher::{DiscoveryChainResult, DiscoveryChainWatcher};
use crate::Error;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TARGET_RETRIES: u32 = 3;

const SOURCE_DESCRIPTION_PREFIX: &str = "Allow traffic from Consul API Gateway";

#[derive(Clone, Copy, Debug)]
pub struct ReconcilerConfig {
    /// Cadence of the periodic sync pass.
    pub sync_interval: Duration,
    /// Bounded retry applied to each per-target operation.
    pub target_retry: RetryConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            target_retry: RetryConfig::new(DEFAULT_TARGET_RETRIES, Duration::from_secs(1)),
        }
    }
}

/// Keeps one intention source per reachable target allowing this gateway.
///
/// Chain watchers feed target diffs into the mailbox; a ticker and explicit
/// `reconcile()` calls both force a sync pass. Reconciliation of a single
/// target is serialized by the run loop; partial failures leave tombstones
/// in place so the next pass retries them.
pub struct IntentionsReconciler<C> {
    client: Arc<C>,
    gateway: GatewayId,
    index: RefCountedTargetIndex,
    tombstones: Mutex<HashSet<ServiceName>>,
    watchers: Mutex<HashMap<ServiceName, CancellationToken>>,
    chain_tx: mpsc::Sender<DiscoveryChainResult>,
    chain_rx: Mutex<Option<mpsc::Receiver<DiscoveryChainResult>>>,
    sync_tx: mpsc::Sender<oneshot::Sender<Result<(), Error>>>,
    sync_rx: Mutex<Option<mpsc::Receiver<oneshot::Sender<Result<(), Error>>>>>,
    config: ReconcilerConfig,
}

impl<C> IntentionsReconciler<C>
where
    C: ConfigEntryClient + DiscoveryChainClient + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, gateway: GatewayId, config: ReconcilerConfig) -> Self {
        let (chain_tx, chain_rx) = mpsc::channel(64);
        let (sync_tx, sync_rx) = mpsc::channel(16);
        IntentionsReconciler {
            client,
            gateway,
            index: RefCountedTargetIndex::new(),
            tombstones: Mutex::default(),
            watchers: Mutex::default(),
            chain_tx,
            chain_rx: Mutex::new(Some(chain_rx)),
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
            config,
        }
    }

    /// Start watching the discovery chain of a newly configured upstream.
    pub fn watch_upstream(&self, cancel: &CancellationToken, upstream: ServiceName) {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&upstream) {
            return;
        }
        let child = cancel.child_token();
        let watcher =
            DiscoveryChainWatcher::new(self.client.clone(), upstream.clone(), self.chain_tx.clone());
        let task_cancel = child.clone();
        tokio::spawn(watcher.run(task_cancel));
        watchers.insert(upstream, child);
    }

    /// Stop watching an upstream that left the gateway config. The watcher
    /// emits a final release for its targets on the way out.
    pub fn unwatch_upstream(&self, upstream: &ServiceName) {
        if let Some(token) = self.watchers.lock().remove(upstream) {
            token.cancel();
        }
    }

    /// Force a sync pass and wait for its outcome.
    pub async fn reconcile(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.sync_tx.send(tx).await.map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)?
    }

    /// Consume chain results, the sync ticker, and explicit sync requests
    /// until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut chain_rx = self
            .chain_rx
            .lock()
            .take()
            .expect("run() may only be called once");
        let mut sync_rx = self
            .sync_rx
            .lock()
            .take()
            .expect("run() may only be called once");
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not
        // race the first chain results.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = chain_rx.recv() => {
                    match result {
                        Some(result) => self.handle_chain_result(result),
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sync(&cancel).await {
                        log::error!("periodic intention sync failed: {err}");
                    }
                }
                request = sync_rx.recv() => {
                    if let Some(reply) = request {
                        let outcome = self.sync(&cancel).await;
                        let _ = reply.send(outcome);
                    }
                }
            }
        }
    }

    fn handle_chain_result(&self, result: DiscoveryChainResult) {
        for target in result.added {
            self.tombstones.lock().remove(&target);
            self.index.add_ref(target, result.requester.clone());
        }
        for target in result.removed {
            if self.index.del_ref(&target, &result.requester) {
                self.tombstones.lock().insert(target);
            }
        }
    }

    /// One sync pass: ensure a source on every referenced target, then
    /// remove the source from tombstoned targets. Per-target errors are
    /// aggregated; failed tombstones stay queued for the next pass.
    async fn sync(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut failures: Vec<(ServiceName, String)> = Vec::new();

        for target in self.index.all() {
            if let Err(err) = self.sync_target(cancel, &target, true).await {
                failures.push((target, err.to_string()));
            }
        }

        let tombstones: Vec<ServiceName> = {
            let mut tombstones: Vec<ServiceName> =
                self.tombstones.lock().iter().cloned().collect();
            tombstones.sort();
            tombstones
        };
        for target in tombstones {
            match self.sync_target(cancel, &target, false).await {
                Ok(()) => {
                    self.tombstones.lock().remove(&target);
                }
                Err(err) => {
                    failures.push((target, err.to_string()));
                }
            }
        }

        metrics::increment_counter!(
            "sidecar_intention_syncs_total",
            "result" => if failures.is_empty() { "success" } else { "error" },
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Sync(failures))
        }
    }

    /// Converge one target: read the entry (404 initializes an empty one),
    /// apply the pure source update, then CAS-write or delete. A CAS
    /// conflict fails the attempt and the bounded retry re-reads.
    async fn sync_target(
        &self,
        cancel: &CancellationToken,
        target: &ServiceName,
        present: bool,
    ) -> Result<(), Error> {
        let result = retry_constant(
            cancel,
            self.config.target_retry,
            "sync intention",
            || async move {
                let (mut entry, meta) = match self.client.get_service_intentions(target).await {
                    Ok(found) => found,
                    Err(err) if err.is_not_found() => {
                        (ServiceIntentionsEntry::empty(target), Default::default())
                    }
                    Err(err) => return Err(Error::Consul(err)),
                };

                if !update_gateway_source(&mut entry, &self.gateway, present) {
                    return Ok(());
                }

                if entry.sources.is_empty() {
                    // Deletes are not CAS-guarded: a source added between
                    // our read and this delete can be lost. The next sync
                    // pass restores it.
                    return match self.client.delete_service_intentions(target).await {
                        Ok(()) => Ok(()),
                        Err(err) if err.is_not_found() => Ok(()),
                        Err(err) => Err(Error::Consul(err)),
                    };
                }

                match self
                    .client
                    .put_service_intentions_cas(&entry, meta.index)
                    .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Error::Consul(consul::Error::CasFailed(target.to_string()))),
                    Err(err) => Err(Error::Consul(err)),
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { source, .. }) => Err(source),
        }
    }
}

/// Insert or remove this gateway's allow-source. Returns whether the entry
/// changed.
fn update_gateway_source(
    entry: &mut ServiceIntentionsEntry,
    gateway: &GatewayId,
    present: bool,
) -> bool {
    let existing = entry
        .sources
        .iter()
        .position(|source| source.matches(&gateway.service, &gateway.namespace));
    match (present, existing) {
        (true, Some(_)) | (false, None) => false,
        (true, None) => {
            entry.sources.push(IntentionSource {
                name: gateway.service.clone(),
                namespace: gateway.canonical_namespace().to_owned(),
                action: IntentionAction::Allow,
                description: format!("{SOURCE_DESCRIPTION_PREFIX} {gateway}"),
            });
            true
        }
        (false, Some(position)) => {
            entry.sources.remove(position);
            true
        }
    }
}
