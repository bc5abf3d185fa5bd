// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Intention-graph reconciliation for the gateway.
//!
//! One `DiscoveryChainWatcher` per upstream long-polls the compiled
//! discovery chain and reports target-set diffs into a shared mailbox. The
//! `IntentionsReconciler` consumes that mailbox and keeps one
//! `service-intentions` source per reachable target allowing traffic from
//! this gateway, removing the source again once no upstream reaches the
//! target.

pub mod index;
pub mod reconciler;
pub mod watcher;

use consul::ServiceName;

pub use index::{RefCountedTargetIndex, ServiceNameIndex};
pub use reconciler::{IntentionsReconciler, ReconcilerConfig};
pub use watcher::DiscoveryChainResult;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control plane: {0}")]
    Consul(#[from] consul::Error),

    /// Per-target failures from one sync pass, aggregated.
    #[error("reconciliation failed for {} target(s): {}", .0.len(), format_failures(.0))]
    Sync(Vec<(ServiceName, String)>),

    /// `reconcile()` was called but the run loop has exited.
    #[error("reconciler is not running")]
    NotRunning,

    #[error("cancelled")]
    Cancelled,
}

fn format_failures(failures: &[(ServiceName, String)]) -> String {
    failures
        .iter()
        .map(|(target, message)| format!("{target}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}
