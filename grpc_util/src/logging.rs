// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure logging for a binary.
///
/// `level` is a `Targets`-style directive (usually just `info`); `json`
/// switches the fmt layer to one-JSON-object-per-line output. `log` macro
/// callers are bridged into the same subscriber.
pub fn setup_logging(level: &str, json: bool) -> Result<(), String> {
    // Note: This cannot use `EnvFilter` because EnvFilter filters globally
    // even if it is only used in a tracing stack!
    let filter_layer = level
        .parse::<Targets>()
        .map_err(|err| format!("Failed to parse log level {level:?}: {err}"))?;

    tracing_log::LogTracer::init()
        .map_err(|err| format!("Failed to install log bridge: {err}"))?;

    let registry = tracing_subscriber::registry();
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter_layer))
            .try_init()
            .map_err(|err| format!("Failed to install subscriber: {err}"))
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_filter(filter_layer))
            .try_init()
            .map_err(|err| format!("Failed to install subscriber: {err}"))
    }
}
