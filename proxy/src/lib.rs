// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The embedded proxy process: bootstrap rendering and supervision.

pub mod bootstrap;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub use bootstrap::{render, BootstrapConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to write bootstrap file {path}: {message}")]
    WriteBootstrap { path: PathBuf, message: String },

    #[error("unable to spawn proxy {binary}: {message}")]
    Spawn { binary: PathBuf, message: String },

    #[error("proxy exited unexpectedly with {status}")]
    Exited { status: ExitStatus },

    #[error("failed waiting on proxy: {0}")]
    Wait(String),
}

#[derive(Clone, Debug)]
pub struct ProxyManagerConfig {
    pub binary_path: PathBuf,
    pub bootstrap_path: PathBuf,
    pub log_level: String,
    /// `text` or `json`, handed to the proxy unchanged.
    pub log_format: String,
}

/// Writes the bootstrap file and parents the proxy process.
pub struct ProxyManager {
    config: ProxyManagerConfig,
}

impl ProxyManager {
    pub fn new(config: ProxyManagerConfig) -> Self {
        ProxyManager { config }
    }

    /// Persist the rendered bootstrap with mode 0600.
    pub fn write_bootstrap(&self, bootstrap: &Value) -> Result<(), Error> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::fs::PermissionsExt;

        let path = &self.config.bootstrap_path;
        let err = |message: String| Error::WriteBootstrap {
            path: path.clone(),
            message,
        };
        let rendered = serde_json::to_vec_pretty(bootstrap).map_err(|e| err(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| err(e.to_string()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| err(e.to_string()))?;
        file.write_all(&rendered).map_err(|e| err(e.to_string()))
    }

    fn argv(&self) -> Vec<String> {
        vec![
            "-c".to_owned(),
            self.config.bootstrap_path.display().to_string(),
            "--log-level".to_owned(),
            self.config.log_level.clone(),
            "--log-format".to_owned(),
            self.config.log_format.clone(),
        ]
    }

    /// Spawn the proxy and wait for it. An exit after cancellation is a
    /// clean shutdown; an exit on the proxy's own initiative propagates its
    /// status.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut child = Command::new(&self.config.binary_path)
            .args(self.argv())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Spawn {
                binary: self.config.binary_path.clone(),
                message: err.to_string(),
            })?;
        log::info!(
            "spawned proxy {} with bootstrap {}",
            self.config.binary_path.display(),
            self.config.bootstrap_path.display()
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|err| Error::Wait(err.to_string()))?;
                if cancel.is_cancelled() || status.success() {
                    log::info!("proxy exited with {status}");
                    Ok(())
                } else {
                    Err(Error::Exited { status })
                }
            }
            _ = cancel.cancelled() => {
                log::info!("shutting down proxy");
                if let Err(err) = child.kill().await {
                    log::warn!("failed to kill proxy: {err}");
                }
                let _ = child.wait().await;
                Ok(())
            }
        }
    }
}

/// Validate the proxy binary exists before the supervisor commits to the
/// start sequence.
pub fn check_binary(path: &Path) -> Result<(), Error> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Spawn {
            binary: path.to_owned(),
            message: "no such file".to_owned(),
        })
    }
}
