// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Secret Discovery Service for the embedded proxy.
//!
//! A delta-xDS gRPC endpoint served over mTLS. The server certificate and
//! client-CA pool come from the live cert manager on every handshake; each
//! stream is admitted only after its peer's SPIFFE identity resolves to a
//! known gateway, and may only fetch the secrets that gateway was granted.

pub mod auth;
pub mod cache;
pub mod server;
pub mod service;
pub mod store;
pub mod tls;

pub use auth::SpiffePath;
pub use cache::DeltaCache;
pub use server::{SdsServer, SdsServerConfig};
pub use store::{GatewayRegistry, MemoryGatewayRegistry};

/// The one resource type this endpoint serves.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to bind SDS listener on {address}: {message}")]
    Bind { address: String, message: String },

    #[error("TLS material unavailable: {0}")]
    TlsMaterial(String),

    #[error("invalid TLS material: {0}")]
    InvalidTls(String),

    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}
