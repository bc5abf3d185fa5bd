// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod client;
pub mod error;
pub mod http;
pub mod testutil;
pub mod types;

pub use client::{
    AclClient, AgentClient, Client, ConfigEntryClient, ConnectCaClient, DiscoveryChainClient,
};
pub use error::Error;
pub use types::{
    AclToken, AgentService, CaRoot, CaRootSet, CheckStatus, DiscoveryChain, GatewayId,
    IntentionAction, IntentionSource, LeafCert, NamedPort, QueryMeta, QueryOptions,
    ServiceIntentionsEntry, ServiceName, ServiceRegistration, TcpCheck, TtlCheck,
    SERVICE_INTENTIONS_KIND,
};
