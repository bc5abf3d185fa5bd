// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};

use consul::GatewayId;
use parking_lot::RwLock;

/// Read access to the set of known gateways and the secrets each one has
/// been granted. The SDS stream middleware consults this on every stream
/// open and subscribe.
pub trait GatewayRegistry: Send + Sync {
    /// Whether this gateway identity is known at all.
    fn has_gateway(&self, gateway: &GatewayId) -> bool;

    /// Whether the gateway may fetch every named secret.
    fn can_fetch(&self, gateway: &GatewayId, names: &[String]) -> bool;
}

/// In-memory registry: gateway -> granted secret names.
#[derive(Default)]
pub struct MemoryGatewayRegistry {
    gateways: RwLock<HashMap<GatewayId, HashSet<String>>>,
}

impl MemoryGatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_gateway(&self, gateway: GatewayId) {
        self.gateways.write().entry(gateway).or_default();
    }

    pub fn grant(&self, gateway: &GatewayId, name: impl Into<String>) {
        self.gateways
            .write()
            .entry(gateway.clone())
            .or_default()
            .insert(name.into());
    }

    pub fn remove_gateway(&self, gateway: &GatewayId) {
        self.gateways.write().remove(gateway);
    }
}

impl GatewayRegistry for MemoryGatewayRegistry {
    fn has_gateway(&self, gateway: &GatewayId) -> bool {
        self.gateways.read().contains_key(gateway)
    }

    fn can_fetch(&self, gateway: &GatewayId, names: &[String]) -> bool {
        let gateways = self.gateways.read();
        match gateways.get(gateway) {
            Some(granted) => names.iter().all(|name| granted.contains(name)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use consul::GatewayId;

    use super::{GatewayRegistry, MemoryGatewayRegistry};

    #[test]
    fn grants_are_per_gateway() {
        let store = MemoryGatewayRegistry::new();
        let gw = GatewayId::new("", "gateway");
        let other = GatewayId::new("", "other");
        store.add_gateway(gw.clone());
        store.grant(&gw, "secret-a");

        assert!(store.has_gateway(&gw));
        assert!(!store.has_gateway(&other));
        assert!(store.can_fetch(&gw, &["secret-a".to_owned()]));
        assert!(!store.can_fetch(&gw, &["secret-a".to_owned(), "secret-b".to_owned()]));
        assert!(!store.can_fetch(&other, &["secret-a".to_owned()]));

        // The default namespace and the empty namespace are one identity.
        assert!(store.has_gateway(&GatewayId::new("default", "gateway")));

        store.remove_gateway(&gw);
        assert!(!store.has_gateway(&gw));
    }
}
