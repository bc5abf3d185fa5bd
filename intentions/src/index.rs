// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};

use consul::ServiceName;
use parking_lot::RwLock;

/// Set algebra over (namespace, name) pairs, used by each chain watcher to
/// diff one observation against the previous one.
#[derive(Clone, Debug, Default)]
pub struct ServiceNameIndex {
    names: HashSet<ServiceName>,
}

impl ServiceNameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, name: &ServiceName) -> bool {
        self.names.contains(name)
    }

    pub fn add(&mut self, name: ServiceName) {
        self.names.insert(name);
    }

    pub fn remove(&mut self, name: &ServiceName) {
        self.names.remove(name);
    }

    pub fn all(&self) -> Vec<ServiceName> {
        let mut all: Vec<ServiceName> = self.names.iter().cloned().collect();
        all.sort();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Replace the held set with `names`, returning what appeared and what
    /// went away.
    pub fn replace(&mut self, names: &[ServiceName]) -> (Vec<ServiceName>, Vec<ServiceName>) {
        let incoming: HashSet<ServiceName> = names.iter().cloned().collect();
        let mut added: Vec<ServiceName> =
            incoming.difference(&self.names).cloned().collect();
        let mut removed: Vec<ServiceName> =
            self.names.difference(&incoming).cloned().collect();
        added.sort();
        removed.sort();
        self.names = incoming;
        (added, removed)
    }
}

/// Targets with the set of upstream sources that currently reach them.
///
/// Invariant: a target is present iff its reference set is non-empty.
#[derive(Debug, Default)]
pub struct RefCountedTargetIndex {
    targets: RwLock<HashMap<ServiceName, HashSet<ServiceName>>>,
}

impl RefCountedTargetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source` reaches `target`. Returns true when the target
    /// was not present before.
    pub fn add_ref(&self, target: ServiceName, source: ServiceName) -> bool {
        let mut targets = self.targets.write();
        match targets.get_mut(&target) {
            Some(refs) => {
                refs.insert(source);
                false
            }
            None => {
                targets.insert(target, HashSet::from([source]));
                true
            }
        }
    }

    /// Drop `source`'s reference on `target`. Returns true when that was
    /// the last reference and the target was removed.
    pub fn del_ref(&self, target: &ServiceName, source: &ServiceName) -> bool {
        let mut targets = self.targets.write();
        let emptied = match targets.get_mut(target) {
            Some(refs) => {
                refs.remove(source);
                refs.is_empty()
            }
            None => false,
        };
        if emptied {
            targets.remove(target);
        }
        emptied
    }

    pub fn exists(&self, target: &ServiceName) -> bool {
        self.targets.read().contains_key(target)
    }

    /// Every tracked target, sorted for deterministic sync passes.
    pub fn all(&self) -> Vec<ServiceName> {
        let mut all: Vec<ServiceName> = self.targets.read().keys().cloned().collect();
        all.sort();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}
