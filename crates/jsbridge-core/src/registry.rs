//! Process-wide environment registry.
//!
//! Trampolines receive only a numeric environment id from script and resolve
//! it here. Entries are weak: the registry never keeps an environment alive.

use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;

use crate::context::EnvShared;
use crate::id::EnvId;

static ENVIRONMENTS: LazyLock<DashMap<EnvId, Weak<EnvShared>>> = LazyLock::new(DashMap::new);

pub(crate) fn register(env: &Arc<EnvShared>) {
    ENVIRONMENTS.insert(env.id(), Arc::downgrade(env));
}

pub(crate) fn deregister(id: EnvId) {
    ENVIRONMENTS.remove(&id);
}

/// Resolve a live environment.
pub(crate) fn lookup(id: EnvId) -> Option<Arc<EnvShared>> {
    ENVIRONMENTS
        .get(&id)
        .and_then(|entry| entry.upgrade())
        .filter(|env| !env.is_destroyed())
}

pub(crate) fn contains(id: EnvId) -> bool {
    ENVIRONMENTS.contains_key(&id)
}
