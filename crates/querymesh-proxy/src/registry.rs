//! Backend registry
//!
//! The proxy never owns the backend list; it is handed a registry exposing
//! a single `snapshot` operation. Implementations may wrap gossip, DNS
//! polling, file watching or a static list. A snapshot stays usable for
//! the whole request even if the backend is retired concurrently.

use crate::client::StoreClient;
use std::sync::{Arc, RwLock};

/// Supplier of the currently-known backends.
pub trait StoreRegistry: Send + Sync {
    /// A consistent snapshot of the current backends. Concurrent callers
    /// each get their own snapshot; no locking is required at call sites.
    fn snapshot(&self) -> Vec<Arc<dyn StoreClient>>;
}

/// A fixed backend list, mostly useful for tests and single-tier setups.
#[derive(Default)]
pub struct StaticRegistry {
    stores: Vec<Arc<dyn StoreClient>>,
}

impl StaticRegistry {
    pub fn new(stores: Vec<Arc<dyn StoreClient>>) -> Self {
        Self { stores }
    }
}

impl StoreRegistry for StaticRegistry {
    fn snapshot(&self) -> Vec<Arc<dyn StoreClient>> {
        self.stores.clone()
    }
}

/// A registry whose backend list can be swapped at runtime, e.g. by a
/// discovery loop.
#[derive(Default)]
pub struct SharedRegistry {
    stores: RwLock<Vec<Arc<dyn StoreClient>>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one backend.
    pub fn register(&self, store: Arc<dyn StoreClient>) {
        self.stores
            .write()
            .expect("store registry lock poisoned")
            .push(store);
    }

    /// Replace the whole backend list.
    pub fn replace(&self, stores: Vec<Arc<dyn StoreClient>>) {
        *self.stores.write().expect("store registry lock poisoned") = stores;
    }

    /// Drop all backends.
    pub fn clear(&self) {
        self.stores
            .write()
            .expect("store registry lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.stores.read().expect("store registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreRegistry for SharedRegistry {
    fn snapshot(&self) -> Vec<Arc<dyn StoreClient>> {
        self.stores
            .read()
            .expect("store registry lock poisoned")
            .clone()
    }
}
