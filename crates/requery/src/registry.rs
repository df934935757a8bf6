//! The global store registry: thin broadcast fan-out across independent
//! stores.
//!
//! A coordination layer registers every store it creates and can then tell
//! all of them at once to refetch whatever has gone stale ("the tab became
//! visible again") or to drop everything ("the user logged out").

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::caching::StoreActions;

type Members = Mutex<FxHashMap<Uuid, Arc<dyn StoreActions>>>;

/// Registry of store actions. Cloning yields another handle to the same
/// registry.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    members: Arc<Members>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store's actions; the returned handle unregisters them
    /// again, either explicitly or on drop.
    pub fn register(&self, actions: Arc<dyn StoreActions>) -> RegistryHandle {
        let id = Uuid::new_v4();
        self.members.lock().unwrap().insert(id, actions);
        RegistryHandle {
            members: Arc::downgrade(&self.members),
            id,
        }
    }

    /// Tells every registered store to refetch its stale queries.
    pub fn refetch_all(&self) {
        self.broadcast("refetch_stale_queries", |store| {
            store.refetch_stale_queries()
        });
    }

    /// Tells every registered store to drop all of its query state.
    pub fn clear_all(&self) {
        self.broadcast("clear_all_query_states", |store| {
            store.clear_all_query_states()
        });
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().unwrap().is_empty()
    }

    /// Runs `op` against a snapshot of the registered stores, logging and
    /// continuing past any individual store's panic.
    fn broadcast(&self, operation: &str, op: impl Fn(&dyn StoreActions)) {
        let stores: Vec<Arc<dyn StoreActions>> =
            self.members.lock().unwrap().values().cloned().collect();
        tracing::debug!(operation, stores = stores.len(), "broadcasting to registered stores");
        for store in stores {
            if catch_unwind(AssertUnwindSafe(|| op(store.as_ref()))).is_err() {
                tracing::error!(operation, "a registered store panicked during broadcast; continuing");
            }
        }
    }
}

/// Keeps one registration alive. Dropping (or calling
/// [`unregister`](Self::unregister)) removes the store from the registry.
pub struct RegistryHandle {
    members: Weak<Members>,
    id: Uuid,
}

impl RegistryHandle {
    pub fn unregister(self) {
        // Drop does the work.
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        if let Some(members) = self.members.upgrade() {
            members.lock().unwrap().remove(&self.id);
        }
    }
}
