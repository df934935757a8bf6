//! The subscription liveness tracker.
//!
//! An external registry of "is anyone currently interested in key K". A
//! binding layer subscribes on mount and unsubscribes on unmount; the
//! garbage-collection sweep consults the tracker read-only and skips any
//! key that still has subscribers.

use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::caching::QueryKey;

/// Token returned by [`SubscriptionTracker::subscribe`]; required to
/// unsubscribe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Tracks live consumers per query key.
///
/// Cloning yields another handle to the same tracker. Keys with no
/// remaining subscribers are pruned automatically.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    inner: Arc<Mutex<FxHashMap<QueryKey, FxHashSet<SubscriptionId>>>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`.
    pub fn subscribe(&self, key: &QueryKey) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.inner
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .insert(id);
        id
    }

    /// Drops one registered interest. Unknown ids and keys are ignored.
    pub fn unsubscribe(&self, key: &QueryKey, id: SubscriptionId) {
        let mut map = self.inner.lock().unwrap();
        if let Some(subscribers) = map.get_mut(key) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Whether anybody currently subscribes to `key`.
    pub fn has_subscribers(&self, key: &QueryKey) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    /// Number of keys with at least one subscriber.
    pub fn tracked_keys(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
