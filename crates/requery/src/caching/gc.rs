//! Garbage collection: the eviction sweep and the service driving it.

use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::GcConfig;

use super::QueryKey;
use super::store::{QueryStore, StoreActions};

impl<T: Send + Sync + 'static> QueryStore<T> {
    /// The garbage-collection sweep.
    ///
    /// An entry is evicted only when *all* of the following hold: nobody
    /// subscribes to its key, no fetch is in flight, no background poll
    /// timer is armed, and its last success is strictly older than the GC
    /// grace period. Entries that never fetched successfully carry no valid
    /// timestamp and are deliberately left alone.
    ///
    /// Removal happens atomically; cancellation handles and timers are
    /// released only after the lock is dropped, so cleanup can never
    /// re-enter the sweep.
    pub fn clear_stale_queries(&self) {
        let grace = self.inner.config.effective_gc_grace();
        let evicted = {
            let mut state = self.inner.state.lock().unwrap();
            let eligible: Vec<QueryKey> = state
                .entries
                .iter()
                .filter(|(key, entry)| {
                    if self.inner.subscriptions.has_subscribers(key) {
                        return false;
                    }
                    if entry.in_flight.is_some() {
                        return false;
                    }
                    if entry
                        .refetch_timer
                        .as_ref()
                        .is_some_and(|timer| timer.is_active())
                    {
                        return false;
                    }
                    entry.last_fetch.is_some_and(|at| at.elapsed() > grace)
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut evicted = Vec::with_capacity(eligible.len());
            for key in eligible {
                if let Some(entry) = state.entries.remove(&key) {
                    evicted.push((key, entry));
                }
            }
            if !evicted.is_empty() {
                self.inner.publish_count(&state);
            }
            evicted
        };

        for (key, entry) in evicted {
            tracing::debug!(key = %key, "evicted stale query state");
            entry.release_resources();
        }
    }
}

struct GcMember {
    actions: Arc<dyn StoreActions>,
    watcher: JoinHandle<()>,
}

struct GcInner {
    config: GcConfig,
    members: Mutex<FxHashMap<Uuid, GcMember>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Drives periodic [`QueryStore::clear_stale_queries`] sweeps over a set of
/// watched stores.
///
/// Each watched store also gets an idle watcher: once the store's entry
/// count stays at zero for the configured debounce, the store is dropped
/// from the visiting set (there is no point sweeping an empty store).
/// Re-watching a store re-arms it.
pub struct GcService {
    inner: Arc<GcInner>,
}

impl GcService {
    pub fn new(config: GcConfig) -> Self {
        Self {
            inner: Arc::new(GcInner {
                config,
                members: Mutex::new(FxHashMap::default()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Starts the periodic sweep. Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock().unwrap();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let interval = self.inner.config.sweep_interval;
        let weak = Arc::downgrade(&self.inner);
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let targets: Vec<Arc<dyn StoreActions>> = inner
                    .members
                    .lock()
                    .unwrap()
                    .values()
                    .map(|member| Arc::clone(&member.actions))
                    .collect();
                tracing::debug!(stores = targets.len(), "running gc sweep");
                for store in targets {
                    store.clear_stale_queries();
                }
            }
        }));
    }

    /// Stops the periodic sweep. Idempotent. Idle watchers stay armed; they
    /// end on their own when their store idles out or this service drops.
    pub fn stop(&self) {
        if let Some(task) = self.inner.sweeper.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Adds `store` to the visiting set and (re)arms its idle watcher.
    pub fn watch_store<T: Send + Sync + 'static>(&self, store: &QueryStore<T>) {
        let id = store.id();
        let watcher = self.spawn_idle_watcher(id, store.subscribe_count());
        let member = GcMember {
            actions: Arc::new(store.clone()),
            watcher,
        };
        if let Some(previous) = self.inner.members.lock().unwrap().insert(id, member) {
            previous.watcher.abort();
        }
    }

    /// Number of stores currently visited by the sweep.
    pub fn watched_stores(&self) -> usize {
        self.inner.members.lock().unwrap().len()
    }

    fn spawn_idle_watcher(&self, id: Uuid, mut count: watch::Receiver<usize>) -> JoinHandle<()> {
        let debounce = self.inner.config.idle_debounce;
        let weak: Weak<GcInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                while *count.borrow_and_update() != 0 {
                    if count.changed().await.is_err() {
                        return;
                    }
                }

                // Debounce. Every fresh zero publication restarts the
                // window; a nonzero count cancels the deregistration.
                let deregister = loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => {
                            break *count.borrow() == 0;
                        }
                        changed = count.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if *count.borrow_and_update() != 0 {
                                break false;
                            }
                        }
                    }
                };

                if deregister {
                    if let Some(inner) = weak.upgrade() {
                        tracing::debug!(store = %id, "store idle; dropping from gc visiting set");
                        // This watcher belongs to the member being removed;
                        // dropping its join handle merely detaches the task.
                        drop(inner.members.lock().unwrap().remove(&id));
                    }
                    return;
                }
                // The store became active again; wait for the next
                // zero-transition.
            }
        })
    }
}

impl Drop for GcInner {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().unwrap().take() {
            task.abort();
        }
        for (_, member) in self.members.get_mut().unwrap().drain() {
            member.watcher.abort();
        }
    }
}
