use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::fetching::cycle::FetchCycle;
use crate::fetching::{DefaultErrorMapper, ErrorMapper, Fetcher};
use crate::subscriptions::SubscriptionTracker;
use crate::utils::futures::{Settled, deferred};

use super::{FetchError, QueryKey};

/// Identifies one fetch cycle.
///
/// Every asynchronous completion handler re-reads the entry and compares
/// tokens before committing a write; a mismatch means the cycle has been
/// superseded and must not touch state any further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleToken(Uuid);

impl CycleToken {
    fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The currently executing fetch cycle of an entry.
pub(super) struct InFlight {
    pub(super) token: CycleToken,
    pub(super) cancel: CancellationToken,
    pub(super) settled: Settled,
}

/// An armed background poll.
pub(super) struct PollTimer {
    task: JoinHandle<()>,
}

impl PollTimer {
    pub(super) fn cancel(&self) {
        self.task.abort();
    }

    /// A timer that has already fired no longer protects its entry.
    pub(super) fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Per-key cache record. Owned exclusively by the store; consumers only
/// ever see [`QuerySnapshot`]s.
pub(super) struct QueryEntry<T> {
    pub(super) data: Option<Arc<T>>,
    pub(super) error: Option<FetchError>,
    pub(super) last_fetch: Option<Instant>,
    pub(super) in_flight: Option<InFlight>,
    pub(super) refetch_timer: Option<PollTimer>,
}

impl<T> Default for QueryEntry<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            last_fetch: None,
            in_flight: None,
            refetch_timer: None,
        }
    }
}

impl<T> QueryEntry<T> {
    pub(super) fn release_resources(self) {
        if let Some(in_flight) = self.in_flight {
            in_flight.cancel.cancel();
        }
        if let Some(timer) = self.refetch_timer {
            timer.cancel();
        }
    }
}

pub(super) struct StoreState<T> {
    pub(super) entries: FxHashMap<QueryKey, QueryEntry<T>>,
    pub(super) global_error: Option<String>,
}

pub(crate) struct StoreInner<T> {
    pub(super) id: Uuid,
    pub(crate) config: StoreConfig,
    pub(crate) fetcher: Arc<dyn Fetcher<Data = T>>,
    pub(crate) error_mapper: Arc<dyn ErrorMapper>,
    pub(super) subscriptions: SubscriptionTracker,
    pub(super) state: Mutex<StoreState<T>>,
    pub(super) count: watch::Sender<usize>,
}

/// A read-only view of one entry.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<FetchError>,
    pub is_loading: bool,
    pub last_fetch: Option<Instant>,
}

/// The per-resource-family entry store and fetch orchestrator.
///
/// Cloning yields another handle to the same store. All state transitions
/// run as synchronous critical sections, so readers never observe a state
/// where the entry count and the entry map disagree, and near-simultaneous
/// triggers can never claim the same key twice.
pub struct QueryStore<T> {
    pub(super) inner: Arc<StoreInner<T>>,
}

impl<T> Clone for QueryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for QueryStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queries = self.inner.state.try_lock().map(|s| s.entries.len());
        f.debug_struct("QueryStore")
            .field("description", &self.inner.config.description)
            .field("queries", &queries.unwrap_or_default())
            .finish()
    }
}

/// Constructs a [`QueryStore`].
pub struct QueryStoreBuilder<T> {
    config: StoreConfig,
    fetcher: Arc<dyn Fetcher<Data = T>>,
    error_mapper: Arc<dyn ErrorMapper>,
    subscriptions: Option<SubscriptionTracker>,
}

impl<T: Send + Sync + 'static> QueryStoreBuilder<T> {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn error_mapper(mut self, mapper: Arc<dyn ErrorMapper>) -> Self {
        self.error_mapper = mapper;
        self
    }

    pub fn subscriptions(mut self, tracker: SubscriptionTracker) -> Self {
        self.subscriptions = Some(tracker);
        self
    }

    pub fn build(self) -> QueryStore<T> {
        let (count, _) = watch::channel(0);
        QueryStore {
            inner: Arc::new(StoreInner {
                id: Uuid::new_v4(),
                config: self.config,
                fetcher: self.fetcher,
                error_mapper: self.error_mapper,
                subscriptions: self.subscriptions.unwrap_or_default(),
                state: Mutex::new(StoreState {
                    entries: FxHashMap::default(),
                    global_error: None,
                }),
                count,
            }),
        }
    }
}

impl<T: Send + Sync + 'static> QueryStore<T> {
    pub fn builder(fetcher: Arc<dyn Fetcher<Data = T>>) -> QueryStoreBuilder<T> {
        QueryStoreBuilder {
            config: StoreConfig::default(),
            fetcher,
            error_mapper: Arc::new(DefaultErrorMapper),
            subscriptions: None,
        }
    }

    /// Triggers a fetch for `key`, returning a future that completes once
    /// the attempt has settled (not necessarily succeeded).
    ///
    /// The decision ladder, run atomically:
    ///
    /// 1. `force` with a cycle in flight: cancel it. The entry stays; the
    ///    cycle observes cancellation and exits on its own.
    /// 2. Otherwise a cycle in flight means the caller joins it.
    /// 3. Not forcing, and the cached value is fresh: serve it, re-anchoring
    ///    the background poll if one is configured.
    /// 4. Otherwise claim a new cycle: token, cancellation handle, and the
    ///    deferred completion are written into the entry before the cycle
    ///    task is spawned.
    pub fn trigger_fetch(&self, key: &QueryKey, force: bool) -> Settled {
        let mut state = self.inner.state.lock().unwrap();

        if force {
            if let Some(in_flight) = state.entries.get(key).and_then(|e| e.in_flight.as_ref()) {
                tracing::debug!(key = %key, "cancelling in-flight fetch for forced refetch");
                in_flight.cancel.cancel();
            }
        } else if let Some(in_flight) = state.entries.get(key).and_then(|e| e.in_flight.as_ref()) {
            tracing::debug!(key = %key, "joining in-flight fetch");
            return in_flight.settled.clone();
        }

        if !force && self.inner.config.caching_enabled() {
            let ttl = self.inner.config.cache_ttl;
            let refetch_interval = self.inner.config.refetch_interval;
            if let Some(entry) = state.entries.get_mut(key) {
                let fresh = entry.error.is_none()
                    && entry.data.is_some()
                    && entry.last_fetch.is_some_and(|at| at.elapsed() < ttl);
                if fresh {
                    if let Some(interval) = refetch_interval {
                        self.inner.schedule_poll(entry, key, interval);
                    }
                    tracing::debug!(key = %key, "serving cached data");
                    return Settled::resolved();
                }
            }
        }

        let token = CycleToken::mint();
        let cancel = CancellationToken::new();
        let (deferred, settled) = deferred();

        let entry = state.entries.entry(key.clone()).or_default();
        entry.in_flight = Some(InFlight {
            token,
            cancel: cancel.clone(),
            settled: settled.clone(),
        });
        self.inner.publish_count(&state);
        drop(state);

        tracing::debug!(key = %key, "starting fetch cycle");
        let cycle = FetchCycle::new(Arc::clone(&self.inner), key.clone(), token, cancel, deferred);
        tokio::spawn(cycle.run());

        settled
    }

    /// Force-refetches every entry whose cached value has outlived the TTL.
    ///
    /// Entries with a fetch in flight or a recorded error are skipped; a
    /// disabled cache makes this a no-op.
    pub fn refetch_stale_queries(&self) {
        if !self.inner.config.caching_enabled() {
            return;
        }
        let ttl = self.inner.config.cache_ttl;
        let stale: Vec<QueryKey> = {
            let state = self.inner.state.lock().unwrap();
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.in_flight.is_none()
                        && entry.error.is_none()
                        && entry.last_fetch.is_some_and(|at| at.elapsed() >= ttl)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        if !stale.is_empty() {
            tracing::debug!(
                store = %self.inner.config.description,
                count = stale.len(),
                "refetching stale queries"
            );
        }
        for key in stale {
            let _settled = self.trigger_fetch(&key, true);
        }
    }

    /// Removes the entry for `key`, cancelling its in-flight cycle and
    /// disarming its poll timer. Unknown keys are a no-op.
    ///
    /// Removal is immediately visible; a fetch that resolves for a cleared
    /// key later finds no entry and discards its result.
    pub fn clear_query_state(&self, key: &QueryKey) {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            let removed = state.entries.remove(key);
            if removed.is_some() {
                self.inner.publish_count(&state);
            }
            removed
        };
        if let Some(entry) = removed {
            tracing::debug!(key = %key, "cleared query state");
            // Resource release happens outside the lock so that nothing a
            // cancellation wakes up can contend with the removal itself.
            entry.release_resources();
        }
    }

    /// Removes every entry and clears the store-wide error in one atomic
    /// step, then releases all cancellation handles and timers.
    pub fn clear_all_query_states(&self) {
        let drained: Vec<QueryEntry<T>> = {
            let mut state = self.inner.state.lock().unwrap();
            let entries = std::mem::take(&mut state.entries);
            state.global_error = None;
            self.inner.publish_count(&state);
            entries.into_values().collect()
        };
        tracing::debug!(
            store = %self.inner.config.description,
            count = drained.len(),
            "cleared all query states"
        );
        for entry in drained {
            entry.release_resources();
        }
    }

    /// Sets the store-wide error slot. No per-key entry is touched.
    pub fn set_global_error_state(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(store = %self.inner.config.description, error = %message, "global error state set");
        self.inner.state.lock().unwrap().global_error = Some(message);
    }

    pub fn global_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap().global_error.clone()
    }

    /// Number of live entries.
    pub fn query_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    /// A read-only view of the entry for `key`, if one exists.
    pub fn snapshot(&self, key: &QueryKey) -> Option<QuerySnapshot<T>> {
        let state = self.inner.state.lock().unwrap();
        state.entries.get(key).map(|entry| QuerySnapshot {
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_loading: entry.in_flight.is_some(),
            last_fetch: entry.last_fetch,
        })
    }

    /// The liveness tracker consulted by the garbage-collection sweep.
    pub fn subscriptions(&self) -> &SubscriptionTracker {
        &self.inner.subscriptions
    }

    pub(crate) fn id(&self) -> Uuid {
        self.inner.id
    }

    pub(crate) fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }
}

impl<T> StoreInner<T> {
    pub(super) fn publish_count(&self, state: &StoreState<T>) {
        self.count.send_replace(state.entries.len());
    }

    /// Clears the in-flight slot if it still belongs to `token`.
    ///
    /// Runs on every cycle completion path; a mismatch means a newer cycle
    /// owns the key now and nothing is touched.
    pub(crate) fn finish_cycle(&self, key: &QueryKey, token: CycleToken) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            if entry
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.token == token)
            {
                entry.in_flight = None;
            }
        }
    }

    /// Writes a classified error into the entry, keeping any stale data.
    ///
    /// Returns `false` without writing when the entry is gone or the cycle
    /// has been superseded.
    pub(crate) fn commit_error(&self, key: &QueryKey, token: CycleToken, error: FetchError) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if !entry
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.token == token)
        {
            return false;
        }
        entry.error = Some(error);
        true
    }
}

impl<T: Send + Sync + 'static> StoreInner<T> {
    /// Commits a successful fetch: data, cleared error, a fresh timestamp,
    /// and the next background poll anchored at this success.
    ///
    /// Returns `false` without writing (and without arming a timer) when
    /// the entry is gone or the cycle has been superseded.
    pub(crate) fn commit_success(self: &Arc<Self>, key: &QueryKey, token: CycleToken, data: T) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if !entry
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.token == token)
        {
            return false;
        }
        entry.data = Some(Arc::new(data));
        entry.error = None;
        entry.last_fetch = Some(Instant::now());
        if let Some(interval) = self.config.refetch_interval {
            self.schedule_poll(entry, key, interval);
        }
        true
    }

    /// Arms (or re-arms) the background poll for `key`, anchored at now.
    pub(super) fn schedule_poll(
        self: &Arc<Self>,
        entry: &mut QueryEntry<T>,
        key: &QueryKey,
        interval: Duration,
    ) {
        if let Some(old) = entry.refetch_timer.take() {
            old.cancel();
        }
        let weak = Arc::downgrade(self);
        let key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::debug!(key = %key, "background refetch interval elapsed");
            let store = QueryStore { inner };
            let _settled = store.trigger_fetch(&key, false);
        });
        entry.refetch_timer = Some(PollTimer { task });
    }
}

/// Object-safe store operations, used by the garbage collector's visiting
/// set and the global registry's broadcast fan-out.
pub trait StoreActions: Send + Sync + 'static {
    fn refetch_stale_queries(&self);
    fn clear_all_query_states(&self);
    fn clear_stale_queries(&self);
    fn query_count(&self) -> usize;
}

impl<T: Send + Sync + 'static> StoreActions for QueryStore<T> {
    fn refetch_stale_queries(&self) {
        QueryStore::refetch_stale_queries(self)
    }

    fn clear_all_query_states(&self) {
        QueryStore::clear_all_query_states(self)
    }

    fn clear_stale_queries(&self) {
        QueryStore::clear_stale_queries(self)
    }

    fn query_count(&self) -> usize {
        QueryStore::query_count(self)
    }
}
