//! # requery
//!
//! A per-resource, in-memory request cache and fetch orchestrator.
//!
//! Given a resource key (an endpoint plus a normalized parameter map), a
//! [`QueryStore`] guarantees at most one concurrent outbound fetch per key,
//! serves fresh results from a time-bounded cache, retries transient failures
//! with exponential backoff, supports cooperative cancellation, and reclaims
//! memory for keys no longer observed by any consumer.
//!
//! ## Architecture
//!
//! Every request against a key passes through the store's trigger state
//! machine:
//!
//! - If a fetch cycle is already running for the key, the caller joins it:
//!   the existing settled-future is returned and no new work starts
//!   (request coalescing).
//! - If the cached value is still fresh (strictly younger than the configured
//!   TTL, with no recorded error), it is served without any network work.
//! - Otherwise a fresh fetch cycle is claimed *synchronously*: a new cycle
//!   token, cancellation token, and deferred promise are written into the
//!   entry before any asynchronous work is spawned, so near-simultaneous
//!   callers can never race each other into duplicate fetches.
//!
//! The fetch cycle itself ([`fetching`]) drives up to `retry_attempts`
//! attempts against the injected [`Fetcher`], classifying failures through
//! the injected [`ErrorMapper`], honoring server-suggested retry delays over
//! exponential backoff, and observing its [`CancellationToken`] at every
//! attempt boundary and during backoff waits. Each cycle is identified by an
//! opaque token; any write it makes back into the store is gated on that
//! token still being current, so a slow, superseded cycle can never clobber
//! state written by a newer one.
//!
//! Reclamation is handled by a garbage-collection sweep
//! ([`QueryStore::clear_stale_queries`]) driven periodically by a
//! [`GcService`]. An entry is only ever evicted when nobody subscribes to its
//! key (per the [`SubscriptionTracker`]), no fetch is in flight, no
//! background poll timer is armed, and its last success is strictly older
//! than the GC grace period. A [`StoreRegistry`] provides the thin broadcast
//! fan-out ("refetch stale", "clear all") across independent stores.
//!
//! Failures never reject the future returned by
//! [`QueryStore::trigger_fetch`]; its contract is "the attempt has settled",
//! and user-visible failure lives exclusively in the entry's error slot (or
//! the store-wide error slot) for a binding layer to render.

pub mod caching;
pub mod config;
pub mod fetching;
pub mod logging;
pub mod registry;
pub mod subscriptions;
pub mod utils;

pub use caching::{
    FetchError, KeyError, ParamValue, Params, ParsedQuery, QueryKey, QuerySnapshot, QueryStore,
    QueryStoreBuilder, StoreActions,
};
pub use caching::{GcService, Settled};
pub use config::{GcConfig, StoreConfig};
pub use fetching::{DefaultErrorMapper, ErrorContext, ErrorMapper, FetchFailure, Fetcher};
pub use registry::{RegistryHandle, StoreRegistry};
pub use subscriptions::{SubscriptionId, SubscriptionTracker};
