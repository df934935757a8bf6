//! The cache core: keys, entries, the store state machine, and eviction.
//!
//! ## State model
//!
//! A [`QueryStore`] owns one entry per [`QueryKey`]. An entry holds the last
//! successfully fetched data, the last classified error, and the timestamp
//! of the last success. While a fetch cycle runs it additionally holds the
//! in-flight marker: a settled-future for joiners, the cycle's token, and
//! its cancellation handle. Entries exist from the first trigger of their
//! key until an explicit clear or a GC eviction removes them.
//!
//! ## Concurrency
//!
//! Every state transition is a synchronous critical section under the
//! store's mutex, invoked from within asynchronous tasks. The trigger path
//! claims its fetch slot in the same critical section that checked for an
//! existing one, which is what makes request coalescing race-free. The
//! in-flight token makes all writes from a cycle optimistic: a cycle that
//! has been superseded (forced refetch) or orphaned (cleared entry) finds
//! its token gone and commits nothing.
//!
//! ## Eviction
//!
//! [`QueryStore::clear_stale_queries`] evicts entries that are stale beyond
//! the GC grace period *and* safe to drop: no subscribers, no in-flight
//! cycle, no armed poll timer. The [`GcService`] runs the sweep periodically
//! and drops stores from its visiting set once they have been empty for a
//! debounce interval.

mod error;
pub(crate) mod gc;
mod query_key;
pub(crate) mod store;


pub use error::FetchError;
pub use gc::GcService;
pub use query_key::{KeyError, ParamValue, Params, ParsedQuery, QueryKey};
pub use store::{QuerySnapshot, QueryStore, QueryStoreBuilder, StoreActions};

pub use crate::utils::futures::Settled;
