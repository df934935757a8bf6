//! The pluggable transport seam and the retry/fetch-cycle engine.
//!
//! The store never talks to the network itself: it is constructed with a
//! [`Fetcher`] (the transport) and an [`ErrorMapper`] (the failure
//! classifier), and the cycle in [`cycle`] drives the attempt loop between
//! them.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::caching::{FetchError, Params};

pub(crate) mod cycle;

/// An opaque failure raised by a [`Fetcher`].
///
/// Synchronous panics aside, there is no distinction between "threw" and
/// "rejected" here; both surface as the returned future's error.
pub type FetchFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The data-fetching transport.
///
/// Implementations must honor the cancellation token promptly; the retry
/// engine additionally re-checks it after every resolution, so a result
/// arriving after cancellation is discarded either way.
pub trait Fetcher: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    fn fetch<'a>(
        &'a self,
        endpoint: &'a str,
        params: &'a Params,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Self::Data, FetchFailure>>;
}

/// Context handed to the [`ErrorMapper`] alongside the raw failure.
#[derive(Debug)]
pub struct ErrorContext<'a> {
    pub endpoint: &'a str,
    pub params: &'a Params,
    /// The owning store's configured description.
    pub description: &'a str,
    /// 1-based attempt number that failed.
    pub attempt: u32,
}

/// Classifies raw transport failures into structured [`FetchError`]s.
pub trait ErrorMapper: Send + Sync + 'static {
    fn map(&self, error: FetchFailure, ctx: &ErrorContext<'_>) -> FetchError;
}

/// The default classifier.
///
/// A [`FetchError`] returned by the fetcher passes through unchanged, so
/// transports can classify precisely at the source; anything else is
/// wrapped as a retryable failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn map(&self, error: FetchFailure, _ctx: &ErrorContext<'_>) -> FetchError {
        match error.downcast::<FetchError>() {
            Ok(classified) => *classified,
            Err(other) => FetchError::retryable(other.to_string()),
        }
    }
}

/// Exponential backoff for the given 1-based attempt: `base * 2^(attempt-1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}
