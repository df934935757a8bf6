use std::time::Duration;

use thiserror::Error;

/// A classified fetch failure, produced by the
/// [`ErrorMapper`](crate::ErrorMapper) and stored in a query entry.
///
/// This is the user-visible failure value: the retry engine writes it into
/// the entry's error slot, and a binding layer renders it. It never rejects
/// the future returned by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
    /// Human-readable description of the failure.
    pub message: String,
    /// Whether the retry engine may attempt the fetch again.
    pub retryable: bool,
    /// A server-suggested delay before the next attempt. Takes precedence
    /// over exponential backoff when present.
    pub retry_after: Option<Duration>,
    /// Whether this failure represents cooperative cancellation. Aborts end
    /// the cycle silently and are never written into the entry.
    pub is_abort: bool,
    /// HTTP-like status code, if the transport produced one.
    pub status: Option<u16>,
    /// Machine-readable error code, if the transport produced one.
    pub error_code: Option<String>,
}

impl FetchError {
    fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
            retry_after: None,
            is_abort: false,
            status: None,
            error_code: None,
        }
    }

    /// A transient failure the retry engine may attempt again.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    /// A terminal failure; no further attempts are made.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    /// A cooperative cancellation; ends the cycle silently.
    pub fn aborted(message: impl Into<String>) -> Self {
        let mut error = Self::new(message, false);
        error.is_abort = true;
        error
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}
