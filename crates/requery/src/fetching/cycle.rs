//! The retry/fetch-cycle engine.
//!
//! One [`FetchCycle`] drives all attempts for a single trigger. The cycle
//! never rejects the settled future handed to joiners: failures are
//! classified and written into the entry (gated on the cycle token still
//! being current), and the completion guard clears the in-flight slot and
//! resolves the settled future on every exit path, panics included.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::caching::store::{CycleToken, StoreInner};
use crate::caching::{FetchError, ParsedQuery, QueryKey};
use crate::utils::futures::Deferred;

use super::{ErrorContext, FetchFailure, backoff_delay};

/// Clears the in-flight slot (token-gated) and resolves the settled future
/// when dropped. Keeping this in a guard means even a panicking fetcher or
/// mapper cannot leave joiners hanging or the slot claimed.
struct CompletionGuard<T> {
    store: Arc<StoreInner<T>>,
    key: QueryKey,
    token: CycleToken,
    _deferred: Deferred,
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.store.finish_cycle(&self.key, self.token);
    }
}

pub(crate) struct FetchCycle<T> {
    guard: CompletionGuard<T>,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> FetchCycle<T> {
    pub(crate) fn new(
        store: Arc<StoreInner<T>>,
        key: QueryKey,
        token: CycleToken,
        cancel: CancellationToken,
        deferred: Deferred,
    ) -> Self {
        Self {
            guard: CompletionGuard {
                store,
                key,
                token,
                _deferred: deferred,
            },
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        let key = &self.guard.key;
        let store = &self.guard.store;
        let token = self.guard.token;

        let parsed = match key.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "query key failed to parse; aborting fetch cycle");
                store.commit_error(
                    key,
                    token,
                    FetchError::terminal(format!("invalid query key: {err}")),
                );
                return;
            }
        };

        let max_attempts = store.config.max_attempts();
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                tracing::debug!(key = %key, attempt, "fetch cycle cancelled before attempt");
                return;
            }

            let result = store
                .fetcher
                .fetch(&parsed.endpoint, &parsed.params, &self.cancel)
                .await;

            if self.cancel.is_cancelled() {
                if result.is_ok() {
                    // Data arriving after cancellation must not be
                    // committed; the entry records why it stayed empty.
                    tracing::warn!(key = %key, attempt, "discarding fetch result that arrived after cancellation");
                    store.commit_error(
                        key,
                        token,
                        FetchError::terminal(
                            "fetch aborted after a response was received; result discarded",
                        ),
                    );
                } else {
                    tracing::debug!(key = %key, attempt, "fetch cycle cancelled during attempt");
                }
                return;
            }

            match result {
                Ok(data) => {
                    if store.commit_success(key, token, data) {
                        tracing::debug!(key = %key, attempt, "fetch succeeded");
                    } else {
                        tracing::debug!(key = %key, attempt, "fetch result discarded; cycle superseded or entry cleared");
                    }
                    return;
                }
                Err(failure) => {
                    let classified = self.classify(failure, &parsed, attempt);
                    if classified.is_abort {
                        tracing::debug!(key = %key, attempt, "fetch aborted");
                        return;
                    }
                    let retryable = classified.retryable;
                    let retry_after = classified.retry_after;
                    tracing::warn!(key = %key, attempt, error = %classified, "fetch attempt failed");
                    store.commit_error(key, token, classified);

                    if !retryable || attempt == max_attempts {
                        tracing::debug!(key = %key, attempt, retryable, "giving up on fetch cycle");
                        return;
                    }

                    let delay = retry_after
                        .unwrap_or_else(|| backoff_delay(store.config.retry_delay, attempt));
                    tracing::debug!(key = %key, attempt, ?delay, "waiting before retry");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            tracing::debug!(key = %key, "fetch cycle cancelled during backoff");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn classify(&self, failure: FetchFailure, parsed: &ParsedQuery, attempt: u32) -> FetchError {
        let ctx = ErrorContext {
            endpoint: &parsed.endpoint,
            params: &parsed.params,
            description: &self.guard.store.config.description,
            attempt,
        };
        match catch_unwind(AssertUnwindSafe(|| {
            self.guard.store.error_mapper.map(failure, &ctx)
        })) {
            Ok(classified) => classified,
            Err(_) => {
                // A broken mapper must not take the cycle down with it.
                tracing::error!(key = %self.guard.key, attempt, "error mapper panicked while classifying a fetch failure");
                FetchError::terminal("error classification failed")
            }
        }
    }
}
