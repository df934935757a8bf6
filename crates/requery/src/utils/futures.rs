use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

/// The completion side of a [`deferred`] pair.
///
/// Resolving is infallible and idempotent. Dropping an unresolved `Deferred`
/// resolves it as well, so a fetch cycle that dies on an unexpected panic
/// still unblocks every caller that joined it.
pub struct Deferred {
    tx: Option<oneshot::Sender<()>>,
}

impl Deferred {
    /// Resolves the associated [`Settled`] future.
    pub fn resolve(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Nobody polling the settled future is fine.
            let _ = tx.send(());
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.send();
    }
}

/// A cloneable future that completes once the associated [`Deferred`] is
/// resolved (or dropped). It never errors and carries no value; it only
/// signals "the work has settled".
#[derive(Clone)]
pub struct Settled {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Settled {
    /// A `Settled` that is already complete.
    pub fn resolved() -> Self {
        Self {
            inner: std::future::ready(()).boxed().shared(),
        }
    }
}

impl Future for Settled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Creates a deferred completion pair.
///
/// The [`Settled`] half can be cloned and handed to any number of joiners
/// before the asynchronous work that will resolve it has even been spawned.
pub fn deferred() -> (Deferred, Settled) {
    let (tx, rx) = oneshot::channel();
    let settled = Settled {
        inner: async move {
            let _ = rx.await;
        }
        .boxed()
        .shared(),
    };
    (Deferred { tx: Some(tx) }, settled)
}
