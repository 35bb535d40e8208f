use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{Coordinator, Message, PendingRequest};
use crate::driver::{Driver, FnDriver};
use crate::error::GetError;

/// A concurrent, cancellable, single-flight memoizing cache.
///
/// Wraps a [`Driver`] and guarantees that for any key, at most one
/// [`Driver::compute`] invocation is in flight at a time; concurrent
/// [`get`](Self::get) calls for the same key share that computation and all
/// receive the identical outcome. See the crate docs for the ownership and
/// restart protocol.
///
/// The handle is cheap to clone; all clones share the same entry map. The map
/// lives and dies with the cache instance: once every handle is dropped and
/// all in-flight computations have settled, the coordinator task exits and
/// the cached entries are freed.
pub struct ComputationCache<D: Driver> {
    inner: Arc<CacheInner<D>>,
}

struct CacheInner<D: Driver> {
    requests: mpsc::UnboundedSender<Message<D>>,
    closed: AtomicBool,
}

impl<D: Driver> Clone for ComputationCache<D> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        ComputationCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for ComputationCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationCache")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<D: Driver> ComputationCache<D> {
    /// Creates a cache memoizing `driver`'s computations.
    ///
    /// Spawns the coordinator task on the current tokio runtime, so this must
    /// be called from within a runtime context.
    pub fn new(driver: D) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(driver, requests.downgrade());
        tokio::spawn(coordinator.run(rx));
        ComputationCache {
            inner: Arc::new(CacheInner {
                requests,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Looks up or computes the value for `key`.
    ///
    /// Suspends until the outcome is delivered or the caller's own `cancel`
    /// fires, whichever happens first. Cancelling never delays other callers
    /// waiting on the same key, with one exception: if this caller is the one
    /// whose token drives the running computation, its cancellation triggers
    /// a restart, paid for by the cache rather than the surviving waiters.
    ///
    /// A timeout is expressed by cancelling the token after a deadline.
    ///
    /// # Errors
    ///
    /// - [`GetError::Computation`] if the driver failed; the failure is
    ///   cached and served verbatim to later lookups of the same key.
    /// - [`GetError::Cancelled`] if `cancel` fired first; never cached.
    /// - [`GetError::Closed`] if the cache was closed before this request was
    ///   accepted.
    pub async fn get(
        &self,
        key: D::Key,
        cancel: CancellationToken,
    ) -> Result<D::Value, GetError<D::Error>> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(GetError::Closed);
        }
        let (responder, delivery) = oneshot::channel();
        let request = PendingRequest {
            key,
            responder,
            cancel: cancel.clone(),
        };
        self.inner
            .requests
            .send(Message::Request(request))
            .map_err(|_| GetError::Closed)?;

        tokio::select! {
            // Checked first: a caller whose own signal fired observes the
            // cancelled outcome no matter what else is ready.
            biased;
            _ = cancel.cancelled() => Err(GetError::Cancelled),
            delivered = delivery => match delivered {
                Ok(outcome) => outcome.map_err(GetError::Computation),
                // The coordinator dropped our request without answering.
                Err(_) if cancel.is_cancelled() => Err(GetError::Cancelled),
                Err(_) => Err(GetError::Closed),
            },
        }
    }

    /// Closes the cache.
    ///
    /// Later [`get`](Self::get) calls fail with [`GetError::Closed`].
    /// Requests already in flight still resolve through their existing
    /// delivery path, and running computations are not aborted.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.requests.send(Message::Close).ok();
    }
}

impl<K, V, E, F> ComputationCache<FnDriver<K, V, E, F>>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
    F: Fn(K, CancellationToken) -> BoxFuture<'static, Result<V, E>> + Send + Sync + 'static,
{
    /// Creates a cache memoizing a plain closure, without the ceremony of a
    /// [`Driver`] implementation.
    pub fn from_fn(compute: F) -> Self {
        Self::new(FnDriver::new(compute))
    }
}
