use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The computation that a [`ComputationCache`](crate::ComputationCache)
/// memoizes.
///
/// The driver provides the actual computation that is being cached, keyed by
/// [`Key`](Self::Key). The cache guarantees that for any key, at most one
/// [`compute`](Self::compute) invocation is in flight at a time.
pub trait Driver: Send + Sync + 'static {
    /// Cache key for the computation.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The resulting output of the computation.
    type Value: Clone + Send + Sync + 'static;

    /// The error the computation can fail with.
    ///
    /// Failures are first-class outcomes: they are cached and served to later
    /// lookups just like values.
    type Error: std::error::Error + Clone + Send + Sync + 'static;

    /// Computes a fresh value for `key`.
    ///
    /// `cancel` is the cancellation signal of the caller currently owning this
    /// computation. The computation is expected to observe it and return
    /// promptly once it fires; the cache stops polling the future of a
    /// cancelled owner at the next await point, and discards the outcome of
    /// any computation whose owner cancelled before completion.
    fn compute(
        &self,
        key: Self::Key,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Self::Value, Self::Error>>;
}

/// Adapts a plain closure into a [`Driver`].
pub struct FnDriver<K, V, E, F> {
    compute: F,
    _outcome: PhantomData<fn(K) -> Result<V, E>>,
}

impl<K, V, E, F> FnDriver<K, V, E, F>
where
    F: Fn(K, CancellationToken) -> BoxFuture<'static, Result<V, E>>,
{
    /// Creates a driver that computes values by calling `compute`.
    pub fn new(compute: F) -> Self {
        Self {
            compute,
            _outcome: PhantomData,
        }
    }
}

impl<K, V, E, F> Driver for FnDriver<K, V, E, F>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
    F: Fn(K, CancellationToken) -> BoxFuture<'static, Result<V, E>> + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;
    type Error = E;

    fn compute(&self, key: K, cancel: CancellationToken) -> BoxFuture<'static, Result<V, E>> {
        (self.compute)(key, cancel)
    }
}
