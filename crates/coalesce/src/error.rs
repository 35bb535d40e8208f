use thiserror::Error;

/// The error returned from
/// [`ComputationCache::get`](crate::ComputationCache::get).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError<E> {
    /// The caller's own cancellation signal fired before the result arrived.
    ///
    /// This outcome is local to the cancelling caller. It is never cached and
    /// never delivered to other waiters of the same key.
    #[error("request cancelled")]
    Cancelled,

    /// The cache was closed before this request was accepted.
    #[error("cache closed")]
    Closed,

    /// The computation itself failed.
    ///
    /// Computation failures are cached: later lookups of the same key are
    /// served the identical error without re-running the computation.
    #[error(transparent)]
    Computation(E),
}
