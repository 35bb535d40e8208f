//! A concurrent, cancellable, single-flight memoizing cache.
//!
//! For any key, at most one computation is ever in flight: concurrent callers
//! looking up the same key share one computation and all receive the identical
//! outcome. Every caller carries its own [`CancellationToken`] and can
//! withdraw at any time without disturbing the other waiters.
//!
//! The caller whose token drives the running computation is its *owner*. If
//! the owner cancels, the computation's outcome is discarded and exactly one
//! surviving waiter is promoted to owner, restarting the computation with its
//! token. If every waiter has cancelled, the entry is evicted and a later
//! lookup starts fresh.
//!
//! Outcomes are cached for the lifetime of the [`ComputationCache`] instance,
//! computation errors included. Cancellations never are.
//!
//! Cancellation is cooperative: a [`Driver`] is expected to observe its token
//! and return promptly once it fires. The cache additionally stops polling the
//! computation future of a cancelled owner, but it cannot bound the
//! cancellation latency of code that never yields.

#![warn(missing_docs)]

mod cache;
mod coordinator;
mod driver;
mod error;

#[cfg(test)]
mod test;

pub use cache::ComputationCache;
pub use driver::{Driver, FnDriver};
pub use error::GetError;

pub use tokio_util::sync::CancellationToken;
