//! Helpers shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;

/// Sets up the test environment.
///
/// Initializes a tracing subscriber so that all console output is captured by
/// the test runner.
pub(crate) fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("coalesce=trace")
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TestError {
    #[error("backend unavailable")]
    Unavailable,
}

/// A driver that sleeps for a configurable time and counts its invocations.
///
/// The produced value is the invocation ordinal, so tests can tell a cached
/// outcome from a fresh computation.
pub(crate) struct CountingDriver {
    computations: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl CountingDriver {
    pub(crate) fn new(delay: Duration) -> Self {
        CountingDriver {
            computations: Default::default(),
            delay,
            fail: false,
        }
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.computations)
    }
}

impl Driver for CountingDriver {
    type Key = &'static str;
    type Value = usize;
    type Error = TestError;

    fn compute(
        &self,
        _key: &'static str,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<usize, TestError>> {
        let ordinal = self.computations.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.delay;
        let fail = self.fail;

        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if fail {
                Err(TestError::Unavailable)
            } else {
                Ok(ordinal)
            }
        })
    }
}
