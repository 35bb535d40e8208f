use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;

/// One finalized computation outcome, cloned out verbatim to every waiter.
pub(crate) type Outcome<D> = Result<<D as Driver>::Value, <D as Driver>::Error>;

/// Everything the coordinator processes, caller requests and computation
/// reports alike, so that all entry-map mutation happens on one sequential
/// stream.
pub(crate) enum Message<D: Driver> {
    /// A caller wants the value for a key.
    Request(PendingRequest<D>),
    /// A computation finished while its owner was still interested.
    Finished {
        key: D::Key,
        generation: u64,
        outcome: Outcome<D>,
    },
    /// A computation's owner cancelled; its outcome (if any) was discarded.
    Abandoned { key: D::Key, generation: u64 },
    /// Stop accepting new requests.
    Close,
}

/// One caller's interest in a key.
pub(crate) struct PendingRequest<D: Driver> {
    pub key: D::Key,
    pub responder: oneshot::Sender<Outcome<D>>,
    pub cancel: CancellationToken,
}

struct Waiter<D: Driver> {
    responder: oneshot::Sender<Outcome<D>>,
    cancel: CancellationToken,
}

enum Entry<D: Driver> {
    /// A computation is in flight; waiters attach here until it resolves.
    Pending(PendingEntry<D>),
    /// The finalized outcome, immutable from here on.
    Ready(Outcome<D>),
}

struct PendingEntry<D: Driver> {
    /// Identifies the live computation for this key. Reports carrying an
    /// older generation come from superseded computations and are inert.
    generation: u64,
    /// All attached callers, the owner included. The owner is the caller
    /// whose cancellation token drives the running computation.
    waiters: Vec<Waiter<D>>,
}

/// The single arbiter owning the key→entry map.
///
/// All lookups, waiter attachment, finalization, successor election and
/// eviction go through [`run`](Self::run), one message at a time.
pub(crate) struct Coordinator<D: Driver> {
    driver: Arc<D>,
    entries: HashMap<D::Key, Entry<D>>,
    /// Used by spawned computations to report back. Weak, so the message
    /// channel closes once all cache handles and computations are gone.
    report: mpsc::WeakUnboundedSender<Message<D>>,
    accepting: bool,
}

impl<D: Driver> Coordinator<D> {
    pub(crate) fn new(driver: D, report: mpsc::WeakUnboundedSender<Message<D>>) -> Self {
        Coordinator {
            driver: Arc::new(driver),
            entries: HashMap::new(),
            report,
            accepting: true,
        }
    }

    /// Processes messages until every cache handle and computation task is
    /// gone.
    ///
    /// Handling a message never waits on a computation; registering a waiter
    /// returns immediately.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message<D>>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Request(request) => self.handle_request(request),
                Message::Finished {
                    key,
                    generation,
                    outcome,
                } => self.handle_finished(key, generation, outcome),
                Message::Abandoned { key, generation } => self.handle_abandoned(key, generation),
                Message::Close => {
                    tracing::debug!("cache closed, rejecting new requests");
                    self.accepting = false;
                }
            }
        }
    }

    fn handle_request(&mut self, request: PendingRequest<D>) {
        if !self.accepting {
            // Dropping the responder makes the caller observe `Closed`.
            return;
        }
        let PendingRequest {
            key,
            responder,
            cancel,
        } = request;
        match self.entries.get_mut(&key) {
            None => {
                tracing::debug!(?key, "starting computation");
                let generation = 0;
                self.spawn_computation(key.clone(), generation, cancel.clone());
                let waiters = vec![Waiter { responder, cancel }];
                self.entries
                    .insert(key, Entry::Pending(PendingEntry { generation, waiters }));
            }
            Some(Entry::Pending(pending)) => {
                tracing::trace!(?key, "attaching waiter to computation in flight");
                pending.waiters.push(Waiter { responder, cancel });
            }
            Some(Entry::Ready(outcome)) => {
                tracing::trace!(?key, "cache hit");
                responder.send(outcome.clone()).ok();
            }
        }
    }

    fn handle_finished(&mut self, key: D::Key, generation: u64, outcome: Outcome<D>) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        let live = matches!(entry, Entry::Pending(pending) if pending.generation == generation);
        if !live {
            // A superseded computation finished late. Its owner had already
            // been replaced, so the outcome must not reach the cache. Each
            // computation sends exactly one report and the generation only
            // advances while handling that report, so this arm currently has
            // no reachable producer; it pins down the invariant rather than
            // a known race.
            tracing::trace!(?key, "discarding stale computation report");
            return;
        }
        let Entry::Pending(pending) = mem::replace(entry, Entry::Ready(outcome.clone())) else {
            unreachable!("liveness checked above");
        };
        tracing::debug!(
            ?key,
            waiters = pending.waiters.len(),
            "computation finished, broadcasting outcome"
        );
        for waiter in pending.waiters {
            // Cancelled callers stopped listening; delivery to them fails and
            // that is fine.
            waiter.responder.send(outcome.clone()).ok();
        }
    }

    fn handle_abandoned(&mut self, key: D::Key, generation: u64) {
        let restart = {
            let Some(Entry::Pending(pending)) = self.entries.get_mut(&key) else {
                return;
            };
            if pending.generation != generation {
                return;
            }
            // Callers that cancelled or went away are no longer eligible.
            pending
                .waiters
                .retain(|waiter| !waiter.cancel.is_cancelled() && !waiter.responder.is_closed());
            match pending.waiters.first() {
                Some(successor) => {
                    pending.generation += 1;
                    Some((pending.generation, successor.cancel.clone()))
                }
                None => None,
            }
        };
        match restart {
            Some((generation, cancel)) => {
                // Exactly one survivor inherits the computation; everyone
                // else stays attached as a plain waiter.
                tracing::debug!(?key, generation, "owner cancelled, restarting for a waiter");
                self.spawn_computation(key, generation, cancel);
            }
            None => {
                tracing::debug!(?key, "all callers cancelled, evicting entry");
                self.entries.remove(&key);
            }
        }
    }

    /// Eagerly spawns the computation for `key`, driven by the owning
    /// caller's cancellation token.
    fn spawn_computation(&self, key: D::Key, generation: u64, cancel: CancellationToken) {
        let Some(report) = self.report.upgrade() else {
            // Every handle and computation is gone, so no caller can be
            // waiting on this spawn either.
            return;
        };
        let computation = self.driver.compute(key.clone(), cancel.clone());
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = computation => {
                    // A completion racing with the owner's cancellation
                    // counts as cancelled: the work may have been torn down
                    // partway and its output cannot be trusted.
                    (!cancel.is_cancelled()).then_some(outcome)
                }
                _ = cancel.cancelled() => None,
            };
            let message = match outcome {
                Some(outcome) => Message::Finished {
                    key,
                    generation,
                    outcome,
                },
                None => Message::Abandoned { key, generation },
            };
            report.send(message).ok();
        });
    }
}
