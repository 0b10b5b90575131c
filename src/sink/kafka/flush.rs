use std::sync::Mutex;

use rdkafka::error::KafkaError;
use tokio::sync::oneshot;

/// Shared state between the emitting side of the Kafka sink and the
/// producer's delivery callbacks: an in-flight counter, an at-most-one
/// sticky error, and an optional one-shot flush signal.
///
/// Critical sections are strictly non-blocking; no I/O ever happens under
/// the lock.
#[derive(Debug, Default)]
pub(crate) struct FlushTracker {
    inner: Mutex<FlushState>,
}

#[derive(Debug, Default)]
struct FlushState {
    inflight: u64,
    /// First delivery error since the last flush consumed one.
    flush_err: Option<KafkaError>,
    /// Fired exactly once when `inflight` reaches zero, then cleared.
    signal: Option<oneshot::Sender<()>>,
}

/// Outcome of starting a flush.
pub(crate) enum FlushCheck {
    /// Nothing in flight and no latched error.
    Idle,
    /// A latched error, consumed by this check.
    Failed(KafkaError),
    /// Messages in flight; await the receiver, then re-check the sticky
    /// error with [`FlushTracker::take_error`].
    Pending(oneshot::Receiver<()>),
}

impl FlushTracker {
    /// Record a message about to be handed to the producer.
    pub fn submitted(&self) -> u64 {
        let mut state = self.inner.lock().expect("flush tracker mutex poisoned");
        state.inflight += 1;
        state.inflight
    }

    /// Roll back a `submitted` call whose hand-off to the producer failed
    /// synchronously (the delivery callback will never fire for it).
    pub fn abandoned(&self) -> u64 {
        let mut state = self.inner.lock().expect("flush tracker mutex poisoned");
        state.inflight = state.inflight.saturating_sub(1);
        Self::maybe_signal(&mut state);
        state.inflight
    }

    /// Delivery callback path: one message left flight, successfully or not.
    pub fn completed(&self, result: Result<(), KafkaError>) -> u64 {
        let mut state = self.inner.lock().expect("flush tracker mutex poisoned");
        state.inflight = state.inflight.saturating_sub(1);
        if let Err(err) = result {
            if state.flush_err.is_none() {
                state.flush_err = Some(err);
            }
        }
        Self::maybe_signal(&mut state);
        state.inflight
    }

    /// Begin a flush: consume the sticky error if one is latched, otherwise
    /// install a fresh one-shot signal when messages are still in flight.
    pub fn begin_flush(&self) -> FlushCheck {
        let mut state = self.inner.lock().expect("flush tracker mutex poisoned");
        if let Some(err) = state.flush_err.take() {
            return FlushCheck::Failed(err);
        }
        if state.inflight == 0 {
            return FlushCheck::Idle;
        }
        let (tx, rx) = oneshot::channel();
        // A previous flush may have been cancelled mid-wait; its stale
        // sender is simply replaced.
        state.signal = Some(tx);
        FlushCheck::Pending(rx)
    }

    /// Consume the sticky error, if any.
    pub fn take_error(&self) -> Option<KafkaError> {
        self.inner
            .lock()
            .expect("flush tracker mutex poisoned")
            .flush_err
            .take()
    }

    /// Non-consuming view of the sticky error, used to fail fast on emit.
    pub fn latched_error(&self) -> Option<KafkaError> {
        self.inner
            .lock()
            .expect("flush tracker mutex poisoned")
            .flush_err
            .clone()
    }

    pub fn inflight(&self) -> u64 {
        self.inner
            .lock()
            .expect("flush tracker mutex poisoned")
            .inflight
    }

    fn maybe_signal(state: &mut FlushState) {
        if state.inflight == 0 {
            if let Some(tx) = state.signal.take() {
                // The waiter may have been cancelled; a dead receiver is fine.
                let _ = tx.send(());
            }
        }
    }
}
