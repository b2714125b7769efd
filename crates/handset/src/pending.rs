//! Tracking of in-flight asynchronous bus calls
//!
//! Every outbound call gets one record here, created before the reply
//! future is spawned. The reply path is responsible for removing its own
//! record with [`PendingCalls::complete`] — that's a contract, not
//! automatic. Backend teardown walks the list and aborts whatever is still
//! outstanding, which guarantees a stale reply callback never fires after
//! the backend is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{AbortHandle, AbortRegistration};
use tracing::debug;

#[derive(Debug)]
struct PendingCall {
    id: u64,
    method: &'static str,
    abort: AbortHandle,
}

/// Ordered ledger of outstanding calls
///
/// Length always equals calls sent minus calls completed or drained.
#[derive(Debug, Default)]
pub struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<Vec<PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding call
    ///
    /// Wrap the reply future in `futures::future::Abortable` with the
    /// returned registration, and call [`complete`](Self::complete) with the
    /// id once the reply has been handled.
    pub fn track(&self, method: &'static str) -> (u64, AbortRegistration) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort, registration) = AbortHandle::new_pair();
        self.calls
            .lock()
            .expect("pending-call ledger poisoned")
            .push(PendingCall { id, method, abort });
        (id, registration)
    }

    /// Remove one record; returns false if it was already gone
    pub fn complete(&self, id: u64) -> bool {
        let mut calls = self.calls.lock().expect("pending-call ledger poisoned");
        match calls.iter().position(|c| c.id == id) {
            Some(pos) => {
                let call = calls.remove(pos);
                debug!(id = call.id, method = call.method, "pending call completed");
                true
            }
            None => false,
        }
    }

    /// Abort and remove every outstanding call; returns how many there were
    ///
    /// After this returns, no tracked reply callback will run.
    pub fn drain(&self) -> usize {
        let calls = std::mem::take(
            &mut *self.calls.lock().expect("pending-call ledger poisoned"),
        );
        let n = calls.len();
        for call in calls {
            debug!(id = call.id, method = call.method, "aborting pending call");
            call.abort.abort();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.calls.lock().expect("pending-call ledger poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{Abortable, Aborted};

    #[test]
    fn ledger_length_tracks_sends_and_completions() {
        let pending = PendingCalls::new();
        let (a, _ra) = pending.track("Register");
        let (b, _rb) = pending.track("GetCards");
        assert_eq!(pending.len(), 2);

        assert!(pending.complete(a));
        assert_eq!(pending.len(), 1);
        assert!(pending.complete(b));
        assert!(pending.is_empty());
    }

    #[test]
    fn complete_is_exactly_once() {
        let pending = PendingCalls::new();
        let (id, _reg) = pending.track("Register");
        assert!(pending.complete(id));
        assert!(!pending.complete(id));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn drain_aborts_outstanding_futures() {
        let pending = PendingCalls::new();
        let (_id, registration) = pending.track("Register");

        // A reply that would never arrive
        let call = Abortable::new(futures::future::pending::<()>(), registration);
        let drained = pending.drain();
        assert_eq!(drained, 1);
        assert!(pending.is_empty());

        // The stale callback never fires: the future resolves as aborted
        assert_eq!(call.await, Err(Aborted));
    }

    #[tokio::test]
    async fn completed_call_is_not_aborted() {
        let pending = PendingCalls::new();
        let (id, registration) = pending.track("Register");

        let call = Abortable::new(async { 42 }, registration);
        assert!(pending.complete(id));
        assert_eq!(pending.drain(), 0);
        assert_eq!(call.await, Ok(42));
    }
}
