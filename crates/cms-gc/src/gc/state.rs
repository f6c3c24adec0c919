//! Collection request and epoch protocol.
//!
//! The epoch counts completed collections. A request captures the current
//! epoch `E` and targets `E + 1`: if no collection is in flight one is
//! scheduled, otherwise the request merges with the in-flight one. Waiters
//! block until the finished epoch (or the finalized epoch) reaches the target.

use parking_lot::{Condvar, Mutex};

/// Lifecycle of the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No collection requested or running.
    Idle,
    /// A collection was requested; mutators are being stopped.
    MarkingRequested,
    /// Roots were collected and mutators resumed.
    RootSetCollected,
    /// The collector is tracing the heap.
    Marking,
    /// The collector is sweeping the heap.
    Sweeping,
}

/// Outcome of [`GcStateHolder::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    /// Epoch the caller waits for.
    pub epoch: u64,
    /// The pending collection was requested in inline mode and the caller
    /// should try to run it itself.
    pub inline: bool,
}

#[derive(Debug)]
struct State {
    phase: GcPhase,
    collecting: bool,
    epoch: u64,
    finalized_epoch: u64,
    inline: bool,
    // Routing of the pending request, fixed when it was made.
    request_inline: bool,
    shutdown: bool,
}

/// Shared collector state; all transitions wake every waiter.
#[derive(Debug)]
pub struct GcStateHolder {
    state: Mutex<State>,
    changed: Condvar,
}

impl Default for GcStateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl GcStateHolder {
    /// Idle state at epoch zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: GcPhase::Idle,
                collecting: false,
                epoch: 0,
                finalized_epoch: 0,
                inline: false,
                request_inline: false,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Request a collection, merging with a pending or running one.
    pub fn schedule(&self) -> GcRequest {
        let mut state = self.state.lock();
        if state.phase == GcPhase::Idle {
            state.phase = GcPhase::MarkingRequested;
            state.request_inline = state.inline;
            self.changed.notify_all();
        }
        GcRequest {
            epoch: state.epoch + 1,
            inline: state.request_inline && !state.collecting,
        }
    }

    /// Block the collector thread until a collection is requested. Returns
    /// the epoch to collect, or `None` on shutdown.
    ///
    /// Requests made in inline mode are left to their callers.
    pub fn wait_scheduled(&self) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if state.phase == GcPhase::MarkingRequested
                && !state.collecting
                && !state.request_inline
            {
                return Some(state.epoch + 1);
            }
            self.changed.wait(&mut state);
        }
    }

    /// Claim the collection of `epoch`. Fails if it already ran or is running.
    pub fn start(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.collecting
            || state.phase != GcPhase::MarkingRequested
            || state.epoch + 1 != epoch
        {
            return false;
        }
        state.collecting = true;
        true
    }

    /// Give up the claim on `epoch` without collecting it. The request stays
    /// pending so a waiter can run it.
    pub fn abandon(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.collecting && state.epoch + 1 == epoch {
            state.collecting = false;
            self.changed.notify_all();
        }
    }

    /// Advance the phase of the running collection.
    pub fn set_phase(&self, phase: GcPhase) {
        let mut state = self.state.lock();
        state.phase = phase;
        self.changed.notify_all();
    }

    /// Complete the collection of `epoch` and wake its waiters.
    pub fn finish(&self, epoch: u64) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.max(epoch);
        state.phase = GcPhase::Idle;
        state.collecting = false;
        self.changed.notify_all();
    }

    /// The finalizer queue of `epoch` was drained.
    pub fn finalized(&self, epoch: u64) {
        let mut state = self.state.lock();
        state.finalized_epoch = state.finalized_epoch.max(epoch);
        self.changed.notify_all();
    }

    /// Block until `epoch` finished (or shutdown).
    pub fn wait_epoch_finished(&self, epoch: u64) {
        let mut state = self.state.lock();
        while state.epoch < epoch && !state.shutdown {
            self.changed.wait(&mut state);
        }
    }

    /// Like [`wait_epoch_finished`](Self::wait_epoch_finished), but return
    /// early with the pending epoch when an inline request is left unclaimed.
    /// The caller is then expected to collect it.
    pub fn wait_epoch_finished_or_unclaimed(&self, epoch: u64) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.epoch >= epoch || state.shutdown {
                return None;
            }
            if state.phase == GcPhase::MarkingRequested
                && state.request_inline
                && !state.collecting
            {
                return Some(state.epoch + 1);
            }
            self.changed.wait(&mut state);
        }
    }

    /// Block until the finalizers of `epoch` ran (or shutdown).
    pub fn wait_epoch_finalized(&self, epoch: u64) {
        let mut state = self.state.lock();
        while state.finalized_epoch < epoch && !state.shutdown {
            self.changed.wait(&mut state);
        }
    }

    /// Route new requests to their callers (`true`) or to the collector
    /// thread. A pending request keeps its routing.
    pub fn set_inline(&self, inline: bool) {
        let mut state = self.state.lock();
        state.inline = inline;
        self.changed.notify_all();
    }

    /// Whether requests are collected inline by their callers.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.state.lock().inline
    }

    /// Stop the collector thread and release every waiter.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.changed.notify_all();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Number of completed collections.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Latest epoch whose finalizers ran.
    #[must_use]
    pub fn finalized_epoch(&self) -> u64 {
        self.state.lock().finalized_epoch
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.state.lock().phase
    }
}

#[cfg(test)]
mod tests {
    use super::{GcPhase, GcRequest, GcStateHolder};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_schedule_targets_next_epoch() {
        let state = GcStateHolder::new();
        assert_eq!(state.phase(), GcPhase::Idle);
        assert_eq!(state.schedule().epoch, 1);
        assert_eq!(state.phase(), GcPhase::MarkingRequested);
        assert_eq!(state.schedule().epoch, 1);
    }

    #[test]
    fn test_requests_merge_with_running_collection() {
        let state = GcStateHolder::new();
        let epoch = state.schedule().epoch;
        assert!(state.start(epoch));
        assert!(!state.start(epoch));
        state.set_phase(GcPhase::Sweeping);
        assert_eq!(state.schedule().epoch, epoch);
        assert_eq!(state.phase(), GcPhase::Sweeping);
        state.finish(epoch);
        assert_eq!(state.epoch(), 1);
        assert_eq!(state.phase(), GcPhase::Idle);
        assert_eq!(state.schedule().epoch, 2);
    }

    #[test]
    fn test_start_rejects_stale_epoch() {
        let state = GcStateHolder::new();
        let epoch = state.schedule().epoch;
        assert!(state.start(epoch));
        state.finish(epoch);
        assert!(!state.start(epoch));
        state.schedule();
        assert!(!state.start(epoch));
        assert!(state.start(epoch + 1));
    }

    #[test]
    fn test_wait_scheduled_returns_target() {
        let state = Arc::new(GcStateHolder::new());
        let collector = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_scheduled())
        };
        let request = state.schedule();
        assert!(!request.inline);
        assert_eq!(collector.join().unwrap(), Some(request.epoch));
    }

    #[test]
    fn test_wait_scheduled_ignores_inline_requests() {
        let state = GcStateHolder::new();
        state.set_inline(true);
        assert_eq!(state.schedule(), GcRequest { epoch: 1, inline: true });
        state.shutdown();
        assert_eq!(state.wait_scheduled(), None);
    }

    #[test]
    fn test_pending_request_keeps_its_routing() {
        let state = GcStateHolder::new();
        assert!(!state.schedule().inline);
        state.set_inline(true);
        // Merged into the dedicated request made before the switch.
        assert!(!state.schedule().inline);
        assert_eq!(state.wait_scheduled(), Some(1));
        assert!(state.start(1));
        state.finish(1);
        assert!(state.schedule().inline);
    }

    #[test]
    fn test_running_collection_is_not_inline() {
        let state = GcStateHolder::new();
        state.set_inline(true);
        let request = state.schedule();
        assert!(state.start(request.epoch));
        assert!(!state.schedule().inline);
    }

    #[test]
    fn test_waiters_wake_on_finish_and_finalized() {
        let state = Arc::new(GcStateHolder::new());
        let epoch = state.schedule().epoch;
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.wait_epoch_finished(epoch);
                let finished = state.epoch();
                state.wait_epoch_finalized(epoch);
                (finished, state.finalized_epoch())
            })
        };
        assert!(state.start(epoch));
        state.finish(epoch);
        state.finalized(epoch);
        assert_eq!(waiter.join().unwrap(), (1, 1));
    }

    #[test]
    fn test_abandoned_claim_keeps_request_pending() {
        let state = GcStateHolder::new();
        let epoch = state.schedule().epoch;
        assert!(state.start(epoch));
        state.abandon(epoch);
        assert_eq!(state.phase(), GcPhase::MarkingRequested);
        assert_eq!(state.epoch(), 0);
        assert!(state.start(epoch));
        // A stale epoch never releases the running claim.
        state.abandon(epoch + 1);
        assert!(!state.start(epoch));
    }

    #[test]
    fn test_waiter_is_handed_unclaimed_inline_request() {
        let state = GcStateHolder::new();
        state.set_inline(true);
        let epoch = state.schedule().epoch;
        assert_eq!(state.wait_epoch_finished_or_unclaimed(epoch), Some(epoch));

        let state = Arc::new(state);
        assert!(state.start(epoch));
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_epoch_finished_or_unclaimed(epoch))
        };
        state.finish(epoch);
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_dedicated_request_is_not_handed_to_waiters() {
        let state = Arc::new(GcStateHolder::new());
        let epoch = state.schedule().epoch;
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_epoch_finished_or_unclaimed(epoch))
        };
        assert_eq!(state.wait_scheduled(), Some(epoch));
        assert!(state.start(epoch));
        state.finish(epoch);
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let state = Arc::new(GcStateHolder::new());
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_epoch_finished(10))
        };
        state.shutdown();
        waiter.join().unwrap();
        assert!(state.is_shutdown());
    }
}
