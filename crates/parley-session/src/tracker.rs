use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct TrackerState {
    in_flight: usize,
    /// Bumped by every bulk cancel so guards from before it stop counting.
    epoch: u64,
    root: CancellationToken,
}

/// Counts outstanding requests and drives the loading flag.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    loading: watch::Sender<bool>,
}

impl RequestTracker {
    pub fn new() -> Self {
        let (loading, _) = watch::channel(false);
        Self {
            state: Mutex::new(TrackerState {
                in_flight: 0,
                epoch: 0,
                root: CancellationToken::new(),
            }),
            loading,
        }
    }

    /// Register one outstanding request. The count drops when the guard does.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight += 1;
        if state.in_flight == 1 {
            self.loading.send_replace(true);
        }
        RequestGuard {
            tracker: Arc::clone(self),
            epoch: state.epoch,
            token: state.root.child_token(),
        }
    }

    /// Cancel everything outstanding and reset to the idle baseline.
    /// Safe to call with nothing pending.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut state.root, CancellationToken::new());
        old.cancel();
        state.epoch += 1;
        state.in_flight = 0;
        self.loading.send_replace(false);
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).in_flight
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    fn finish(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch || state.in_flight == 0 {
            return;
        }
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.loading.send_replace(false);
        }
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RequestGuard {
    tracker: Arc<RequestTracker>,
    epoch: u64,
    token: CancellationToken,
}

impl RequestGuard {
    /// Fires on bulk cancel.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_follows_counter() {
        let tracker = Arc::new(RequestTracker::new());
        let loading = tracker.subscribe();
        assert!(!*loading.borrow());

        let a = tracker.begin();
        let b = tracker.begin();
        assert!(*loading.borrow());
        assert_eq!(tracker.in_flight(), 2);

        drop(a);
        assert!(*loading.borrow());
        drop(b);
        assert!(!*loading.borrow());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn cancel_all_resets_and_orphans_old_guards() {
        let tracker = Arc::new(RequestTracker::new());
        let old = tracker.begin();
        let old_token = old.token().clone();

        tracker.cancel_all();
        tracker.cancel_all();
        assert!(old_token.is_cancelled());
        assert_eq!(tracker.in_flight(), 0);
        assert!(!tracker.is_loading());

        let fresh = tracker.begin();
        assert!(!fresh.token().is_cancelled());
        assert_eq!(tracker.in_flight(), 1);

        // A guard from the cancelled epoch must not steal the new request's count.
        drop(old);
        assert_eq!(tracker.in_flight(), 1);
        assert!(tracker.is_loading());

        drop(fresh);
        assert_eq!(tracker.in_flight(), 0);
        assert!(!tracker.is_loading());
    }
}
