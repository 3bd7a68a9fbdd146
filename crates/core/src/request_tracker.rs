use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{EventListeners, Subscription};

#[derive(Debug, Default)]
struct TrackerState {
    active: usize,
    draining: bool,
    drained: bool,
}

/// Admission gate for graceful shutdown.
///
/// Counts in-flight requests without knowing what they are. Once
/// [`start_draining`](Self::start_draining) is called no new request is
/// admitted, and the `drained` event fires exactly once when the count
/// returns to zero.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    draining_listeners: EventListeners<String>,
    drained_listeners: EventListeners<()>,
    drained_tx: watch::Sender<bool>,
}

impl RequestTracker {
    pub fn new() -> Self {
        let (drained_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(TrackerState::default()),
            draining_listeners: EventListeners::new(),
            drained_listeners: EventListeners::new(),
            drained_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits one request unless draining.
    pub fn try_accept(&self) -> bool {
        let mut state = self.state();
        if state.draining {
            debug!(active = state.active, "request rejected while draining");
            return false;
        }
        state.active += 1;
        true
    }

    /// Marks one admitted request as finished.
    pub fn complete(&self) {
        let fire_drained = {
            let mut state = self.state();
            if state.active == 0 {
                warn!("complete() called with no active requests");
            } else {
                state.active -= 1;
            }
            Self::take_drained(&mut state)
        };
        if fire_drained {
            self.emit_drained();
        }
    }

    /// Stops admission. Only the first call has any effect.
    pub fn start_draining<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        let fire_drained = {
            let mut state = self.state();
            if state.draining {
                return;
            }
            state.draining = true;
            info!(reason = %reason, active = state.active, "request tracker draining");
            Self::take_drained(&mut state)
        };

        self.draining_listeners.emit(&reason);
        if fire_drained {
            self.emit_drained();
        }
    }

    fn take_drained(state: &mut TrackerState) -> bool {
        if state.draining && state.active == 0 && !state.drained {
            state.drained = true;
            true
        } else {
            false
        }
    }

    fn emit_drained(&self) {
        info!("request tracker drained");
        self.drained_tx.send_replace(true);
        self.drained_listeners.emit(&());
    }

    pub fn on_draining<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.draining_listeners
            .subscribe(move |reason: &String| listener(reason.as_str()))
    }

    pub fn on_drained<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.drained_listeners.subscribe(move |_| listener())
    }

    pub fn is_draining(&self) -> bool {
        self.state().draining
    }

    pub fn active(&self) -> usize {
        self.state().active
    }

    /// Resolves once draining has started and every admitted request completed.
    pub async fn wait_drained(&self) {
        let mut rx = self.drained_tx.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_tracker() -> (Arc<RequestTracker>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let tracker = Arc::new(RequestTracker::new());
        let draining = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&draining);
        tracker.on_draining(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let d = Arc::clone(&drained);
        tracker.on_drained(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        (tracker, draining, drained)
    }

    #[test]
    fn test_accept_and_complete() {
        let tracker = RequestTracker::new();
        assert!(tracker.try_accept());
        assert!(tracker.try_accept());
        assert_eq!(tracker.active(), 2);

        tracker.complete();
        assert_eq!(tracker.active(), 1);
        assert!(!tracker.is_draining());
    }

    #[test]
    fn test_reject_while_draining() {
        let tracker = RequestTracker::new();
        assert!(tracker.try_accept());
        tracker.start_draining("shutdown");

        assert!(tracker.is_draining());
        assert!(!tracker.try_accept());
        assert_eq!(tracker.active(), 1);
    }

    #[test]
    fn test_start_draining_is_idempotent() {
        let (tracker, draining, drained) = counting_tracker();
        tracker.try_accept();

        tracker.start_draining("first");
        tracker.start_draining("second");

        assert_eq!(draining.load(Ordering::SeqCst), 1);
        assert_eq!(drained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drain_with_no_active_fires_immediately() {
        let (tracker, draining, drained) = counting_tracker();

        tracker.start_draining("idle");

        assert_eq!(draining.load(Ordering::SeqCst), 1);
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        tracker.start_draining("again");
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drained_fires_once_when_active_reaches_zero() {
        let (tracker, _, drained) = counting_tracker();
        for _ in 0..3 {
            assert!(tracker.try_accept());
        }
        // completions before draining never fire drained
        tracker.complete();
        assert_eq!(drained.load(Ordering::SeqCst), 0);

        tracker.start_draining("deploy");
        tracker.complete();
        assert_eq!(drained.load(Ordering::SeqCst), 0);
        tracker.complete();
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        // extra completions do not underflow or re-fire
        tracker.complete();
        assert_eq!(tracker.active(), 0);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_draining_reason_is_passed() {
        let tracker = RequestTracker::new();
        let reason = Arc::new(Mutex::new(String::new()));
        let r = Arc::clone(&reason);
        tracker.on_draining(move |why| *r.lock().unwrap() = why.to_string());

        tracker.start_draining("SIGTERM");
        assert_eq!(*reason.lock().unwrap(), "SIGTERM");
    }

    #[test]
    fn test_unsubscribe_listener() {
        let tracker = RequestTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = tracker.on_drained(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();

        tracker.start_draining("test");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let tracker = Arc::new(RequestTracker::new());
        assert!(tracker.try_accept());
        tracker.start_draining("shutdown");

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.complete();
        let result = tokio::time::timeout(Duration::from_millis(500), waiter).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_drained_after_the_fact() {
        let tracker = RequestTracker::new();
        tracker.start_draining("done");
        let result = tokio::time::timeout(Duration::from_millis(100), tracker.wait_drained()).await;
        assert!(result.is_ok());
    }
}
