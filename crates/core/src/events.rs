use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerSet<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Ordered set of callbacks for one event type.
///
/// Listeners run synchronously on the emitting task, in subscription order.
/// A listener may subscribe or unsubscribe from inside its own callback since
/// emission iterates over a snapshot.
pub struct EventListeners<E> {
    inner: Arc<Mutex<ListenerSet<E>>>,
}

impl<E: 'static> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers `listener`; the returned handle removes exactly this listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut set = lock(&self.inner);
            let id = set.next_id;
            set.next_id += 1;
            set.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<ListenerSet<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<E>(inner: &Mutex<ListenerSet<E>>) -> MutexGuard<'_, ListenerSet<E>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`EventListeners::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_in_subscription_order() {
        let listeners: EventListeners<u32> = EventListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        listeners.subscribe(move |v| s1.lock().unwrap().push(("first", *v)));
        let s2 = Arc::clone(&seen);
        listeners.subscribe(move |v| s2.lock().unwrap().push(("second", *v)));

        listeners.emit(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_listener() {
        let listeners: EventListeners<()> = EventListeners::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = Arc::clone(&a);
        let sub_a = listeners.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let b2 = Arc::clone(&b);
        let _sub_b = listeners.subscribe(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        sub_a.unsubscribe();
        listeners.emit(&());

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_dropping_handle_keeps_listener() {
        let listeners: EventListeners<()> = EventListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        drop(listeners.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let listeners: EventListeners<()> = EventListeners::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        sub.unsubscribe();
    }
}
