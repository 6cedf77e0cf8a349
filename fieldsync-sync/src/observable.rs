//! Status broadcast shared by the write queue and the site pack bootstrap.
//!
//! A listener receives the current state as soon as it subscribes, then every
//! subsequent change. Listeners are invoked outside the internal lock, so a
//! listener may read `current()` or unsubscribe without deadlocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Handle returned by every subscribe call. Calling [`Unsubscribe::unsubscribe`]
/// detaches the listener; dropping the handle leaves it attached.
pub struct Unsubscribe {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle that detaches nothing.
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct Inner<S> {
    current: S,
    next_id: u64,
    listeners: BTreeMap<u64, Listener<S>>,
}

/// Holds the latest `S` and fans changes out to listeners.
pub struct StatusBroadcaster<S> {
    inner: Arc<Mutex<Inner<S>>>,
}

impl<S> StatusBroadcaster<S>
where
    S: Clone + PartialEq + Send + 'static,
{
    pub fn new(initial: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: initial,
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn current(&self) -> S {
        lock(&self.inner).current.clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Register `listener` and replay the current state to it.
    pub fn subscribe(&self, listener: impl Fn(&S) + Send + Sync + 'static) -> Unsubscribe {
        let listener: Listener<S> = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.insert(id, Arc::clone(&listener));
            (id, inner.current.clone())
        };
        listener(&snapshot);

        let weak: Weak<Mutex<Inner<S>>> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).listeners.remove(&id);
            }
        })
    }

    /// Replace the state and notify if it changed.
    pub fn publish(&self, state: S) {
        self.update(|current| *current = state);
    }

    /// Mutate the state in place; listeners are notified only when the result
    /// differs from the previous state. Returns the new state.
    pub fn update(&self, apply: impl FnOnce(&mut S)) -> S {
        let (state, listeners) = {
            let mut inner = lock(&self.inner);
            let before = inner.current.clone();
            apply(&mut inner.current);
            if inner.current == before {
                return before;
            }
            let listeners: Vec<Listener<S>> = inner.listeners.values().cloned().collect();
            (inner.current.clone(), listeners)
        };
        for listener in listeners {
            listener(&state);
        }
        state
    }
}

impl<S> fmt::Debug for StatusBroadcaster<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBroadcaster").finish_non_exhaustive()
    }
}

fn lock<S>(inner: &Mutex<Inner<S>>) -> MutexGuard<'_, Inner<S>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &u32| sink.lock().unwrap().push(*value))
    }

    #[test]
    fn subscribe_replays_current_state() {
        let broadcaster = StatusBroadcaster::new(7u32);
        let (seen, listener) = recorder();
        let _handle = broadcaster.subscribe(listener);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn publish_reaches_every_listener() {
        let broadcaster = StatusBroadcaster::new(0u32);
        let (first, a) = recorder();
        let (second, b) = recorder();
        let _ha = broadcaster.subscribe(a);
        let _hb = broadcaster.subscribe(b);

        broadcaster.publish(3);

        assert_eq!(*first.lock().unwrap(), vec![0, 3]);
        assert_eq!(*second.lock().unwrap(), vec![0, 3]);
    }

    #[test]
    fn unchanged_state_is_not_rebroadcast() {
        let broadcaster = StatusBroadcaster::new(1u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _handle = broadcaster.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(1);
        broadcaster.update(|_| {});

        assert_eq!(calls.load(Ordering::SeqCst), 1, "only the replay");
    }

    #[test]
    fn unsubscribe_detaches_listener() {
        let broadcaster = StatusBroadcaster::new(0u32);
        let (seen, listener) = recorder();
        let handle = broadcaster.subscribe(listener);
        assert_eq!(broadcaster.listener_count(), 1);

        handle.unsubscribe();
        broadcaster.publish(9);

        assert_eq!(broadcaster.listener_count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn unsubscribe_after_broadcaster_dropped_is_harmless() {
        let broadcaster = StatusBroadcaster::new(0u32);
        let handle = broadcaster.subscribe(|_| {});
        drop(broadcaster);
        handle.unsubscribe();
    }

    #[test]
    fn update_returns_new_state() {
        let broadcaster = StatusBroadcaster::new(2u32);
        let next = broadcaster.update(|v| *v *= 5);
        assert_eq!(next, 10);
        assert_eq!(broadcaster.current(), 10);
    }
}
