//! Listener registration for "state changed" notifications.
//!
//! Stores and synchronizers hold a [`Listeners`] table and call
//! [`Listeners::notify`] after every successful mutation. Registering a
//! listener returns a [`Subscription`]; dropping it unregisters the listener.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Callback invoked with the new state.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A set of listeners notified synchronously, in registration order.
pub struct Listeners<T> {
    table: Arc<Mutex<ListenerTable<T>>>,
}

impl<T> Listeners<T> {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    fn lock(table: &Mutex<ListenerTable<T>>) -> MutexGuard<'_, ListenerTable<T>> {
        // A panicking listener must not disable notifications for everyone else.
        table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let id = {
            let mut table = Self::lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<ListenerTable<T>>> = Arc::downgrade(&self.table);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    Self::lock(&table).listeners.remove(&id);
                }
            })),
        }
    }

    /// Invoke every registered listener with `value`.
    ///
    /// The table lock is released before listeners run, so a listener may
    /// subscribe or unsubscribe without deadlocking.
    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = Self::lock(&self.table)
            .listeners
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        Self::lock(&self.table).listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

/// Handle returned by [`Listeners::subscribe`].
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the listener set.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_reaches_listener() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let _sub = listeners.subscribe(move |value| {
            seen_clone.fetch_add(*value as usize, Ordering::SeqCst);
        });

        listeners.notify(&3);
        listeners.notify(&4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let sub = listeners.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 1);

        drop(sub);
        listeners.notify(&1);
        assert!(listeners.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_unsubscribe_and_detach() {
        let listeners = Listeners::<()>::new();

        let first = listeners.subscribe(|_| {});
        let second = listeners.subscribe(|_| {});
        assert_eq!(listeners.len(), 2);

        first.unsubscribe();
        second.detach();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_listeners() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        drop(sub);
    }
}
