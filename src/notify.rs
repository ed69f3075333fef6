//! Minimal observer lists for control-thread notifications.
//!
//! Handlers are called outside the list lock, so a handler may subscribe,
//! unsubscribe, or trigger further notifications without deadlocking.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

/// A list of handlers interested in values of type `T`.
pub struct Notifier<T> {
    inner: Arc<Inner<T>>,
}

impl<T: 'static> Notifier<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `handler`; it stays registered until the returned [`Observer`] is dropped.
    #[must_use = "dropping the observer unsubscribes immediately"]
    pub fn observe<F>(&self, handler: F) -> Observer
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Observer {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.inner.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }
}

impl<T: 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription token. Unsubscribes on drop.
pub struct Observer {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Observer {
    /// Unsubscribe now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for Observer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Observer").field("active", &self.cancel.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn dropping_observer_unsubscribes() {
        let notifier = Notifier::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let observer = notifier.observe(move |v| {
            h.fetch_add(*v as usize, Ordering::Relaxed);
        });
        notifier.notify(&2);
        assert_eq!(notifier.observer_count(), 1);

        drop(observer);
        notifier.notify(&5);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(notifier.observer_count(), 0);
    }

    #[test]
    fn handler_may_subscribe_during_notify() {
        let notifier = Arc::new(Notifier::<()>::new());
        let held = Arc::new(Mutex::new(Vec::new()));

        let n = notifier.clone();
        let held2 = held.clone();
        let _outer = notifier.observe(move |_| {
            held2.lock().push(n.observe(|_| {}));
        });
        notifier.notify(&());
        assert_eq!(notifier.observer_count(), 2);
    }
}
