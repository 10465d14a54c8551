use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use super::models::SyncStatus;

pub type StatusListener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

type Registry = Mutex<HashMap<u64, StatusListener>>;

/// Broadcasts status snapshots to registered observers. Listeners run
/// synchronously after every state transition; a panicking listener is caught
/// and logged without aborting notification of the rest.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    listeners: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and returns its disposer. The listener is
    /// removed when the [`Subscription`] is cancelled or dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("status listener registry poisoned")
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .expect("status listener registry poisoned")
            .len()
    }

    /// Invokes listeners against a snapshot taken outside the registry lock,
    /// so a callback may subscribe or cancel (including its own subscription)
    /// without deadlocking. A listener removed mid-notification may still see
    /// this one snapshot.
    pub fn notify(&self, status: &SyncStatus) {
        let listeners: Vec<(u64, StatusListener)> = {
            let guard = self
                .listeners
                .lock()
                .expect("status listener registry poisoned");
            guard
                .iter()
                .map(|(id, listener)| (*id, Arc::clone(listener)))
                .collect()
        };
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                warn!(listener_id = id, "sync status listener panicked");
            }
        }
    }
}

/// Disposer for a registered status listener.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut guard) = registry.lock() {
                guard.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn status() -> SyncStatus {
        SyncStatus {
            is_online: true,
            is_syncing: false,
            last_sync: None,
            pending_items: 0,
            sync_errors: Vec::new(),
        }
    }

    #[test]
    fn test_subscription_drop_unregisters() {
        let notifier = StatusNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let sub = notifier.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(notifier.listener_count(), 1);

        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sub.cancel();
        assert_eq!(notifier.listener_count(), 0);
        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_poison_the_rest() {
        let notifier = StatusNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _panicky = notifier.subscribe(|_| panic!("listener bug"));
        let calls_clone = Arc::clone(&calls);
        let _ok = notifier.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_cancel_its_own_subscription_during_notify() {
        let notifier = StatusNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let calls_clone = Arc::clone(&calls);
        let slot_clone = Arc::clone(&slot);
        let sub = notifier.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            // Dropping the Subscription here re-enters the registry.
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);

        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_subscribe_another_during_notify() {
        let notifier = StatusNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_notifier = notifier.clone();
        let calls_clone = Arc::clone(&calls);
        let late: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let late_clone = Arc::clone(&late);
        let _sub = notifier.subscribe(move |_| {
            let calls_inner = Arc::clone(&calls_clone);
            let sub = inner_notifier.subscribe(move |_| {
                calls_inner.fetch_add(1, Ordering::SeqCst);
            });
            *late_clone.lock().unwrap() = Some(sub);
        });

        notifier.notify(&status());
        assert_eq!(notifier.listener_count(), 2);

        notifier.notify(&status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
