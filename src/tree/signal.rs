// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node signals and subscription handles.
//!
//! Handlers run synchronously in the thread that mutated the node. The
//! handler list is cloned before dispatch, so handlers may connect or
//! disconnect (on any signal) without deadlocking.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Slots<A: ?Sized> {
    next_id: u64,
    handlers: Vec<(u64, Handler<A>)>,
}

/// A multicast event source.
pub(crate) struct Signal<A: ?Sized> {
    slots: Arc<Mutex<Slots<A>>>,
}

impl<A: ?Sized + 'static> Signal<A> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub(crate) fn connect(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak = Arc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(slots) = weak.upgrade() {
                slots.lock().handlers.retain(|(h, _)| *h != id);
            }
        })
    }

    pub(crate) fn fire(&self, arg: &A) {
        let handlers: Vec<Handler<A>> = self
            .slots
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(arg);
        }
    }

    pub(crate) fn disconnect_all(&self) {
        self.slots.lock().handlers.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().handlers.len()
    }
}

/// Handle to a connected listener. Dropping it disconnects the listener.
#[must_use = "dropping a Subscription disconnects it"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Disconnect now. Equivalent to dropping the handle.
    pub fn disconnect(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.release.is_some())
            .finish()
    }
}

/// A disposable bundle of subscriptions released as a unit.
///
/// After [`SubscriptionGroup::release`], newly acquired subscriptions are
/// disconnected immediately.
#[derive(Default)]
pub struct SubscriptionGroup {
    subscriptions: Mutex<Vec<Subscription>>,
    released: AtomicBool,
}

impl SubscriptionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, subscription: Subscription) {
        if self.released.load(Ordering::Acquire) {
            drop(subscription);
            return;
        }
        self.subscriptions.lock().push(subscription);
    }

    /// Disconnect every held subscription. Returns how many were released;
    /// later calls return 0.
    pub fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let held = std::mem::take(&mut *self.subscriptions.lock());
        let count = held.len();
        drop(held);
        count
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriptionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGroup")
            .field("held", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}
