// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared lifecycle contract for binders and readers.
//!
//! Every structure (named or keyed, binder or reader) carries a
//! [`StructureBase`]: its depth budget, callback registries, a non-owning
//! link to its parent structure, the destroyed flag, and the dispatcher
//! used to run callbacks.
//!
//! # Change propagation
//!
//! ```text
//! fire_changed(k, v)
//!   ├── schedule every on_change callback with (k, v)
//!   ├── schedule on_removed(k) if v is Nil, else on_added(k)
//!   └── parent.fire_changed(own key, full submap)     (bubbling)
//! ```
//!
//! Callbacks never run inside the mutation that triggered them. Every public
//! mutation opens a [`Turn`]; callbacks deferred during the turn are queued
//! on the calling thread and released when the outermost turn closes. They
//! are then spawned onto the tokio runtime captured when the structure was
//! built, or run in order on the calling thread outside a runtime.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::config::WaitPolicy;
use crate::error::BridgeError;
use crate::tree::Node;
use crate::value::{Table, Value};

/// General change callback: `(key, value)`, value is `Nil` on removal.
pub type ChangeCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;
/// Addition/removal callback: `(key)`.
pub type KeyCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Tree layout a structure reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Keys are node / attribute names.
    #[default]
    Named,
    /// Keys are carried by key-identity leaf nodes, so any scalar can be a key.
    Keyed,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Named => "named",
            Variant::Keyed => "keyed",
        }
    }
}

/// Which half of the bridge a structure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Binder,
    Reader,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Binder => "binder",
            Side::Reader => "reader",
        }
    }
}

/// A mirror entry: a plain value or a nested structure.
#[derive(Clone)]
pub enum Slot<S> {
    Value(Value),
    Nested(S),
}

impl<S: Structure> Slot<S> {
    /// Plain snapshot: nested structures are unwrapped into tables.
    pub fn snapshot(&self) -> Value {
        match self {
            Slot::Value(v) => v.clone(),
            Slot::Nested(s) => Value::Table(s.raw()),
        }
    }

    pub fn as_nested(&self) -> Option<&S> {
        match self {
            Slot::Nested(s) => Some(s),
            Slot::Value(_) => None,
        }
    }
}

/// Snapshot a whole mirror.
pub(crate) fn snapshot_mirror<S: Structure>(
    mirror: &std::collections::BTreeMap<Value, Slot<S>>,
) -> Table {
    mirror.iter().map(|(k, slot)| (k.clone(), slot.snapshot())).collect()
}

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TurnState {
    depth: usize,
    queue: VecDeque<(Option<Handle>, Task)>,
}

thread_local! {
    static TURN: RefCell<TurnState> = RefCell::new(TurnState::default());
}

/// A mutation in progress on this thread.
///
/// Turns nest. Work deferred while any turn is open waits until the
/// outermost one is dropped.
#[must_use]
pub(crate) struct Turn {
    _thread_bound: PhantomData<*const ()>,
}

impl Turn {
    pub(crate) fn enter() -> Self {
        TURN.with(|turn| turn.borrow_mut().depth += 1);
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        let outermost = TURN.with(|turn| {
            let mut turn = turn.borrow_mut();
            turn.depth -= 1;
            if turn.depth == 0 && panicking {
                turn.queue.clear();
            }
            turn.depth == 0
        });
        if outermost && !panicking {
            drain();
        }
    }
}

/// Keeps a turn open while the queue drains, so callbacks that mutate
/// again append to the same queue instead of draining recursively.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TURN.with(|turn| {
            let mut turn = turn.borrow_mut();
            turn.depth -= 1;
            if std::thread::panicking() {
                turn.queue.clear();
            }
        });
    }
}

fn drain() {
    TURN.with(|turn| turn.borrow_mut().depth += 1);
    let _guard = DrainGuard;
    loop {
        let next = TURN.with(|turn| turn.borrow_mut().queue.pop_front());
        let Some((handle, task)) = next else {
            break;
        };
        match handle {
            Some(handle) => {
                handle.spawn(async move { task() });
            }
            None => task(),
        }
    }
}

/// Runs callbacks once the current turn is over.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    handle: Option<Handle>,
}

impl Dispatcher {
    pub(crate) fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    /// Queue `task` behind the open turn. With no turn open, it is released
    /// right away.
    pub(crate) fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _turn = Turn::enter();
        let task: Task = Box::new(task);
        let handle = self.handle.clone();
        TURN.with(|turn| turn.borrow_mut().queue.push_back((handle, task)));
    }
}

/// Receives change events bubbled up from a child structure.
pub(crate) trait ChangeSink: Send + Sync {
    fn fire_changed(&self, key: Value, value: Value);
}

/// Non-owning back-reference to the parent plus our key in it.
pub(crate) struct ParentLink {
    pub(crate) key: Value,
    pub(crate) parent: Weak<dyn ChangeSink>,
}

#[derive(Default, Clone)]
struct Callbacks {
    changed: Vec<ChangeCallback>,
    added: Vec<KeyCallback>,
    removed: Vec<KeyCallback>,
}

/// State shared by every structure. Built per instance; nothing here is
/// shared between structures except through explicit parent links.
pub struct StructureBase {
    side: Side,
    variant: Variant,
    depth: usize,
    link: Mutex<Option<ParentLink>>,
    callbacks: RwLock<Callbacks>,
    destroyed: Arc<AtomicBool>,
    dispatcher: Dispatcher,
    wait_policy: WaitPolicy,
}

impl StructureBase {
    pub(crate) fn new(
        side: Side,
        variant: Variant,
        depth: usize,
        dispatcher: Dispatcher,
        wait_policy: WaitPolicy,
    ) -> Self {
        crate::metrics::structure_opened(side);
        Self {
            side,
            variant,
            depth,
            link: Mutex::new(None),
            callbacks: RwLock::new(Callbacks::default()),
            destroyed: Arc::new(AtomicBool::new(false)),
            dispatcher,
            wait_policy,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn wait_policy(&self) -> WaitPolicy {
        self.wait_policy
    }

    pub(crate) fn set_link(&self, link: ParentLink) {
        *self.link.lock() = Some(link);
    }

    /// Returns false if the structure was already destroyed. Clears every
    /// callback so nothing registered can fire again.
    pub(crate) fn mark_destroyed(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.callbacks.write() = Callbacks::default();
        self.link.lock().take();
        crate::metrics::structure_closed(self.side);
        true
    }

    pub(crate) fn add_on_change(&self, callback: ChangeCallback) {
        self.callbacks.write().changed.push(callback);
    }

    pub(crate) fn add_on_added(&self, callback: KeyCallback) {
        self.callbacks.write().added.push(callback);
    }

    pub(crate) fn add_on_removed(&self, callback: KeyCallback) {
        self.callbacks.write().removed.push(callback);
    }

    /// Run the change-propagation procedure for `(key, value)`.
    ///
    /// `snapshot` produces this structure's full mirror; it is only called
    /// when there is a parent to bubble to. Must not be called while the
    /// owner holds its own mirror lock.
    pub(crate) fn propagate(&self, key: Value, value: Value, snapshot: impl FnOnce() -> Table) {
        if self.is_destroyed() {
            return;
        }
        self.dispatch(&key, &value);

        let parent = self
            .link
            .lock()
            .as_ref()
            .and_then(|link| link.parent.upgrade().map(|p| (p, link.key.clone())));
        if let Some((parent, own_key)) = parent {
            trace!(key = %own_key, "bubbling change to parent");
            parent.fire_changed(own_key, Value::Table(snapshot()));
        }
    }

    /// Schedule this structure's own callbacks for `(key, value)` without
    /// bubbling to the parent.
    pub(crate) fn dispatch(&self, key: &Value, value: &Value) {
        if self.is_destroyed() {
            return;
        }
        let callbacks = self.callbacks.read().clone();

        for callback in callbacks.changed {
            let (k, v) = (key.clone(), value.clone());
            self.defer_guarded("changed", move || callback(&k, &v));
        }

        let key_callbacks = if value.is_nil() {
            ("removed", callbacks.removed)
        } else {
            ("added", callbacks.added)
        };
        for callback in key_callbacks.1 {
            let k = key.clone();
            self.defer_guarded(key_callbacks.0, move || callback(&k));
        }
    }

    /// Defer `task`, skipping it if the structure is destroyed before it runs.
    pub(crate) fn defer_guarded<F>(&self, kind: &'static str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        crate::metrics::record_dispatch(kind);
        let destroyed = Arc::clone(&self.destroyed);
        self.dispatcher.defer(move || {
            if !destroyed.load(Ordering::Acquire) {
                task();
            }
        });
    }
}

impl Drop for StructureBase {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            crate::metrics::structure_closed(self.side);
        }
    }
}

/// The observation surface shared by binders, readers and bridges.
pub trait Structure: Clone + Send + Sync + 'static {
    #[doc(hidden)]
    fn base(&self) -> &StructureBase;

    /// The bound node.
    fn node(&self) -> &Node;

    /// Plain snapshot of the whole mirror.
    fn raw(&self) -> Table;

    /// Plain snapshot of one key, `None` when absent.
    fn lookup(&self, key: &Value) -> Option<Value>;

    /// Tear down this structure and every nested one.
    fn destroy(&self);

    fn depth(&self) -> usize {
        self.base().depth()
    }

    fn variant(&self) -> Variant {
        self.base().variant()
    }

    fn is_destroyed(&self) -> bool {
        self.base().is_destroyed()
    }

    /// Register a general change callback. There is no unregister; the
    /// registration lives until the structure is destroyed.
    fn on_change(&self, callback: impl Fn(&Value, &Value) + Send + Sync + 'static) {
        self.base().add_on_change(Arc::new(callback));
    }

    /// Register an addition-only callback.
    fn on_added(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.base().add_on_added(Arc::new(callback));
    }

    /// Register a removal-only callback.
    fn on_removed(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.base().add_on_removed(Arc::new(callback));
    }

    /// Register addition and removal callbacks together.
    fn observe(
        &self,
        on_new: impl Fn(&Value) + Send + Sync + 'static,
        on_removed: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        self.on_added(on_new);
        self.on_removed(on_removed);
    }

    /// Watch a single key.
    ///
    /// Registration is synchronous; the key's current value is replayed
    /// once in a later scheduling turn (skipped if the key is absent then).
    fn observe_key(&self, key: impl Into<Value>, callback: impl Fn(&Value) + Send + Sync + 'static) {
        let _turn = Turn::enter();
        let key = key.into();
        let callback: KeyCallback = Arc::new(callback);

        let filter_key = key.clone();
        let filtered = Arc::clone(&callback);
        self.on_change(move |k, v| {
            if *k == filter_key {
                filtered(v);
            }
        });

        let this = self.clone();
        self.base().defer_guarded("replay", move || {
            if let Some(current) = this.lookup(&key) {
                callback(&current);
            }
        });
    }

    /// Register a general callback and immediately replay every current
    /// pair through it.
    fn on_pairs(&self, callback: impl Fn(&Value, &Value) + Send + Sync + 'static) {
        let callback: ChangeCallback = Arc::new(callback);
        self.base().add_on_change(Arc::clone(&callback));
        for (k, v) in self.raw() {
            callback(&k, &v);
        }
    }

    /// Wait for `key` using the structure's wait policy (30s by default).
    fn wait(&self, key: impl Into<Value>) -> impl Future<Output = Result<Value, BridgeError>> + Send {
        let timeout = self.base().wait_policy().timeout;
        self.wait_for(key, timeout)
    }

    /// Poll the mirror until `key` is present or `timeout` elapses.
    fn wait_for(
        &self,
        key: impl Into<Value>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, BridgeError>> + Send {
        let key = key.into();
        let this = self.clone();
        async move {
            let poll = this.base().wait_policy().poll_interval;
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(value) = this.lookup(&key) {
                    return Ok(value);
                }
                if this.is_destroyed() {
                    return Err(BridgeError::Destroyed {
                        node: this.node().name().to_string(),
                    });
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    warn!(key = %key, ?timeout, node = %this.node().name(), "wait timed out");
                    crate::metrics::record_wait_timeout();
                    return Err(BridgeError::WaitTimeout {
                        key: key.to_string(),
                        timeout,
                    });
                }
                tokio::time::sleep(poll.min(deadline - now)).await;
            }
        }
    }
}
