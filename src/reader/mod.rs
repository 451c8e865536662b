// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Observer side: mirror a subtree of the host tree.
//!
//! A [`Reader`] takes a synchronous snapshot of its node (no
//! notifications), then attaches listeners and keeps the mirror in sync:
//!
//! | Event on the bound node   | Mirror update                          |
//! |---------------------------|----------------------------------------|
//! | attribute changed         | set or clear the attribute's key       |
//! | leaf child added          | store its value, watch value changes   |
//! | container child added     | nested reader (depth - 1)              |
//! | child removed             | clear the key unless still represented |
//! | destroying                | [`Structure::destroy`]                 |
//!
//! Every mirror change runs the change-propagation procedure: callbacks
//! are scheduled and the change bubbles to the parent reader as the full
//! submap.
//!
//! A reader tears itself down when its node is destroyed, when
//! [`Structure::destroy`] is called, or when its last handle is dropped.

mod keyed;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::WaitPolicy;
use crate::error::BridgeError;
use crate::structure::{
    snapshot_mirror, ChangeSink, Dispatcher, ParentLink, Side, Slot, Structure, StructureBase,
    Turn, Variant,
};
use crate::tree::{Node, NodeId, Subscription, SubscriptionGroup};
use crate::value::{Table, Value};

use keyed::KeySlot;

/// Observer-side structure bound to one node.
///
/// Cloning is cheap; clones share the same mirror and listeners.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    node: Node,
    base: StructureBase,
    mirror: Mutex<BTreeMap<Value, Slot<Reader>>>,
    /// Listeners on the bound node itself.
    subscriptions: SubscriptionGroup,
    /// Value-changed listeners on leaf children (named layout).
    leaf_subscriptions: DashMap<NodeId, Subscription>,
    /// Per key-identity node listeners (keyed layout).
    key_slots: DashMap<NodeId, KeySlot>,
}

impl Reader {
    /// Snapshot `node` and start listening to it.
    #[tracing::instrument(skip(node), fields(node = %node.name()))]
    pub fn new(node: &Node, depth: usize, variant: Variant) -> Result<Self, BridgeError> {
        Self::open(
            node,
            depth,
            variant,
            Dispatcher::current(),
            WaitPolicy::default(),
        )
    }

    pub(crate) fn open(
        node: &Node,
        depth: usize,
        variant: Variant,
        dispatcher: Dispatcher,
        wait_policy: WaitPolicy,
    ) -> Result<Self, BridgeError> {
        if node.is_destroyed() {
            return Err(BridgeError::Destroyed {
                node: node.name().to_string(),
            });
        }

        let reader = Self {
            inner: Arc::new(ReaderInner {
                node: node.clone(),
                base: StructureBase::new(Side::Reader, variant, depth, dispatcher, wait_policy),
                mirror: Mutex::new(BTreeMap::new()),
                subscriptions: SubscriptionGroup::new(),
                leaf_subscriptions: DashMap::new(),
                key_slots: DashMap::new(),
            }),
        };
        if depth == 0 {
            trace!(node = %node.name(), "reader at depth boundary stays static");
            return Ok(reader);
        }

        match variant {
            Variant::Named => reader.snapshot_named()?,
            Variant::Keyed => reader.snapshot_keyed()?,
        }
        reader.listen();
        debug!(
            node = %node.name(),
            depth,
            variant = variant.as_str(),
            keys = reader.inner.mirror.lock().len(),
            "reader created"
        );
        Ok(reader)
    }

    /// Current plain value at `key`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.lookup(key)
    }

    /// Nested reader at `key`, if the key holds a table.
    pub fn child(&self, key: &Value) -> Option<Reader> {
        let key = self.mirror_key(key);
        self.inner
            .mirror
            .lock()
            .get(&key)
            .and_then(Slot::as_nested)
            .cloned()
    }

    /// Named mirrors are keyed by canonical names, so `"1"` finds `1`.
    fn mirror_key(&self, key: &Value) -> Value {
        match self.variant() {
            Variant::Named => key.canonical_name_key().unwrap_or_else(|| key.clone()),
            Variant::Keyed => key.clone(),
        }
    }

    fn snapshot_named(&self) -> Result<(), BridgeError> {
        let node = &self.inner.node;
        let mut entries = BTreeMap::new();

        // First child with a given name wins; children shadow attributes
        for child in node.children() {
            let key = Value::from_node_name(child.name());
            if entries.contains_key(&key) {
                continue;
            }
            let slot = if child.is_leaf() {
                self.watch_leaf(&child);
                Slot::Value(child.value()?)
            } else {
                Slot::Nested(self.open_nested(key.clone(), &child)?)
            };
            entries.insert(key, slot);
        }
        for (name, value) in node.attributes() {
            entries
                .entry(Value::from_node_name(&name))
                .or_insert(Slot::Value(value));
        }

        *self.inner.mirror.lock() = entries;
        Ok(())
    }

    fn listen(&self) {
        let inner = &self.inner;
        let node = &inner.node;

        if self.variant() == Variant::Named {
            inner
                .subscriptions
                .acquire(node.on_attribute_changed(self.bind(Reader::attribute_changed)));
        }
        inner
            .subscriptions
            .acquire(node.on_child_added(self.bind(Reader::child_added)));
        inner
            .subscriptions
            .acquire(node.on_child_removed(self.bind(Reader::child_removed)));

        let weak = Arc::downgrade(&self.inner);
        inner.subscriptions.acquire(node.on_destroying(move || {
            if let Some(inner) = weak.upgrade() {
                Reader { inner }.destroy();
            }
        }));
    }

    /// Wrap a handler so the listener holds the reader weakly and runs as
    /// its own turn.
    fn bind<A: ?Sized + 'static>(
        &self,
        handler: fn(&Reader, &A),
    ) -> impl Fn(&A) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move |arg: &A| {
            let _turn = Turn::enter();
            if let Some(inner) = weak.upgrade() {
                handler(&Reader { inner }, arg);
            }
        }
    }

    fn open_nested(&self, key: Value, node: &Node) -> Result<Reader, BridgeError> {
        let nested = Reader::open(
            node,
            self.depth().saturating_sub(1),
            self.variant(),
            self.inner.base.dispatcher().clone(),
            self.inner.base.wait_policy(),
        )?;
        let parent: Arc<dyn ChangeSink> = self.inner.clone();
        nested.inner.base.set_link(ParentLink {
            key,
            parent: Arc::downgrade(&parent),
        });
        Ok(nested)
    }

    fn watch_leaf(&self, leaf: &Node) {
        let weak = Arc::downgrade(&self.inner);
        let key = Value::from_node_name(leaf.name());
        let subscription = leaf.on_value_changed(move |value| {
            let _turn = Turn::enter();
            if let Some(inner) = weak.upgrade() {
                Reader { inner }.store(key.clone(), Slot::Value(value.clone()));
            }
        });
        self.inner.leaf_subscriptions.insert(leaf.id(), subscription);
    }

    fn attribute_changed(&self, name: &str) {
        let key = Value::from_node_name(name);
        match self.inner.node.attribute(name) {
            Some(value) => self.store(key, Slot::Value(value)),
            // A child with the same name still carries the key
            None if self.inner.node.find_child(name).is_some() => {}
            None => self.clear(key),
        }
    }

    fn child_added(&self, child: &Node) {
        if self.variant() == Variant::Keyed {
            self.key_node_added(child);
            return;
        }

        let key = Value::from_node_name(child.name());
        if child.is_leaf() {
            match child.value() {
                Ok(value) => {
                    self.watch_leaf(child);
                    self.store(key, Slot::Value(value));
                }
                Err(e) => warn!(child = %child.name(), error = %e, "unreadable leaf"),
            }
            return;
        }

        match self.open_nested(key.clone(), child) {
            Ok(nested) => self.store(key, Slot::Nested(nested)),
            Err(e) => warn!(child = %child.name(), error = %e, "failed to read container"),
        }
    }

    fn child_removed(&self, child: &Node) {
        if self.variant() == Variant::Keyed {
            self.key_node_removed(child);
            return;
        }

        self.inner.leaf_subscriptions.remove(&child.id());
        let name = child.name();
        let node = &self.inner.node;
        if node.attribute(name).is_some() || node.find_child(name).is_some() {
            return;
        }

        let key = Value::from_node_name(name);
        let stale = matches!(
            self.inner.mirror.lock().get(&key),
            Some(Slot::Nested(current)) if current.node() != child
        );
        if !stale {
            self.clear(key);
        }
    }

    /// Store `slot` at `key` and propagate, unless nothing changed.
    fn store(&self, key: Value, slot: Slot<Reader>) {
        if self.is_destroyed() {
            return;
        }
        let fired = slot.snapshot();
        let previous = self.inner.mirror.lock().insert(key.clone(), slot.clone());

        match (previous, &slot) {
            (Some(Slot::Value(old)), Slot::Value(new)) if old == *new => return,
            (Some(Slot::Nested(old)), Slot::Nested(new)) if Arc::ptr_eq(&old.inner, &new.inner) => {
                return
            }
            (Some(Slot::Nested(old)), _) => old.destroy(),
            _ => {}
        }
        self.inner.fire_changed(key, fired);
    }

    /// Drop `key` from the mirror and fire a removal if it was present.
    fn clear(&self, key: Value) {
        let previous = self.inner.mirror.lock().remove(&key);
        let Some(previous) = previous else {
            return;
        };
        if let Slot::Nested(nested) = previous {
            nested.destroy();
        }
        self.inner.fire_changed(key, Value::Nil);
    }
}

impl ReaderInner {
    fn snapshot(&self) -> Table {
        snapshot_mirror(&self.mirror.lock())
    }
}

impl ChangeSink for ReaderInner {
    fn fire_changed(&self, key: Value, value: Value) {
        trace!(node = %self.node.name(), key = %key, value = %value, "observed change");
        self.base.propagate(key, value, || self.snapshot());
    }
}

impl Structure for Reader {
    fn base(&self) -> &StructureBase {
        &self.inner.base
    }

    fn node(&self) -> &Node {
        &self.inner.node
    }

    fn raw(&self) -> Table {
        self.inner.snapshot()
    }

    fn lookup(&self, key: &Value) -> Option<Value> {
        let key = self.mirror_key(key);
        let slot = self.inner.mirror.lock().get(&key).cloned();
        slot.map(|s| s.snapshot())
    }

    /// Release every listener and destroy nested readers. Idempotent.
    fn destroy(&self) {
        if !self.inner.base.mark_destroyed() {
            return;
        }
        let released = self.inner.subscriptions.release();
        self.inner.leaf_subscriptions.clear();
        self.release_key_slots();

        let mirror = std::mem::take(&mut *self.inner.mirror.lock());
        for slot in mirror.into_values() {
            if let Slot::Nested(nested) = slot {
                nested.destroy();
            }
        }
        debug!(node = %self.inner.node.name(), released, "reader destroyed");
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("node", &self.inner.node.name())
            .field("variant", &self.variant())
            .field("depth", &self.depth())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::LeafKind;
    use crate::table;
    use crate::value::{NodeRef, Transform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_tree() -> Node {
        let root = Node::container("root");
        root.set_attribute("health", Value::from(100)).unwrap();
        Node::leaf("has space", LeafKind::String, Value::from("x"))
            .unwrap()
            .set_parent(Some(&root))
            .unwrap();
        let stats = Node::container("stats");
        stats.set_attribute("level", Value::from(3)).unwrap();
        stats.set_parent(Some(&root)).unwrap();
        root
    }

    #[test]
    fn test_snapshot_reads_all_representations() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();

        assert_eq!(
            Value::Table(reader.raw()),
            table! {
                "health" => 100,
                "has space" => "x",
                "stats" => table! { "level" => 3 },
            }
        );
        assert!(reader.child(&Value::from("stats")).is_some());
    }

    #[test]
    fn test_numeric_names_become_numeric_keys() {
        let root = Node::container("root");
        root.set_attribute("7", Value::from(true)).unwrap();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        assert_eq!(reader.get(&Value::from(7)), Some(Value::from(true)));
    }

    #[test]
    fn test_depth_zero_is_static() {
        let root = sample_tree();
        let reader = Reader::new(&root, 0, Variant::Named).unwrap();
        assert!(reader.raw().is_empty());

        root.set_attribute("late", Value::from(1)).unwrap();
        assert!(reader.raw().is_empty());
    }

    #[test]
    fn test_depth_one_leaves_nested_empty() {
        let root = sample_tree();
        let reader = Reader::new(&root, 1, Variant::Named).unwrap();
        assert_eq!(reader.get(&Value::from("stats")), Some(table! {}));
    }

    #[test]
    fn test_live_updates_without_runtime() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        reader.on_change(move |k, v| s.lock().push((k.clone(), v.clone())));

        root.set_attribute("health", Value::from(50)).unwrap();
        root.find_child("has space")
            .unwrap()
            .set_value(Value::from("y"))
            .unwrap();
        let target = Node::container("target");
        Node::leaf("ref", LeafKind::Reference, Value::from(NodeRef::of(&target)))
            .unwrap()
            .set_parent(Some(&root))
            .unwrap();

        assert_eq!(reader.get(&Value::from("health")), Some(Value::from(50)));
        assert_eq!(reader.get(&Value::from("has space")), Some(Value::from("y")));
        assert_eq!(
            reader.get(&Value::from("ref")),
            Some(Value::from(NodeRef::of(&target)))
        );
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_nested_change_bubbles_full_submap() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        reader.on_change(move |k, v| s.lock().push((k.clone(), v.clone())));

        let stats = root.find_child("stats").unwrap();
        stats.set_attribute("xp", Value::from(10)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Value::from("stats"));
        assert_eq!(seen[0].1, table! { "level" => 3, "xp" => 10 });
    }

    #[test]
    fn test_child_removal_fires_once() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        let removals = Arc::new(AtomicUsize::new(0));
        let r = removals.clone();
        reader.on_removed(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let stats = root.find_child("stats").unwrap();
        let nested = reader.child(&Value::from("stats")).unwrap();
        stats.destroy();

        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert!(nested.is_destroyed());
        assert!(reader.get(&Value::from("stats")).is_none());
    }

    #[test]
    fn test_shadowed_leaf_removal_keeps_key() {
        let root = Node::container("root");
        let leaf = Node::leaf("cf", LeafKind::Transform, Value::from(Transform::default())).unwrap();
        leaf.set_parent(Some(&root)).unwrap();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();

        // Same key moves from a leaf to an attribute
        root.set_attribute("cf", Value::from(1)).unwrap();
        leaf.destroy();
        assert_eq!(reader.get(&Value::from("cf")), Some(Value::from(1)));
    }

    #[test]
    fn test_node_destroy_tears_down_reader() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        root.destroy();
        assert!(reader.is_destroyed());
        assert!(reader.raw().is_empty());
        assert!(matches!(
            Reader::new(&root, 10, Variant::Named),
            Err(BridgeError::Destroyed { .. })
        ));
    }

    #[test]
    fn test_dropped_reader_stops_listening() {
        let root = sample_tree();
        let reader = Reader::new(&root, 10, Variant::Named).unwrap();
        let weak = Arc::downgrade(&reader.inner);
        drop(reader);
        assert!(weak.upgrade().is_none());

        // Listeners hold the reader weakly; the write lands on no one
        root.set_attribute("health", Value::from(1)).unwrap();
    }
}
