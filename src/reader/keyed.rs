//! Keyed layout for readers.
//!
//! Each leaf child of the bound node is a key-identity node: its value is
//! the logical key, and the mapped value is its `values` container, its
//! `value` attribute, or its `value` leaf child (checked in that order).
//!
//! Every key-identity node gets one [`KeySlot`] the first time it is seen.
//! The slot's listeners re-derive the key's value whenever one of those
//! three representations appears, changes, or disappears, and are released
//! together when the key-identity node leaves the tree.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::Reader;
use crate::binder::{VALUES_CONTAINER, VALUE_SLOT};
use crate::error::BridgeError;
use crate::structure::{Slot, Structure, Turn};
use crate::tree::{Node, NodeId, Subscription, SubscriptionGroup};
use crate::value::Value;

/// Listeners owned on behalf of one key-identity node.
pub(super) struct KeySlot {
    key: Value,
    group: SubscriptionGroup,
    value_leaf: Mutex<Option<(NodeId, Subscription)>>,
}

impl KeySlot {
    fn release(&self) {
        self.group.release();
        self.value_leaf.lock().take();
    }
}

fn is_value_child(child: &Node) -> bool {
    matches!(child.name(), VALUE_SLOT | VALUES_CONTAINER)
}

impl Reader {
    pub(super) fn snapshot_keyed(&self) -> Result<(), BridgeError> {
        for key_node in self.inner.node.children() {
            if !key_node.is_leaf() {
                continue;
            }
            let key = key_node.value()?;
            self.watch_key_node(&key_node, key.clone());
            if let Some(slot) = self.read_key_slot(&key_node, &key)? {
                self.inner.mirror.lock().entry(key).or_insert(slot);
            }
        }
        Ok(())
    }

    pub(super) fn key_node_added(&self, key_node: &Node) {
        if !key_node.is_leaf() {
            return;
        }
        match key_node.value() {
            Ok(key) => {
                self.watch_key_node(key_node, key);
                self.refresh_key(key_node);
            }
            Err(e) => warn!(node = %key_node.name(), error = %e, "unreadable key node"),
        }
    }

    pub(super) fn key_node_removed(&self, key_node: &Node) {
        if let Some((_, slot)) = self.inner.key_slots.remove(&key_node.id()) {
            slot.release();
            trace!(key = %slot.key, "key node removed");
            self.clear(slot.key);
        }
    }

    pub(super) fn release_key_slots(&self) {
        let ids: Vec<NodeId> = self.inner.key_slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.key_slots.remove(&id) {
                slot.release();
            }
        }
    }

    /// Attach listeners to a key-identity node. Runs once per node.
    fn watch_key_node(&self, key_node: &Node, key: Value) {
        if self.inner.key_slots.contains_key(&key_node.id()) {
            return;
        }

        let group = SubscriptionGroup::new();
        group.acquire(
            key_node.on_attribute_changed(self.key_listener::<str>(key_node, |name| name == VALUE_SLOT)),
        );
        group.acquire(key_node.on_child_added(self.key_listener::<Node>(key_node, is_value_child)));
        group.acquire(key_node.on_child_removed(self.key_listener::<Node>(key_node, is_value_child)));

        match self.inner.key_slots.entry(key_node.id()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                vacant.insert(KeySlot {
                    key,
                    group,
                    value_leaf: Mutex::new(None),
                });
            }
        }
    }

    /// Listener that re-derives the key carried by `key_node` when `filter`
    /// accepts the event.
    fn key_listener<A: ?Sized + 'static>(
        &self,
        key_node: &Node,
        filter: fn(&A) -> bool,
    ) -> impl Fn(&A) + Send + Sync + 'static {
        let reader = Arc::downgrade(&self.inner);
        let key_node = key_node.downgrade();
        move |arg: &A| {
            if !filter(arg) {
                return;
            }
            let _turn = Turn::enter();
            if let (Some(inner), Some(key_node)) = (reader.upgrade(), key_node.upgrade()) {
                Reader { inner }.refresh_key(&key_node);
            }
        }
    }

    /// Track value changes of a `value` leaf child, replacing any previous
    /// leaf tracked for the same key node.
    fn watch_value_leaf(&self, key_node: &Node, leaf: &Node) {
        let already = self
            .inner
            .key_slots
            .get(&key_node.id())
            .map(|slot| matches!(&*slot.value_leaf.lock(), Some((id, _)) if *id == leaf.id()));
        if already != Some(false) {
            return;
        }

        let subscription = leaf.on_value_changed(self.key_listener::<Value>(key_node, |_| true));
        if let Some(slot) = self.inner.key_slots.get(&key_node.id()) {
            *slot.value_leaf.lock() = Some((leaf.id(), subscription));
        }
    }

    /// Derive the mirror slot for `key` from its key-identity node.
    fn read_key_slot(&self, key_node: &Node, key: &Value) -> Result<Option<Slot<Reader>>, BridgeError> {
        if key_node.is_destroyed() {
            return Ok(None);
        }

        if let Some(values) = key_node
            .find_child(VALUES_CONTAINER)
            .filter(Node::is_container)
        {
            let current = self
                .inner
                .mirror
                .lock()
                .get(key)
                .and_then(Slot::as_nested)
                .filter(|nested| *nested.node() == values)
                .cloned();
            let nested = match current {
                Some(nested) => nested,
                None => self.open_nested(key.clone(), &values)?,
            };
            return Ok(Some(Slot::Nested(nested)));
        }

        if let Some(value) = key_node.attribute(VALUE_SLOT) {
            return Ok(Some(Slot::Value(value)));
        }

        if let Some(leaf) = key_node.find_child(VALUE_SLOT).filter(Node::is_leaf) {
            self.watch_value_leaf(key_node, &leaf);
            return Ok(Some(Slot::Value(leaf.value()?)));
        }

        Ok(None)
    }

    fn refresh_key(&self, key_node: &Node) {
        let Some(key) = self
            .inner
            .key_slots
            .get(&key_node.id())
            .map(|slot| slot.key.clone())
        else {
            return;
        };

        match self.read_key_slot(key_node, &key) {
            Ok(Some(slot)) => self.store(key, slot),
            Ok(None) => self.clear(key),
            Err(e) => warn!(key = %key, error = %e, "failed to refresh key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::Binder;
    use crate::kind::LeafKind;
    use crate::structure::Variant;
    use crate::table;
    use crate::value::{NodeRef, Table, Transform, Vector3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(value: Value) -> Table {
        value.as_table().cloned().unwrap()
    }

    #[test]
    fn test_keyed_snapshot_roundtrip() {
        let root = Node::container("root");
        let target = Node::container("target");
        let data = table! {
            Vector3::new(1.0, 0.0, 0.0) => 12,
            NodeRef::of(&target) => Transform::default(),
            7 => table! { "inner" => true },
        };
        let _binder = Binder::new(t(data.clone()), &root, 10, Variant::Keyed).unwrap();

        let reader = Reader::new(&root, 10, Variant::Keyed).unwrap();
        assert_eq!(Value::Table(reader.raw()), data);
    }

    #[test]
    fn test_keyed_live_changes() {
        let root = Node::container("root");
        let binder = Binder::new(Table::new(), &root, 10, Variant::Keyed).unwrap();
        let reader = Reader::new(&root, 10, Variant::Keyed).unwrap();

        binder.set(1, "one").unwrap();
        assert_eq!(reader.get(&Value::from(1)), Some(Value::from("one")));

        // Attribute to leaf fallback under the same key
        binder.set(1, Transform::default()).unwrap();
        assert_eq!(reader.get(&Value::from(1)), Some(Value::from(Transform::default())));

        // Leaf value change is tracked
        binder
            .set(1, Transform::at(Vector3::new(0.0, 1.0, 0.0)))
            .unwrap();
        assert_eq!(
            reader.get(&Value::from(1)),
            Some(Value::from(Transform::at(Vector3::new(0.0, 1.0, 0.0))))
        );

        binder.set(1, table! { 2 => 3 }).unwrap();
        assert_eq!(reader.get(&Value::from(1)), Some(table! { 2 => 3 }));
        binder.child(&Value::from(1)).unwrap().set(4, 5).unwrap();
        assert_eq!(reader.get(&Value::from(1)), Some(table! { 2 => 3, 4 => 5 }));
    }

    #[test]
    fn test_key_node_removal_fires_once_and_releases() {
        let root = Node::container("root");
        let binder = Binder::new(t(table! { "a" => table! { 1 => 1 } }), &root, 10, Variant::Keyed).unwrap();
        let reader = Reader::new(&root, 10, Variant::Keyed).unwrap();
        let removals = Arc::new(AtomicUsize::new(0));
        let r = removals.clone();
        reader.on_removed(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(reader.inner.key_slots.len(), 1);

        binder.remove("a").unwrap();

        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert!(reader.raw().is_empty());
        assert!(reader.inner.key_slots.is_empty());
    }

    #[test]
    fn test_non_leaf_children_are_ignored() {
        let root = Node::container("root");
        Node::container("stray").set_parent(Some(&root)).unwrap();
        let key = Node::leaf("key1", LeafKind::String, Value::from("k")).unwrap();
        key.set_attribute(VALUE_SLOT, Value::from(1)).unwrap();
        key.set_parent(Some(&root)).unwrap();

        let reader = Reader::new(&root, 10, Variant::Keyed).unwrap();
        assert_eq!(Value::Table(reader.raw()), table! { "k" => 1 });
    }
}
