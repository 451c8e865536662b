//! Keyed layout for binders.
//!
//! Every logical key owns a key-identity leaf node under the bound node:
//!
//! ```text
//! bound node
//! ├── key1 (Vector3 leaf = <key>)   @value = 12
//! ├── key2 (Reference leaf = <key>)
//! │   └── value (Transform leaf)    scalar the attribute store rejects
//! └── key3 (Integer leaf = 7)
//!     └── values (container)        nested keyed binder
//! ```
//!
//! Keys can be any classifiable scalar, including references and geometry.

use tracing::trace;

use super::{put_leaf, Binder, Scope};
use crate::error::BridgeError;
use crate::kind::{classify, LeafKind};
use crate::metrics;
use crate::structure::{Slot, Variant};
use crate::tree::{Node, NodeError};
use crate::value::Value;

/// Attribute (or fallback leaf child) holding a key's scalar value.
pub(crate) const VALUE_SLOT: &str = "value";
/// Container child holding a key's nested table.
pub(crate) const VALUES_CONTAINER: &str = "values";
/// Key-identity nodes are named `key<N>`.
pub(crate) const KEY_NODE_PREFIX: &str = "key";

impl Binder {
    pub(super) fn write_keyed(&self, key: Value, value: Value, scope: Scope) -> Result<(), BridgeError> {
        let key_kind = classify(&key)?;

        match value {
            Value::Nil => {
                let (slot, key_node) = {
                    let mut state = self.inner.state.lock();
                    (state.mirror.remove(&key), state.key_nodes.remove(&key))
                };
                if let Some(Slot::Nested(nested)) = &slot {
                    nested.release();
                }
                if let Some(key_node) = key_node {
                    key_node.destroy();
                }
                if slot.is_some() {
                    metrics::record_write(Variant::Keyed, "removal");
                    self.notify(key, Value::Nil, scope);
                }
            }
            Value::Table(table) => {
                let snapshot = self.write_table(key.clone(), table, scope)?;
                self.notify(key, Value::Table(snapshot), scope);
            }
            scalar => {
                let kind = classify(&scalar)?;
                let (key_node, fresh) = self.key_node(&key, key_kind)?;
                let previous = self.inner.state.lock().mirror.get(&key).cloned();

                let representation = match key_node.set_attribute(VALUE_SLOT, scalar.clone()) {
                    Ok(()) => {
                        if let Some(stale) = key_node.find_child(VALUE_SLOT) {
                            stale.destroy();
                        }
                        "attribute"
                    }
                    Err(NodeError::AttributeRejected { .. }) => {
                        put_leaf(&key_node, VALUE_SLOT, kind, scalar.clone())?;
                        key_node.set_attribute(VALUE_SLOT, Value::Nil)?;
                        metrics::record_attribute_fallback(kind);
                        "leaf"
                    }
                    Err(e) => return Err(e.into()),
                };

                if let Some(Slot::Nested(nested)) = previous {
                    nested.release();
                }
                if let Some(stale) = key_node.find_child(VALUES_CONTAINER) {
                    stale.destroy();
                }

                self.inner
                    .state
                    .lock()
                    .mirror
                    .insert(key.clone(), Slot::Value(scalar.clone()));
                if fresh {
                    self.adopt_key_node(&key, &key_node)?;
                }
                metrics::record_write(Variant::Keyed, representation);
                self.notify(key, scalar, scope);
            }
        }
        Ok(())
    }

    /// Existing key-identity node for `key`, or a new detached one.
    /// The flag is true when the node was just created.
    fn key_node(&self, key: &Value, kind: LeafKind) -> Result<(Node, bool), BridgeError> {
        let slot = {
            let mut state = self.inner.state.lock();
            if let Some(node) = state.key_nodes.get(key) {
                return Ok((node.clone(), false));
            }
            state.next_key_slot += 1;
            state.next_key_slot
        };
        let node = Node::leaf(&format!("{KEY_NODE_PREFIX}{slot}"), kind, key.clone())?;
        metrics::record_node_created("key");
        trace!(key = %key, node = %node.name(), "key node created");
        Ok((node, true))
    }

    /// Parent a freshly built key node and start tracking it.
    fn adopt_key_node(&self, key: &Value, key_node: &Node) -> Result<(), BridgeError> {
        self.inner
            .state
            .lock()
            .key_nodes
            .insert(key.clone(), key_node.clone());
        key_node.set_parent(Some(&self.inner.node))?;
        Ok(())
    }

    /// Place a populated `values` container under the key node for `key`.
    pub(super) fn place_keyed_container(&self, key: &Value, container: &Node) -> Result<(), BridgeError> {
        let key_kind = classify(key)?;
        let (key_node, fresh) = self.key_node(key, key_kind)?;
        let stale: Vec<Node> = key_node
            .children()
            .into_iter()
            .filter(|c| c.name() == VALUES_CONTAINER || c.name() == VALUE_SLOT)
            .collect();

        container.set_parent(Some(&key_node))?;
        key_node.set_attribute(VALUE_SLOT, Value::Nil)?;
        for node in stale {
            node.destroy();
        }
        if fresh {
            self.adopt_key_node(key, &key_node)?;
        }
        metrics::record_write(Variant::Keyed, "container");
        Ok(())
    }

    /// Key-identity node currently carrying `key`.
    pub fn key_node_for(&self, key: &Value) -> Option<Node> {
        self.inner.state.lock().key_nodes.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Structure;
    use crate::table;
    use crate::value::Table;
    use crate::value::{NodeRef, Transform, Vector3};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn t(value: Value) -> Table {
        value.as_table().cloned().unwrap()
    }

    fn keyed(data: Value, node: &Node, depth: usize) -> Binder {
        Binder::new(t(data), node, depth, Variant::Keyed).unwrap()
    }

    #[test]
    fn test_key_nodes_carry_keys() {
        let root = Node::container("root");
        let pos = Vector3::new(1.0, 2.0, 3.0);
        let binder = keyed(table! { pos => 12, 7 => "seven" }, &root, 10);

        let pos_node = binder.key_node_for(&Value::from(pos)).unwrap();
        assert_eq!(pos_node.leaf_kind(), Some(LeafKind::Vector3));
        assert_eq!(pos_node.value().unwrap(), Value::from(pos));
        assert_eq!(pos_node.attribute(VALUE_SLOT), Some(Value::from(12)));
        assert!(pos_node.name().starts_with(KEY_NODE_PREFIX));

        let seven = binder.key_node_for(&Value::from(7)).unwrap();
        assert_eq!(seven.leaf_kind(), Some(LeafKind::Integer));
        assert_eq!(root.children().len(), 2);
    }

    #[test]
    fn test_reference_keys_and_rejected_values() {
        let root = Node::container("root");
        let target = Node::container("target");
        let binder = keyed(table! {}, &root, 10);

        binder
            .set(NodeRef::of(&target), Transform::default())
            .unwrap();
        let key_node = binder.key_node_for(&Value::from(NodeRef::of(&target))).unwrap();
        assert_eq!(key_node.leaf_kind(), Some(LeafKind::Reference));
        let value = key_node.find_child(VALUE_SLOT).unwrap();
        assert_eq!(value.leaf_kind(), Some(LeafKind::Transform));
        assert!(key_node.attribute(VALUE_SLOT).is_none());
    }

    #[test]
    fn test_tables_go_under_values() {
        let root = Node::container("root");
        let binder = keyed(table! { 1 => table! { "a" => 1 } }, &root, 10);

        let key_node = binder.key_node_for(&Value::from(1)).unwrap();
        let values = key_node.find_child(VALUES_CONTAINER).unwrap();
        assert!(values.is_container());
        assert_eq!(values.children().len(), 1);
        assert_eq!(
            binder.get(&Value::from(1)),
            Some(table! { "a" => 1 })
        );

        // Back to a scalar: the container goes away
        binder.set(1, false).unwrap();
        assert!(key_node.find_child(VALUES_CONTAINER).is_none());
        assert_eq!(key_node.attribute(VALUE_SLOT), Some(Value::from(false)));
    }

    #[test]
    fn test_unsupported_key_is_rejected() {
        let root = Node::container("root");
        let binder = keyed(table! {}, &root, 10);
        let err = binder.set(Value::Table(Table::new()), 1).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedKind { .. }));
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_removal_destroys_key_node_once() {
        let root = Node::container("root");
        let binder = keyed(table! { "a" => 1 }, &root, 10);
        let removals = Arc::new(AtomicUsize::new(0));
        let r = removals.clone();
        binder.on_removed(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let key_node = binder.key_node_for(&Value::from("a")).unwrap();

        binder.remove("a").unwrap();
        binder.remove("a").unwrap();

        assert!(key_node.is_destroyed());
        assert!(root.children().is_empty());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replace_runs_single_stale_pass() {
        let root = Node::container("root");
        let binder = keyed(table! { 1 => "a", 2 => "b", 3 => "c" }, &root, 10);
        binder.replace(t(table! { 2 => "B" })).unwrap();

        assert_eq!(binder.raw(), t(table! { 2 => "B" }));
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn test_destroy_removes_key_nodes() {
        let root = Node::container("root");
        let binder = keyed(table! { 1 => "a", 2 => table! { 3 => "c" } }, &root, 10);
        binder.destroy();
        assert!(root.children().is_empty());
    }
}
