// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authority side: materialize a table into the host tree.
//!
//! A [`Binder`] owns a mirror of the data it was given and keeps the bound
//! node in sync with it. Every write goes through the write intercept:
//!
//! ```text
//! set(k, v)
//!   ├── v == Nil    → remove node / attribute named k, drop k, fire (k, Nil)
//!   ├── v is table  → diff into nested Binder, or create container + nested Binder
//!   └── v is scalar → attribute, or leaf node when the attribute store rejects it
//! ```
//!
//! A new representation always lands before the stale one is removed, so
//! readers never observe a transient removal when a key changes shape.
//!
//! In the named layout keys are node names, so only strings and numbers are
//! accepted, and they are stored the way a reader reads them back: `"1"` and
//! `1` are the same key. Use [`Variant::Keyed`] for any other key kind.
//!
//! # Example
//!
//! ```
//! use tree_bridge::{table, Binder, Node, Structure, Value, Variant};
//!
//! let root = Node::container("player");
//! let data = table! { "health" => 100, "stats" => table! { "level" => 3 } };
//! let binder = Binder::new(data.as_table().unwrap().clone(), &root, 100, Variant::Named).unwrap();
//!
//! assert_eq!(root.attribute("health"), Some(Value::from(100)));
//! assert!(root.find_child("stats").is_some());
//!
//! binder.set("health", 90).unwrap();
//! assert_eq!(binder.get(&Value::from("health")), Some(Value::from(90)));
//! ```

mod keyed;

pub(crate) use keyed::{VALUES_CONTAINER, VALUE_SLOT};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::WaitPolicy;
use crate::error::BridgeError;
use crate::kind::{classify, LeafKind};
use crate::metrics;
use crate::structure::{
    snapshot_mirror, ChangeSink, Dispatcher, ParentLink, Side, Slot, Structure, StructureBase,
    Turn, Variant,
};
use crate::tree::{Node, NodeError};
use crate::value::{Table, Value};

/// Whether a write bubbles to the parent structure.
///
/// Diffs applied into an existing nested binder stay local: the parent
/// fires once for its own key after the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Bubble,
    Local,
}

/// Authority-side structure bound to one node.
///
/// Cloning is cheap; clones share the same mirror.
#[derive(Clone)]
pub struct Binder {
    inner: Arc<BinderInner>,
}

struct BinderInner {
    node: Node,
    base: StructureBase,
    state: Mutex<BinderState>,
}

#[derive(Default)]
struct BinderState {
    mirror: BTreeMap<Value, Slot<Binder>>,
    /// Keyed layout only: logical key to key-identity node.
    key_nodes: BTreeMap<Value, Node>,
    next_key_slot: u64,
}

impl Binder {
    /// Bind `data` to `node`, writing every key through the write intercept.
    #[tracing::instrument(skip(data, node), fields(node = %node.name(), keys = data.len()))]
    pub fn new(data: Table, node: &Node, depth: usize, variant: Variant) -> Result<Self, BridgeError> {
        Self::assemble(
            data,
            node,
            &Table::new(),
            depth,
            variant,
            Dispatcher::current(),
            WaitPolicy::default(),
        )
    }

    /// Bind `data` to `node` with `skeleton` as the authoritative shape.
    ///
    /// Every skeleton key whose value is a table gets a container node and a
    /// nested binder up front, even when `data` has nothing for it. Scalars
    /// in `data` at such keys are ignored.
    #[tracing::instrument(skip(data, node, skeleton), fields(node = %node.name(), keys = data.len()))]
    pub fn from_skeleton(
        data: Table,
        node: &Node,
        skeleton: &Table,
        depth: usize,
        variant: Variant,
    ) -> Result<Self, BridgeError> {
        Self::assemble(
            data,
            node,
            skeleton,
            depth,
            variant,
            Dispatcher::current(),
            WaitPolicy::default(),
        )
    }

    pub(crate) fn assemble(
        data: Table,
        node: &Node,
        skeleton: &Table,
        depth: usize,
        variant: Variant,
        dispatcher: Dispatcher,
        wait_policy: WaitPolicy,
    ) -> Result<Self, BridgeError> {
        let _turn = Turn::enter();
        let binder = Self::empty(node, depth, variant, dispatcher, wait_policy);
        binder.populate(data, skeleton)?;
        debug!(node = %node.name(), depth, variant = variant.as_str(), "binder created");
        Ok(binder)
    }

    fn empty(
        node: &Node,
        depth: usize,
        variant: Variant,
        dispatcher: Dispatcher,
        wait_policy: WaitPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                node: node.clone(),
                base: StructureBase::new(Side::Binder, variant, depth, dispatcher, wait_policy),
                state: Mutex::new(BinderState::default()),
            }),
        }
    }

    fn populate(&self, data: Table, skeleton: &Table) -> Result<(), BridgeError> {
        if self.depth() == 0 {
            if !data.is_empty() || !skeleton.is_empty() {
                metrics::record_truncated_write(self.variant());
            }
            return Ok(());
        }

        let mut data = self.canonical_table(data)?;
        let skeleton = self.canonical_table(skeleton.clone())?;
        for (key, shape) in &skeleton {
            let Value::Table(shape) = shape else {
                continue;
            };
            let sub_data = match data.remove(key) {
                Some(Value::Table(t)) => t,
                _ => Table::new(),
            };
            self.attach_table(key.clone(), sub_data, shape)?;
        }

        for (key, value) in data {
            self.write(key, value, Scope::Bubble)?;
        }
        Ok(())
    }

    /// Write `value` at `key`. `Nil` removes the key.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<(), BridgeError> {
        let _turn = Turn::enter();
        self.write(key.into(), value.into(), Scope::Bubble)
    }

    /// Remove `key`, along with any node or attribute already carrying its
    /// name. Fires nothing when there was nothing to remove.
    pub fn remove(&self, key: impl Into<Value>) -> Result<(), BridgeError> {
        let _turn = Turn::enter();
        self.write(key.into(), Value::Nil, Scope::Bubble)
    }

    /// Current plain value at `key`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.lookup(key)
    }

    /// Nested binder at `key`, if the key holds a table.
    pub fn child(&self, key: &Value) -> Option<Binder> {
        let key = self.mirror_key(key);
        self.inner
            .state
            .lock()
            .mirror
            .get(&key)
            .and_then(Slot::as_nested)
            .cloned()
    }

    /// Replace the whole contents: keys missing from `table` are removed,
    /// then every key of `table` is written.
    pub fn replace(&self, table: Table) -> Result<(), BridgeError> {
        let _turn = Turn::enter();
        self.apply(table, Scope::Bubble)
    }

    /// Canonicalize named-layout keys. Keyed tables pass through.
    fn canonical_table(&self, table: Table) -> Result<Table, BridgeError> {
        if self.variant() == Variant::Keyed {
            return Ok(table);
        }
        table
            .into_iter()
            .map(|(key, value)| Ok((name_key(key)?, value)))
            .collect()
    }

    /// Mirror key for a lookup. Keys that cannot be names are returned as-is
    /// and simply miss.
    fn mirror_key(&self, key: &Value) -> Value {
        match self.variant() {
            Variant::Named => key.canonical_name_key().unwrap_or_else(|| key.clone()),
            Variant::Keyed => key.clone(),
        }
    }

    fn apply(&self, table: Table, scope: Scope) -> Result<(), BridgeError> {
        let table = self.canonical_table(table)?;
        let stale: Vec<Value> = {
            let state = self.inner.state.lock();
            state
                .mirror
                .keys()
                .filter(|k| !table.contains_key(*k))
                .cloned()
                .collect()
        };
        for key in stale {
            self.write(key, Value::Nil, scope)?;
        }
        for (key, value) in table {
            self.write(key, value, scope)?;
        }
        Ok(())
    }

    fn write(&self, key: Value, value: Value, scope: Scope) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            warn!(node = %self.inner.node.name(), key = %key, "write to destroyed binder");
            return Err(BridgeError::Destroyed {
                node: self.inner.node.name().to_string(),
            });
        }
        if self.depth() == 0 {
            trace!(key = %key, "write beyond depth budget dropped");
            metrics::record_truncated_write(self.variant());
            return Ok(());
        }

        trace!(node = %self.inner.node.name(), key = %key, value = %value, "write");
        match self.variant() {
            Variant::Named => self.write_named(name_key(key)?, value, scope),
            Variant::Keyed => self.write_keyed(key, value, scope),
        }
    }

    fn write_named(&self, key: Value, value: Value, scope: Scope) -> Result<(), BridgeError> {
        let name = key.to_node_name();
        let node = &self.inner.node;

        match value {
            Value::Nil => {
                let removed = self.inner.state.lock().mirror.remove(&key);
                if let Some(Slot::Nested(nested)) = &removed {
                    nested.release();
                }
                // Anything already carrying the name goes too, even if this
                // binder did not write it
                let had_attribute = node.attribute(&name).is_some();
                node.set_attribute(&name, Value::Nil)?;
                let child = node.find_child(&name);
                let had_child = child.is_some();
                if let Some(child) = child {
                    child.destroy();
                }
                if removed.is_none() && !had_attribute && !had_child {
                    return Ok(());
                }
                metrics::record_write(Variant::Named, "removal");
                self.notify(key, Value::Nil, scope);
            }
            Value::Table(table) => {
                let snapshot = self.write_table(key.clone(), table, scope)?;
                self.notify(key, Value::Table(snapshot), scope);
            }
            scalar => {
                let kind = classify(&scalar)?;
                // Mirror first: anything observing the tree write already
                // sees the new value here
                let previous = self
                    .inner
                    .state
                    .lock()
                    .mirror
                    .insert(key.clone(), Slot::Value(scalar.clone()));

                let representation = match self.put_scalar(&name, kind, &scalar) {
                    Ok(representation) => representation,
                    Err(e) => {
                        let mut state = self.inner.state.lock();
                        match previous {
                            Some(slot) => state.mirror.insert(key, slot),
                            None => state.mirror.remove(&key),
                        };
                        return Err(e);
                    }
                };

                if let Some(Slot::Nested(nested)) = previous {
                    nested.release();
                }
                metrics::record_write(Variant::Named, representation);
                self.notify(key, scalar, scope);
            }
        }
        Ok(())
    }

    /// Store a scalar as an attribute, or as a leaf node when the attribute
    /// store rejects it. Returns which representation was used.
    fn put_scalar(&self, name: &str, kind: LeafKind, scalar: &Value) -> Result<&'static str, BridgeError> {
        let node = &self.inner.node;
        match node.set_attribute(name, scalar.clone()) {
            Ok(()) => {
                if let Some(stale) = node.find_child(name) {
                    stale.destroy();
                }
                Ok("attribute")
            }
            Err(NodeError::InvalidAttributeName(_) | NodeError::AttributeRejected { .. }) => {
                put_leaf(node, name, kind, scalar.clone())?;
                node.set_attribute(name, Value::Nil)?;
                metrics::record_attribute_fallback(kind);
                Ok("leaf")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a table at `key`: diff into the nested binder if one exists,
    /// otherwise materialize a fresh one. Returns the nested snapshot.
    fn write_table(&self, key: Value, table: Table, scope: Scope) -> Result<Table, BridgeError> {
        let existing = self.child(&key).filter(|b| !b.is_destroyed());
        if let Some(nested) = existing {
            nested.apply(table, Scope::Local)?;
            metrics::record_write(self.variant(), "container");
            return Ok(nested.raw());
        }
        let nested = self.attach_table(key, table, &Table::new())?;
        Ok(nested.raw())
    }

    /// Materialize a fresh nested binder for `key` and link it to `self`.
    ///
    /// The container is populated while detached and parented last, so the
    /// first thing readers see is the complete subtree.
    fn attach_table(
        &self,
        key: Value,
        data: Table,
        skeleton: &Table,
    ) -> Result<Binder, BridgeError> {
        let name = match self.variant() {
            Variant::Named => key.to_node_name(),
            Variant::Keyed => keyed::VALUES_CONTAINER.to_string(),
        };
        let container = Node::container(&name);
        metrics::record_node_created("container");

        let nested = Binder::empty(
            &container,
            self.depth() - 1,
            self.variant(),
            self.inner.base.dispatcher().clone(),
            self.inner.base.wait_policy(),
        );
        if let Err(e) = nested.populate(data, skeleton) {
            nested.release();
            container.destroy();
            return Err(e);
        }

        let parent: Arc<dyn ChangeSink> = self.inner.clone();
        nested.inner.base.set_link(ParentLink {
            key: key.clone(),
            parent: Arc::downgrade(&parent),
        });

        match self.variant() {
            Variant::Named => self.place_named_container(&key, &container)?,
            Variant::Keyed => self.place_keyed_container(&key, &container)?,
        }

        let previous = self
            .inner
            .state
            .lock()
            .mirror
            .insert(key.clone(), Slot::Nested(nested.clone()));
        if let Some(Slot::Nested(old)) = previous {
            old.release();
        }
        debug!(parent = %self.inner.node.name(), key = %key, "nested binder attached");
        Ok(nested)
    }

    fn place_named_container(&self, key: &Value, container: &Node) -> Result<(), BridgeError> {
        let node = &self.inner.node;
        let name = key.to_node_name();
        let stale = node.find_child(&name);

        container.set_parent(Some(node))?;
        node.set_attribute(&name, Value::Nil)?;
        if let Some(stale) = stale {
            stale.destroy();
        }
        metrics::record_write(Variant::Named, "container");
        Ok(())
    }

    fn notify(&self, key: Value, value: Value, scope: Scope) {
        match scope {
            Scope::Bubble => self.inner.fire_changed(key, value),
            Scope::Local => self.inner.base.dispatch(&key, &value),
        }
    }

    /// Stop this binder and every nested one without touching the tree.
    /// Used when the parent is about to destroy the container anyway.
    fn release(&self) {
        if !self.inner.base.mark_destroyed() {
            return;
        }
        let state = std::mem::take(&mut *self.inner.state.lock());
        for slot in state.mirror.into_values() {
            if let Slot::Nested(nested) = slot {
                nested.release();
            }
        }
    }
}

impl BinderInner {
    fn snapshot(&self) -> Table {
        snapshot_mirror(&self.state.lock().mirror)
    }
}

impl ChangeSink for BinderInner {
    fn fire_changed(&self, key: Value, value: Value) {
        self.base.propagate(key, value, || self.snapshot());
    }
}

/// Named-layout key: strings and numbers, canonicalized to what a reader
/// derives from the node name.
fn name_key(key: Value) -> Result<Value, BridgeError> {
    match key.canonical_name_key() {
        Some(canonical) => Ok(canonical),
        None => {
            warn!(key = %key, kind = key.type_name(), "named layout takes string and number keys only; use the keyed layout");
            Err(BridgeError::UnsupportedKind {
                value: key.to_string(),
                type_name: key.type_name(),
            })
        }
    }
}

/// Store `value` in a leaf child named `name`, reusing the existing leaf
/// when its kind matches. A mismatched leaf is replaced after the new one
/// is attached.
fn put_leaf(node: &Node, name: &str, kind: LeafKind, value: Value) -> Result<(), BridgeError> {
    let existing = node.find_child(name);
    if let Some(leaf) = &existing {
        if leaf.leaf_kind() == Some(kind) {
            leaf.set_value(value)?;
            return Ok(());
        }
    }

    let leaf = Node::leaf(name, kind, value)?;
    metrics::record_node_created("leaf");
    leaf.set_parent(Some(node))?;
    if let Some(stale) = existing {
        stale.destroy();
    }
    Ok(())
}

impl Structure for Binder {
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
        let slot = self.inner.state.lock().mirror.get(&key).cloned();
        slot.map(|s| s.snapshot())
    }

    /// Destroy nested binders and remove every node and attribute this
    /// binder wrote. The bound node itself is left in place.
    fn destroy(&self) {
        if !self.inner.base.mark_destroyed() {
            return;
        }
        let state = std::mem::take(&mut *self.inner.state.lock());
        let node = &self.inner.node;

        for (key, slot) in state.mirror {
            if let Slot::Nested(nested) = slot {
                nested.release();
            }
            if self.variant() == Variant::Named {
                let name = key.to_node_name();
                if let Err(e) = node.set_attribute(&name, Value::Nil) {
                    trace!(error = %e, "attribute already gone");
                }
                if let Some(child) = node.find_child(&name) {
                    child.destroy();
                }
            }
        }
        for key_node in state.key_nodes.into_values() {
            key_node.destroy();
        }
        debug!(node = %node.name(), "binder destroyed");
    }
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder")
            .field("node", &self.inner.node.name())
            .field("variant", &self.variant())
            .field("depth", &self.depth())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
