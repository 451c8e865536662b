// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::trace;

use super::signal::{Signal, Subscription};
use super::NodeError;
use crate::error::BridgeError;
use crate::kind::{classify, LeafKind};
use crate::value::Value;

/// Longest accepted attribute name.
pub const MAX_ATTRIBUTE_NAME_LEN: usize = 100;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Whether a node is a container or a typed scalar leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Container,
    Leaf(LeafKind),
}

struct NodeState {
    attributes: BTreeMap<String, Value>,
    value: Value,
    children: Vec<Node>,
    parent: Weak<NodeInner>,
}

struct NodeSignals {
    attribute_changed: Signal<str>,
    value_changed: Signal<Value>,
    child_added: Signal<Node>,
    child_removed: Signal<Node>,
    destroying: Signal<()>,
}

struct NodeInner {
    id: NodeId,
    name: String,
    class: NodeClass,
    state: RwLock<NodeState>,
    signals: NodeSignals,
    destroyed: AtomicBool,
}

/// Shared handle to a node in the host tree.
///
/// Clones refer to the same node. Every mutation fires its signal after the
/// node's own lock is released, and only when something actually changed.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Non-owning node handle.
#[derive(Clone)]
pub struct WeakNode {
    inner: Weak<NodeInner>,
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

/// Attribute names: 1-100 chars of `[A-Za-z0-9_]`, not starting with `RBX`.
pub fn is_valid_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ATTRIBUTE_NAME_LEN
        && !name.starts_with("RBX")
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Node {
    fn with_class(name: &str, class: NodeClass, value: Value) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::next(),
                name: name.to_string(),
                class,
                state: RwLock::new(NodeState {
                    attributes: BTreeMap::new(),
                    value,
                    children: Vec::new(),
                    parent: Weak::new(),
                }),
                signals: NodeSignals {
                    attribute_changed: Signal::new(),
                    value_changed: Signal::new(),
                    child_added: Signal::new(),
                    child_removed: Signal::new(),
                    destroying: Signal::new(),
                },
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// New detached container node.
    pub fn container(name: &str) -> Self {
        Self::with_class(name, NodeClass::Container, Value::Nil)
    }

    /// New detached leaf node holding `value`.
    pub fn leaf(name: &str, kind: LeafKind, value: Value) -> Result<Self, NodeError> {
        if !kind.accepts(&value) {
            return Err(NodeError::LeafKindMismatch {
                expected: kind,
                actual: value.type_name().to_string(),
            });
        }
        Ok(Self::with_class(name, NodeClass::Leaf(kind), value))
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn class(&self) -> NodeClass {
        self.inner.class
    }

    pub fn leaf_kind(&self) -> Option<LeafKind> {
        match self.inner.class {
            NodeClass::Leaf(kind) => Some(kind),
            NodeClass::Container => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.inner.class, NodeClass::Leaf(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self.inner.class, NodeClass::Container)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_alive(&self) -> Result<(), NodeError> {
        if self.is_destroyed() {
            Err(NodeError::Destroyed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    // ───────────────────────────── hierarchy ─────────────────────────────

    pub fn parent(&self) -> Option<Node> {
        self.inner.state.read().parent.upgrade().map(|inner| Node { inner })
    }

    pub fn children(&self) -> Vec<Node> {
        self.inner.state.read().children.clone()
    }

    /// First child with the given name.
    pub fn find_child(&self, name: &str) -> Option<Node> {
        self.inner
            .state
            .read()
            .children
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Move this node under `parent` (or detach it with `None`).
    ///
    /// Fires `child_removed` on the old parent, then `child_added` on the
    /// new one.
    pub fn set_parent(&self, parent: Option<&Node>) -> Result<(), NodeError> {
        self.ensure_alive()?;
        if let Some(p) = parent {
            p.ensure_alive()?;
            if p.is_descendant_of(self) {
                return Err(NodeError::CyclicParent(self.inner.name.clone()));
            }
            if self.parent().is_some_and(|current| current == *p) {
                return Ok(());
            }
        }

        self.detach();

        if let Some(p) = parent {
            {
                let mut state = self.inner.state.write();
                state.parent = Arc::downgrade(&p.inner);
            }
            p.inner.state.write().children.push(self.clone());
            trace!(child = %self.name(), parent = %p.name(), "node attached");
            p.inner.signals.child_added.fire(self);
        }
        Ok(())
    }

    fn is_descendant_of(&self, other: &Node) -> bool {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node == *other {
                return true;
            }
            current = node.parent();
        }
        false
    }

    fn detach(&self) {
        let old_parent = {
            let mut state = self.inner.state.write();
            std::mem::take(&mut state.parent).upgrade()
        };
        if let Some(parent) = old_parent {
            let parent = Node { inner: parent };
            parent
                .inner
                .state
                .write()
                .children
                .retain(|c| c.id() != self.id());
            parent.inner.signals.child_removed.fire(self);
        }
    }

    /// Destroy this node and its whole subtree.
    ///
    /// Order: `destroying` fires on this node, descendants are destroyed,
    /// the node is detached from its parent (`child_removed` fires there),
    /// then every listener on this node is disconnected. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signals.destroying.fire(&());

        for child in self.children() {
            child.destroy();
        }
        self.detach();

        let signals = &self.inner.signals;
        signals.attribute_changed.disconnect_all();
        signals.value_changed.disconnect_all();
        signals.child_added.disconnect_all();
        signals.child_removed.disconnect_all();
        signals.destroying.disconnect_all();
        trace!(node = %self.name(), "node destroyed");
    }

    // ───────────────────────────── attributes ────────────────────────────

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.inner.state.read().attributes.get(name).cloned()
    }

    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.inner
            .state
            .read()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Store `value` under `name`; `Nil` clears the attribute.
    ///
    /// Rejects invalid names and values whose kind is not attribute
    /// storable. Clearing an attribute that does not exist is a no-op.
    pub fn set_attribute(&self, name: &str, value: Value) -> Result<(), NodeError> {
        self.ensure_alive()?;

        if value.is_nil() {
            let removed = self.inner.state.write().attributes.remove(name).is_some();
            if removed {
                self.inner.signals.attribute_changed.fire(name);
            }
            return Ok(());
        }

        if !is_valid_attribute_name(name) {
            return Err(NodeError::InvalidAttributeName(name.to_string()));
        }
        let kind = classify(&value).map_err(|_| NodeError::AttributeRejected {
            name: name.to_string(),
            kind: value.type_name().to_string(),
        })?;
        if !kind.attribute_storable() {
            return Err(NodeError::AttributeRejected {
                name: name.to_string(),
                kind: kind.to_string(),
            });
        }

        let changed = {
            let mut state = self.inner.state.write();
            match state.attributes.get(name) {
                Some(current) if *current == value => false,
                _ => {
                    state.attributes.insert(name.to_string(), value);
                    true
                }
            }
        };
        if changed {
            self.inner.signals.attribute_changed.fire(name);
        }
        Ok(())
    }

    // ───────────────────────────── leaf value ────────────────────────────

    pub fn value(&self) -> Result<Value, NodeError> {
        match self.inner.class {
            NodeClass::Leaf(_) => Ok(self.inner.state.read().value.clone()),
            NodeClass::Container => Err(NodeError::NotALeaf(self.inner.name.clone())),
        }
    }

    pub fn set_value(&self, value: Value) -> Result<(), NodeError> {
        self.ensure_alive()?;
        let kind = self
            .leaf_kind()
            .ok_or_else(|| NodeError::NotALeaf(self.inner.name.clone()))?;
        if !kind.accepts(&value) {
            return Err(NodeError::LeafKindMismatch {
                expected: kind,
                actual: value.type_name().to_string(),
            });
        }

        let changed = {
            let mut state = self.inner.state.write();
            if state.value == value {
                false
            } else {
                state.value = value.clone();
                true
            }
        };
        if changed {
            self.inner.signals.value_changed.fire(&value);
        }
        Ok(())
    }

    // ───────────────────────────── signals ───────────────────────────────

    pub fn on_attribute_changed(
        &self,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.signals.attribute_changed.connect(handler)
    }

    pub fn on_value_changed(
        &self,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.signals.value_changed.connect(handler)
    }

    pub fn on_child_added(&self, handler: impl Fn(&Node) + Send + Sync + 'static) -> Subscription {
        self.inner.signals.child_added.connect(handler)
    }

    pub fn on_child_removed(
        &self,
        handler: impl Fn(&Node) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.signals.child_removed.connect(handler)
    }

    /// Fires once, at the start of [`Node::destroy`].
    pub fn on_destroying(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.signals.destroying.connect(move |_: &()| handler())
    }

    /// Wait until a child named `name` exists.
    ///
    /// Observers use this when the node they want to read has not been
    /// replicated yet.
    pub async fn wait_for_child(&self, name: &str, timeout: Duration) -> Result<Node, BridgeError> {
        let notify = Arc::new(Notify::new());
        let _sub = {
            let notify = notify.clone();
            let wanted = name.to_string();
            self.on_child_added(move |child| {
                if child.name() == wanted {
                    notify.notify_one();
                }
            })
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(child) = self.find_child(name) {
                return Ok(child);
            }
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Err(BridgeError::WaitTimeout {
                    key: name.to_string(),
                    timeout,
                });
            }
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id.0)
            .field("name", &self.inner.name)
            .field("class", &self.inner.class)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NodeRef, Transform, Vector3};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) + Send + Sync + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |entry: String| sink.lock().push(entry))
    }

    #[test]
    fn test_attribute_roundtrip_and_signal() {
        let node = Node::container("root");
        let (log, push) = recorder();
        let _sub = node.on_attribute_changed(move |name| push(name.to_string()));

        node.set_attribute("health", Value::from(100)).unwrap();
        assert_eq!(node.attribute("health"), Some(Value::from(100)));

        // Unchanged value does not fire
        node.set_attribute("health", Value::from(100)).unwrap();
        node.set_attribute("health", Value::Nil).unwrap();
        assert_eq!(node.attribute("health"), None);

        assert_eq!(*log.lock(), vec!["health", "health"]);
    }

    #[test]
    fn test_attribute_rejections() {
        let node = Node::container("root");
        let target = Node::container("target");

        assert!(matches!(
            node.set_attribute("has space", Value::from(1)),
            Err(NodeError::InvalidAttributeName(_))
        ));
        assert!(matches!(
            node.set_attribute("RBXthing", Value::from(1)),
            Err(NodeError::InvalidAttributeName(_))
        ));
        assert!(matches!(
            node.set_attribute("target", Value::from(NodeRef::of(&target))),
            Err(NodeError::AttributeRejected { .. })
        ));
        assert!(matches!(
            node.set_attribute("cf", Value::from(Transform::default())),
            Err(NodeError::AttributeRejected { .. })
        ));
        assert!(node
            .set_attribute("pos", Value::from(Vector3::new(1.0, 2.0, 3.0)))
            .is_ok());

        // Clearing a name that could never exist is fine
        assert!(node.set_attribute("has space", Value::Nil).is_ok());
    }

    #[test]
    fn test_leaf_kind_enforced() {
        assert!(Node::leaf("n", LeafKind::Integer, Value::from(1.5)).is_err());
        let leaf = Node::leaf("n", LeafKind::Float, Value::from(1)).unwrap();
        leaf.set_value(Value::from(2.5)).unwrap();
        assert_eq!(leaf.value().unwrap(), Value::from(2.5));
        assert!(leaf.set_value(Value::from("text")).is_err());

        let container = Node::container("c");
        assert!(matches!(container.value(), Err(NodeError::NotALeaf(_))));
    }

    #[test]
    fn test_value_changed_fires_only_on_change() {
        let leaf = Node::leaf("n", LeafKind::String, Value::from("a")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = leaf.on_value_changed(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        leaf.set_value(Value::from("a")).unwrap();
        leaf.set_value(Value::from("b")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parenting_fires_added_and_removed() {
        let root = Node::container("root");
        let (log, push) = recorder();
        let added = push.clone();
        let _a = root.on_child_added(move |c| added(format!("+{}", c.name())));
        let _r = root.on_child_removed(move |c| push(format!("-{}", c.name())));

        let child = Node::container("child");
        child.set_parent(Some(&root)).unwrap();
        assert_eq!(root.find_child("child"), Some(child.clone()));
        assert_eq!(child.parent(), Some(root.clone()));

        child.set_parent(None).unwrap();
        assert!(root.children().is_empty());
        assert_eq!(*log.lock(), vec!["+child", "-child"]);
    }

    #[test]
    fn test_cyclic_parent_rejected() {
        let a = Node::container("a");
        let b = Node::container("b");
        b.set_parent(Some(&a)).unwrap();
        assert!(matches!(
            a.set_parent(Some(&b)),
            Err(NodeError::CyclicParent(_))
        ));
        assert!(a.set_parent(Some(&a)).is_err());
    }

    #[test]
    fn test_destroy_order_and_idempotence() {
        let root = Node::container("root");
        let child = Node::container("child");
        let grandchild = Node::leaf("g", LeafKind::Boolean, Value::from(true)).unwrap();
        grandchild.set_parent(Some(&child)).unwrap();
        child.set_parent(Some(&root)).unwrap();

        let (log, push) = recorder();
        let on_destroy = push.clone();
        let _d = child.on_destroying(move || on_destroy("destroying".into()));
        let _r = root.on_child_removed(move |c| push(format!("-{}", c.name())));

        child.destroy();
        child.destroy();

        assert_eq!(*log.lock(), vec!["destroying", "-child"]);
        assert!(child.is_destroyed());
        assert!(grandchild.is_destroyed());
        assert!(root.children().is_empty());
        assert!(child.set_attribute("x", Value::from(1)).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_child_resolves() {
        let root = Node::container("root");
        let late = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Node::container("late").set_parent(Some(&late)).unwrap();
        });

        let child = root
            .wait_for_child("late", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(child.name(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_child_times_out() {
        let root = Node::container("root");
        let err = root
            .wait_for_child("never", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
