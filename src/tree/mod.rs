//! In-process host tree.
//!
//! The node tree is the wire format between the authority and its
//! observers: binders materialize data into it and readers listen to it.
//! Replicating the tree across process boundaries is the host platform's
//! job; within a process both roles hold [`Node`] handles to the same tree.
//!
//! # Model
//!
//! ```text
//! root (container)
//! ├── @health = 100            attribute
//! ├── name    (string leaf)    scalar leaf node
//! └── stats   (container)      nested structure
//!     └── @level = 3
//! ```
//!
//! - Attributes hold scalars under valid names; references and transforms
//!   are not attribute storable.
//! - Leaf nodes hold exactly one value of their [`crate::LeafKind`].
//! - Signals: attribute changed, value changed, child added, child removed,
//!   destroying. Listeners get a [`Subscription`]; dropping it disconnects.

mod node;
mod signal;

pub use node::{is_valid_attribute_name, Node, NodeClass, NodeId, WeakNode, MAX_ATTRIBUTE_NAME_LEN};
pub use signal::{Subscription, SubscriptionGroup};

use thiserror::Error;

use crate::kind::LeafKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node '{0}' has been destroyed")]
    Destroyed(String),
    #[error("invalid attribute name '{0}'")]
    InvalidAttributeName(String),
    #[error("attribute '{name}' cannot store {kind} values")]
    AttributeRejected { name: String, kind: String },
    #[error("{expected} leaf cannot hold a {actual} value")]
    LeafKindMismatch { expected: LeafKind, actual: String },
    #[error("node '{0}' is a container and holds no value")]
    NotALeaf(String),
    #[error("cannot parent '{0}' under itself or one of its descendants")]
    CyclicParent(String),
}
