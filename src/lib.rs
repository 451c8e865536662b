//! # Tree Bridge
//!
//! Replicate nested tables through a host node tree: one authority writes,
//! any number of observers read, and both sides get change callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Authority: Binder                       │
//! │  • Mirrors the caller's table                              │
//! │  • Write intercept: attribute, leaf node, or container     │
//! │  • Nested tables become nested Binders (depth - 1)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (host tree: nodes + attributes)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Observer: Reader                        │
//! │  • Snapshot, then live listeners on the node               │
//! │  • Containers become nested Readers (depth - 1)            │
//! │  • Changes bubble up as full submaps                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides come in two layouts (see [`Variant`]): **named**, where keys
//! are node and attribute names, and **keyed**, where every key is carried
//! by a key-identity node so references and geometry can be keys.
//!
//! ## Quick Start
//!
//! ```rust
//! use tree_bridge::{table, Binder, Node, Reader, Structure, Value, Variant};
//!
//! let node = Node::container("player");
//! let data = table! { "health" => 100, "stats" => table! { "level" => 3 } };
//!
//! let binder = Binder::new(data.as_table().unwrap().clone(), &node, 100, Variant::Named).unwrap();
//! let reader = Reader::new(&node, 100, Variant::Named).unwrap();
//! assert_eq!(Value::Table(reader.raw()), data);
//!
//! binder.set("health", 90).unwrap();
//! assert_eq!(reader.get(&Value::from("health")), Some(Value::from(90)));
//! ```
//!
//! ## Callbacks
//!
//! Callbacks registered through [`Structure`] are spawned onto the tokio
//! runtime that was current when the structure was built. Outside a
//! runtime they run inline once the triggering mutation has completed.
//!
//! ## Configuration
//!
//! See [`BridgeConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`tree`]: In-process host tree (nodes, attributes, signals)
//! - [`binder`]: Authority side
//! - [`reader`]: Observer side
//! - [`bridger`]: Role dispatch
//! - [`structure`]: Observation surface shared by all of the above

pub mod binder;
pub mod bridger;
pub mod config;
pub mod error;
pub mod kind;
pub mod metrics;
pub mod reader;
pub mod structure;
pub mod tree;
pub mod value;

/// Depth budget used when none is given.
pub const DEFAULT_DEPTH: usize = 100;

pub use binder::Binder;
pub use bridger::{Bridge, Bridger, Role};
pub use config::{BridgeConfig, WaitPolicy};
pub use error::BridgeError;
pub use kind::{classify, LeafKind};
pub use reader::Reader;
pub use structure::{Slot, Structure, Variant};
pub use tree::{Node, NodeError, Subscription, SubscriptionGroup};
pub use value::{NodeRef, Table, Transform, Value, Vector2, Vector3};
