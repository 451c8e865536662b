// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leaf-kind classification.
//!
//! Every scalar that crosses into the node tree is classified into exactly
//! one [`LeafKind`]. The kind decides which leaf node type backs the value
//! when attribute storage rejects it, and which kind of key-identity node a
//! keyed binder creates.
//!
//! # Example
//!
//! ```
//! use tree_bridge::{classify, LeafKind, Value};
//!
//! assert_eq!(classify(&Value::from(3)).unwrap(), LeafKind::Integer);
//! assert_eq!(classify(&Value::from(3.5)).unwrap(), LeafKind::Float);
//! assert!(classify(&Value::Nil).is_err());
//! ```

use std::fmt;

use crate::error::BridgeError;
use crate::value::{is_integral, Value};

/// The supported scalar leaf kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafKind {
    String,
    Integer,
    Float,
    Boolean,
    /// Opaque reference to another node.
    Reference,
    Vector2,
    Vector3,
    Transform,
}

impl LeafKind {
    pub const ALL: [LeafKind; 8] = [
        LeafKind::String,
        LeafKind::Integer,
        LeafKind::Float,
        LeafKind::Boolean,
        LeafKind::Reference,
        LeafKind::Vector2,
        LeafKind::Vector3,
        LeafKind::Transform,
    ];

    /// Label used for metrics and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafKind::String => "string",
            LeafKind::Integer => "integer",
            LeafKind::Float => "float",
            LeafKind::Boolean => "boolean",
            LeafKind::Reference => "reference",
            LeafKind::Vector2 => "vector2",
            LeafKind::Vector3 => "vector3",
            LeafKind::Transform => "transform",
        }
    }

    /// Whether a leaf node of this kind can hold `value`.
    ///
    /// Float leaves accept integral numbers too; every other kind needs an
    /// exact match.
    pub fn accepts(&self, value: &Value) -> bool {
        match classify(value) {
            Ok(LeafKind::Integer) => matches!(self, LeafKind::Integer | LeafKind::Float),
            Ok(kind) => kind == *self,
            Err(_) => false,
        }
    }

    /// Whether node attributes can store values of this kind.
    pub fn attribute_storable(&self) -> bool {
        !matches!(self, LeafKind::Reference | LeafKind::Transform)
    }
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a scalar value.
///
/// Numbers that are finite, integral and within `i64` range are
/// [`LeafKind::Integer`]; every other number is [`LeafKind::Float`].
/// `Nil` and tables are not leaves and fail with
/// [`BridgeError::UnsupportedKind`].
pub fn classify(value: &Value) -> Result<LeafKind, BridgeError> {
    match value {
        Value::Str(_) => Ok(LeafKind::String),
        Value::Number(n) if is_integral(*n) => Ok(LeafKind::Integer),
        Value::Number(_) => Ok(LeafKind::Float),
        Value::Bool(_) => Ok(LeafKind::Boolean),
        Value::Ref(_) => Ok(LeafKind::Reference),
        Value::Vector2(_) => Ok(LeafKind::Vector2),
        Value::Vector3(_) => Ok(LeafKind::Vector3),
        Value::Transform(_) => Ok(LeafKind::Transform),
        Value::Nil | Value::Table(_) => Err(BridgeError::UnsupportedKind {
            value: value.to_string(),
            type_name: value.type_name(),
        }),
    }
}
