// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dynamic values that flow through binders and readers.
//!
//! A [`Value`] is either a scalar (one of the leaf kinds understood by
//! [`crate::kind::classify`]), a nested [`Table`], or [`Value::Nil`], which
//! stands for "absent" and is how removals are written.
//!
//! Values are totally ordered (floats compare with `total_cmp`) so that any
//! value, including geometry, can be used as a table key.
//!
//! # Example
//!
//! ```
//! use tree_bridge::{table, Value};
//!
//! let data = table! {
//!     "name" => "crate",
//!     "count" => 3,
//!     "nested" => table! { "ok" => true },
//! };
//!
//! let table = data.as_table().unwrap();
//! assert_eq!(table[&Value::from("count")], Value::Number(3.0));
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

use crate::tree::{Node, NodeId};

/// Nested structure: logical key to value.
pub type Table = BTreeMap<Value, Value>;

/// Two-component geometry value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn components(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

/// Three-component geometry value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn components(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Position plus a row-major 3x3 rotation matrix (12 components).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vector3,
    pub rotation: [f64; 9],
}

impl Transform {
    pub const IDENTITY_ROTATION: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    /// Pure translation.
    pub fn at(position: Vector3) -> Self {
        Self {
            position,
            rotation: Self::IDENTITY_ROTATION,
        }
    }

    fn components(&self) -> [f64; 12] {
        let mut out = [0.0; 12];
        out[..3].copy_from_slice(&self.position.components());
        out[3..].copy_from_slice(&self.rotation);
        out
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(Vector3::default())
    }
}

/// Opaque reference to a node in the host tree.
///
/// Only the identity is carried; references compare by node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(NodeId);

impl NodeRef {
    pub fn of(node: &Node) -> Self {
        Self(node.id())
    }

    pub fn id(&self) -> NodeId {
        self.0
    }
}

/// A dynamic value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absence. Writing `Nil` removes a key.
    #[default]
    Nil,
    Bool(bool),
    /// All numbers are `f64`; integral ones classify as integers.
    Number(f64),
    Str(String),
    Ref(NodeRef),
    Vector2(Vector2),
    Vector3(Vector3),
    Transform(Transform),
    Table(Table),
}

impl Value {
    /// Build a table value from key/value pairs.
    pub fn table<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Table(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Runtime type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Ref(_) => "reference",
            Value::Vector2(_) => "Vector2",
            Value::Vector3(_) => "Vector3",
            Value::Transform(_) => "Transform",
            Value::Table(_) => "table",
        }
    }

    /// Name of the node (or attribute) a key is materialized under.
    ///
    /// Integral numbers render without a fractional part so that they
    /// round-trip through [`Value::from_node_name`].
    pub fn to_node_name(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Number(n) if is_integral(*n) => format!("{}", *n as i64),
            other => other.to_string(),
        }
    }

    /// Canonical key for a node or attribute name: names that parse as
    /// finite numbers become numeric keys, everything else stays a string.
    pub fn from_node_name(name: &str) -> Self {
        match name.parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::Str(name.to_string()),
        }
    }

    /// The key this key reads back as once written under its node name.
    /// Only strings and numbers have names; other kinds return `None`.
    pub fn canonical_name_key(&self) -> Option<Value> {
        match self {
            Value::Str(_) | Value::Number(_) => Some(Value::from_node_name(&self.to_node_name())),
            _ => None,
        }
    }

    /// Convert to JSON.
    ///
    /// Tables whose keys are exactly `1..=n` become arrays; other tables
    /// become objects keyed by [`Value::to_node_name`].
    pub fn to_json(&self) -> Json {
        match self {
            Value::Nil => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) if is_integral(*n) => Json::from(*n as i64),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Ref(r) => serde_json::json!({ "ref": r.id().get() }),
            Value::Vector2(v) => Json::from(v.components().to_vec()),
            Value::Vector3(v) => Json::from(v.components().to_vec()),
            Value::Transform(t) => Json::from(t.components().to_vec()),
            Value::Table(t) => {
                if is_sequence(t) {
                    Json::Array(t.values().map(Value::to_json).collect())
                } else {
                    Json::Object(
                        t.iter()
                            .map(|(k, v)| (k.to_node_name(), v.to_json()))
                            .collect(),
                    )
                }
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Str(_) => 3,
            Value::Ref(_) => 4,
            Value::Vector2(_) => 5,
            Value::Vector3(_) => 6,
            Value::Transform(_) => 7,
            Value::Table(_) => 8,
        }
    }
}

/// True for finite numbers that fit an `i64` and equal their own rounding.
pub(crate) fn is_integral(n: f64) -> bool {
    n.is_finite() && n == n.round() && n.abs() < 9.223_372_036_854_776e18
}

fn is_sequence(table: &Table) -> bool {
    !table.is_empty()
        && table
            .keys()
            .enumerate()
            .all(|(i, k)| matches!(k, Value::Number(n) if *n == (i + 1) as f64))
}

fn cmp_components(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Vector2(a), Value::Vector2(b)) => {
                cmp_components(&a.components(), &b.components())
            }
            (Value::Vector3(a), Value::Vector3(b)) => {
                cmp_components(&a.components(), &b.components())
            }
            (Value::Transform(a), Value::Transform(b)) => {
                cmp_components(&a.components(), &b.components())
            }
            (Value::Table(a), Value::Table(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Ref(r) => write!(f, "ref:{}", r.id().get()),
            Value::Vector2(v) => write!(f, "{}, {}", v.x, v.y),
            Value::Vector3(v) => write!(f, "{}, {}, {}", v.x, v.y, v.z),
            Value::Transform(t) => {
                let parts: Vec<String> = t.components().iter().map(f64::to_string).collect();
                write!(f, "{}", parts.join(", "))
            }
            Value::Table(t) => write!(f, "table({} keys)", t.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<NodeRef> for Value {
    fn from(r: NodeRef) -> Self {
        Value::Ref(r)
    }
}

impl From<Vector2> for Value {
    fn from(v: Vector2) -> Self {
        Value::Vector2(v)
    }
}

impl From<Vector3> for Value {
    fn from(v: Vector3) -> Self {
        Value::Vector3(v)
    }
}

impl From<Transform> for Value {
    fn from(t: Transform) -> Self {
        Value::Transform(t)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// JSON arrays become tables keyed `1..=n`; `null` becomes `Nil`.
impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => n.as_f64().map_or(Value::Nil, Value::Number),
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::Table(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (Value::Number((i + 1) as f64), Value::from(v)))
                    .filter(|(_, v)| !v.is_nil())
                    .collect(),
            ),
            Json::Object(map) => Value::Table(
                map.into_iter()
                    .map(|(k, v)| (Value::from_node_name(&k), Value::from(v)))
                    .filter(|(_, v)| !v.is_nil())
                    .collect(),
            ),
        }
    }
}

/// Build a [`Value::Table`] from `key => value` pairs.
#[macro_export]
macro_rules! table {
    () => {
        $crate::Value::Table($crate::Table::new())
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut table = $crate::Table::new();
        $(
            table.insert($crate::Value::from($key), $crate::Value::from($value));
        )+
        $crate::Value::Table(table)
    }};
}
