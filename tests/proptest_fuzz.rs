//! Property-based tests (fuzzing) for the bridge.
//!
//! Generates random tables and checks that whatever a binder writes, a
//! reader on the same node mirrors back exactly, and that classification
//! never panics.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;

use tree_bridge::{
    classify, Binder, LeafKind, Node, Reader, Structure, Table, Value, Variant, Vector2, Vector3,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Keys that are valid names, plus some with spaces that force leaf nodes.
fn name_key_strategy() -> impl Strategy<Value = Value> {
    "[a-z][a-z0-9 _]{0,8}".prop_map(Value::from)
}

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        (-1_000_000i64..1_000_000).prop_map(Value::from),
        (-1.0e6f64..1.0e6).prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
        (any::<i16>(), any::<i16>()).prop_map(|(x, y)| Value::from(Vector2::new(x as f64, y as f64))),
        (any::<i16>(), any::<i16>(), any::<i16>())
            .prop_map(|(x, y, z)| Value::from(Vector3::new(x as f64, y as f64, z as f64))),
    ]
}

/// Tables up to two levels deep.
fn named_table_strategy() -> impl Strategy<Value = Table> {
    let nested = prop::collection::btree_map(name_key_strategy(), scalar_strategy(), 0..4)
        .prop_map(Value::Table);
    prop::collection::btree_map(
        name_key_strategy(),
        prop_oneof![3 => scalar_strategy(), 1 => nested],
        0..8,
    )
}

fn keyed_key_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-100i64..100).prop_map(Value::from),
        "[ -~]{0,8}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        (any::<i8>(), any::<i8>(), any::<i8>())
            .prop_map(|(x, y, z)| Value::from(Vector3::new(x as f64, y as f64, z as f64))),
    ]
}

fn keyed_table_strategy() -> impl Strategy<Value = Table> {
    let nested = prop::collection::btree_map(keyed_key_strategy(), scalar_strategy(), 0..4)
        .prop_map(Value::Table);
    prop::collection::btree_map(
        keyed_key_strategy(),
        prop_oneof![3 => scalar_strategy(), 1 => nested],
        0..8,
    )
}

/// `{"n": {"n": ... 1}}` with `levels` tables.
fn chain(levels: usize) -> Value {
    (0..levels).fold(Value::from(1), |inner, _| {
        let mut table = Table::new();
        table.insert(Value::from("n"), inner);
        Value::Table(table)
    })
}

/// Number of tables along the `n` chain.
fn chain_depth(value: &Value) -> usize {
    match value.as_table() {
        Some(table) => 1 + table.get(&Value::from("n")).map_or(0, chain_depth),
        None => 0,
    }
}

// =============================================================================
// Round trips
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Snapshot path: bind first, then read.
    #[test]
    fn prop_named_snapshot_roundtrip(data in named_table_strategy()) {
        let node = Node::container("root");
        let _binder = Binder::new(data.clone(), &node, 100, Variant::Named).unwrap();
        let reader = Reader::new(&node, 100, Variant::Named).unwrap();
        prop_assert_eq!(reader.raw(), data);
    }

    /// Live path: read first, then write key by key.
    #[test]
    fn prop_named_live_roundtrip(first in named_table_strategy(), second in named_table_strategy()) {
        let node = Node::container("root");
        let binder = Binder::new(first, &node, 100, Variant::Named).unwrap();
        let reader = Reader::new(&node, 100, Variant::Named).unwrap();

        binder.replace(second.clone()).unwrap();
        prop_assert_eq!(binder.raw(), second.clone());
        prop_assert_eq!(reader.raw(), second);
    }

    #[test]
    fn prop_keyed_roundtrip(first in keyed_table_strategy(), second in keyed_table_strategy()) {
        let node = Node::container("root");
        let binder = Binder::new(first.clone(), &node, 100, Variant::Keyed).unwrap();
        let reader = Reader::new(&node, 100, Variant::Keyed).unwrap();
        prop_assert_eq!(reader.raw(), first);

        binder.replace(second.clone()).unwrap();
        prop_assert_eq!(reader.raw(), second.clone());
        prop_assert_eq!(node.children().len(), second.len());
    }
}

// =============================================================================
// Depth budget
// =============================================================================

proptest! {
    #[test]
    fn prop_reader_depth_truncates(levels in 1usize..7, depth in 0usize..5) {
        let node = Node::container("root");
        let data = chain(levels);
        let _binder = Binder::new(data.as_table().cloned().unwrap(), &node, 100, Variant::Named).unwrap();
        let reader = Reader::new(&node, depth, Variant::Named).unwrap();

        // Tables past the budget show up as empty tables, once
        let expected = if levels <= depth { levels } else { depth + 1 };
        prop_assert_eq!(chain_depth(&Value::Table(reader.raw())), expected);
    }

    #[test]
    fn prop_binder_depth_truncates(levels in 1usize..7, depth in 1usize..5) {
        let node = Node::container("root");
        let data = chain(levels);
        let binder = Binder::new(data.as_table().cloned().unwrap(), &node, depth, Variant::Named).unwrap();
        let reader = Reader::new(&node, 100, Variant::Named).unwrap();

        let expected = if levels <= depth { levels } else { depth + 1 };
        prop_assert_eq!(chain_depth(&Value::Table(binder.raw())), expected);
        prop_assert_eq!(reader.raw(), binder.raw());
    }
}

// =============================================================================
// Classification
// =============================================================================

proptest! {
    #[test]
    fn prop_classify_numbers_never_panics(n in any::<f64>()) {
        let value = Value::from(n);
        let kind = classify(&value).unwrap();
        prop_assert!(kind == LeafKind::Integer || kind == LeafKind::Float);
        prop_assert!(kind.accepts(&value));
    }

    #[test]
    fn prop_classify_scalars(value in scalar_strategy()) {
        let kind = classify(&value).unwrap();
        prop_assert!(kind.accepts(&value));
    }

    #[test]
    fn prop_node_names_roundtrip_numeric_keys(n in -1_000_000i64..1_000_000) {
        let key = Value::from(n);
        prop_assert_eq!(Value::from_node_name(&key.to_node_name()), key);
    }
}
