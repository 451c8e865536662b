// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tree-bridge.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing a recorder.
//!
//! # Metric Naming Convention
//! - `tree_bridge_` prefix for all metrics
//! - `_total` suffix for counters
//!
//! # Labels
//! - `variant`: named, keyed
//! - `side`: binder, reader
//! - `representation`: attribute, leaf, container, removal
//! - `kind`: leaf kind or callback kind

use metrics::{counter, gauge};

use crate::kind::LeafKind;
use crate::structure::{Side, Variant};

/// Record one write-intercept pass
pub fn record_write(variant: Variant, representation: &'static str) {
    counter!(
        "tree_bridge_writes_total",
        "variant" => variant.as_str(),
        "representation" => representation
    )
    .increment(1);
}

/// Record a write dropped at the depth boundary
pub fn record_truncated_write(variant: Variant) {
    counter!(
        "tree_bridge_truncated_writes_total",
        "variant" => variant.as_str()
    )
    .increment(1);
}

/// Record an attribute rejection recovered by a leaf node
pub fn record_attribute_fallback(kind: LeafKind) {
    counter!(
        "tree_bridge_attribute_fallbacks_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a node created by a binder
pub fn record_node_created(class: &'static str) {
    counter!(
        "tree_bridge_nodes_created_total",
        "class" => class
    )
    .increment(1);
}

/// Record a callback handed to the dispatcher
pub fn record_dispatch(kind: &'static str) {
    counter!(
        "tree_bridge_callbacks_dispatched_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a `wait` that gave up
pub fn record_wait_timeout() {
    counter!("tree_bridge_wait_timeouts_total").increment(1);
}

/// Track a structure coming alive
pub fn structure_opened(side: Side) {
    gauge!("tree_bridge_live_structures", "side" => side.as_str()).increment(1.0);
}

/// Track a structure being destroyed
pub fn structure_closed(side: Side) {
    gauge!("tree_bridge_live_structures", "side" => side.as_str()).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed in unit tests; these only prove the calls
    // are well-formed and never panic.

    #[test]
    fn test_counters() {
        record_write(Variant::Named, "attribute");
        record_write(Variant::Keyed, "container");
        record_truncated_write(Variant::Named);
        record_attribute_fallback(LeafKind::Reference);
        record_node_created("leaf");
        record_dispatch("changed");
        record_wait_timeout();
    }

    #[test]
    fn test_gauges() {
        structure_opened(Side::Reader);
        structure_closed(Side::Reader);
        structure_opened(Side::Binder);
        structure_closed(Side::Binder);
    }
}
