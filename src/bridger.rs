//! Role dispatch: one entry point for both sides of the bridge.
//!
//! The authority process materializes its data with a [`Binder`]; every
//! observer process reads the same node with a [`Reader`]. Application code
//! calls [`Bridger::bridge`] in both places and gets back a [`Bridge`] with
//! the shared observation surface.
//!
//! # Example
//!
//! ```
//! use tree_bridge::{table, BridgeConfig, Bridger, Node, Role, Structure, Table, Value};
//!
//! let node = Node::container("match");
//! let data = table! { "round" => 1 };
//!
//! let authority = Bridger::new(BridgeConfig { role: Role::Authority, ..Default::default() });
//! let bridge = authority
//!     .bridge(data.as_table().unwrap().clone(), &node, &Table::new(), None)
//!     .unwrap();
//! assert!(bridge.as_binder().is_some());
//!
//! let observer = Bridger::new(BridgeConfig::default());
//! let view = observer.bridge(Table::new(), &node, &Table::new(), None).unwrap();
//! assert_eq!(view.lookup(&Value::from("round")), Some(Value::from(1)));
//! ```

use serde::Deserialize;
use tracing::info;

use crate::binder::Binder;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::reader::Reader;
use crate::structure::{Dispatcher, Structure, StructureBase};
use crate::tree::Node;
use crate::value::{Table, Value};

/// Which side of the bridge this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the data and writes it into the tree.
    Authority,
    /// Mirrors what the authority wrote.
    #[default]
    Observer,
}

/// Builds the right structure for the configured role.
#[derive(Debug, Clone, Default)]
pub struct Bridger {
    config: BridgeConfig,
}

impl Bridger {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bind (authority) or read (observer) `node`.
    ///
    /// `data` and `skeleton` are only used on the authority side. `depth`
    /// falls back to the configured default.
    #[tracing::instrument(skip(self, data, node, skeleton), fields(node = %node.name(), role = ?self.config.role))]
    pub fn bridge(
        &self,
        data: Table,
        node: &Node,
        skeleton: &Table,
        depth: Option<usize>,
    ) -> Result<Bridge, BridgeError> {
        let depth = depth.unwrap_or(self.config.default_depth);
        let dispatcher = Dispatcher::current();
        let wait_policy = self.config.wait_policy();

        let bridge = match self.config.role {
            Role::Authority => Bridge::Binder(Binder::assemble(
                data,
                node,
                skeleton,
                depth,
                self.config.variant,
                dispatcher,
                wait_policy,
            )?),
            Role::Observer => Bridge::Reader(Reader::open(
                node,
                depth,
                self.config.variant,
                dispatcher,
                wait_policy,
            )?),
        };
        info!(depth, variant = self.config.variant.as_str(), "bridge established");
        Ok(bridge)
    }
}

/// Either side of the bridge behind one observation surface.
#[derive(Clone, Debug)]
pub enum Bridge {
    Binder(Binder),
    Reader(Reader),
}

impl Bridge {
    pub fn as_binder(&self) -> Option<&Binder> {
        match self {
            Bridge::Binder(b) => Some(b),
            Bridge::Reader(_) => None,
        }
    }

    pub fn as_reader(&self) -> Option<&Reader> {
        match self {
            Bridge::Reader(r) => Some(r),
            Bridge::Binder(_) => None,
        }
    }
}

impl Structure for Bridge {
    fn base(&self) -> &StructureBase {
        match self {
            Bridge::Binder(b) => b.base(),
            Bridge::Reader(r) => r.base(),
        }
    }

    fn node(&self) -> &Node {
        match self {
            Bridge::Binder(b) => b.node(),
            Bridge::Reader(r) => r.node(),
        }
    }

    fn raw(&self) -> Table {
        match self {
            Bridge::Binder(b) => b.raw(),
            Bridge::Reader(r) => r.raw(),
        }
    }

    fn lookup(&self, key: &Value) -> Option<Value> {
        match self {
            Bridge::Binder(b) => b.lookup(key),
            Bridge::Reader(r) => r.lookup(key),
        }
    }

    fn destroy(&self) {
        match self {
            Bridge::Binder(b) => b.destroy(),
            Bridge::Reader(r) => r.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Variant;
    use crate::table;

    fn config(role: Role, variant: Variant) -> BridgeConfig {
        BridgeConfig {
            role,
            variant,
            ..Default::default()
        }
    }

    #[test]
    fn test_role_selects_side() {
        let node = Node::container("root");
        let data = table! { "a" => 1 }.as_table().cloned().unwrap();

        let authority = Bridger::new(config(Role::Authority, Variant::Named));
        let bound = authority.bridge(data, &node, &Table::new(), None).unwrap();
        assert!(bound.as_binder().is_some());
        assert_eq!(bound.depth(), 100);

        let observer = Bridger::new(config(Role::Observer, Variant::Named));
        let read = observer.bridge(Table::new(), &node, &Table::new(), Some(3)).unwrap();
        assert!(read.as_reader().is_some());
        assert_eq!(read.depth(), 3);
        assert_eq!(read.lookup(&Value::from("a")), Some(Value::from(1)));
    }

    #[test]
    fn test_observer_ignores_data() {
        let node = Node::container("root");
        let data = table! { "a" => 1 }.as_table().cloned().unwrap();
        let observer = Bridger::new(config(Role::Observer, Variant::Keyed));
        let read = observer.bridge(data, &node, &Table::new(), None).unwrap();

        assert!(read.raw().is_empty());
        assert!(node.attributes().is_empty());
        assert_eq!(read.variant(), Variant::Keyed);
    }

    #[test]
    fn test_wait_policy_flows_from_config() {
        let node = Node::container("root");
        let bridger = Bridger::new(BridgeConfig {
            wait_timeout_ms: 250,
            ..Default::default()
        });
        let read = bridger.bridge(Table::new(), &node, &Table::new(), None).unwrap();
        assert_eq!(
            read.base().wait_policy().timeout,
            std::time::Duration::from_millis(250)
        );
    }
}
