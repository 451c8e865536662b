//! Configuration for the bridge.
//!
//! # Example
//!
//! ```
//! use tree_bridge::{BridgeConfig, Role};
//!
//! // Minimal config (uses defaults)
//! let config = BridgeConfig::default();
//! assert_eq!(config.default_depth, 100);
//! assert_eq!(config.role, Role::Observer);
//!
//! // Authority side with a shallower default depth
//! let config = BridgeConfig {
//!     role: Role::Authority,
//!     default_depth: 8,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::bridger::Role;
use crate::structure::Variant;

/// Configuration for the bridge.
///
/// All fields have defaults, so an empty JSON object deserializes to
/// [`BridgeConfig::default()`].
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Which side this process plays (default: observer)
    #[serde(default)]
    pub role: Role,

    /// Tree layout used by the bridger (default: named)
    #[serde(default)]
    pub variant: Variant,

    /// Depth budget when none is given (default: 100)
    #[serde(default = "default_depth")]
    pub default_depth: usize,

    /// How long `Reader::wait` waits for a key (default: 30s)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// How often `Reader::wait` polls the mirror (default: 100ms)
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
}

fn default_depth() -> usize { crate::DEFAULT_DEPTH }
fn default_wait_timeout_ms() -> u64 { 30_000 }
fn default_wait_poll_ms() -> u64 { 100 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            variant: Variant::default(),
            default_depth: default_depth(),
            wait_timeout_ms: default_wait_timeout_ms(),
            wait_poll_ms: default_wait_poll_ms(),
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(self.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.wait_poll_ms.max(1)),
        }
    }
}

/// Timing for `wait`, inherited by nested readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        BridgeConfig::default().wait_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.role, Role::Observer);
        assert_eq!(config.variant, Variant::Named);
        assert_eq!(config.default_depth, 100);
        assert_eq!(config.wait_policy(), WaitPolicy::default());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"role": "authority", "variant": "keyed", "wait_timeout_ms": 500}"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Authority);
        assert_eq!(config.variant, Variant::Keyed);
        assert_eq!(config.wait_policy().timeout, Duration::from_millis(500));
        assert_eq!(config.wait_policy().poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_default_wait_policy() {
        let policy = WaitPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.poll_interval, Duration::from_millis(100));
    }
}
