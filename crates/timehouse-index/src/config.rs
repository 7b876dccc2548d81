//! Node Configuration
//!
//! Controls the shape of what the node writes and caches:
//!
//! - **page_size_rows**: rows per data page and trie leaf split threshold
//!   (default: 256)
//! - **compactor_fan_in**: segments merged per compaction step (default: 4)
//! - **buffer_pool_capacity_bytes**: byte budget for cached segment files
//! - **live_leaf_split_rows**: rows before a live-trie leaf splits
//! - **chunk_row_limit**: live rows per table before an automatic flush
//! - **default_tz**: IANA zone name handed to front ends rendering literals;
//!   the core itself computes in microseconds UTC only
//! - **suppress_time_literals**: front-end printer toggle, carried through

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Rows per data page (default: 256)
    #[serde(default = "default_page_size_rows")]
    pub page_size_rows: usize,

    /// Compactor fan-in (default: 4)
    #[serde(default = "default_compactor_fan_in")]
    pub compactor_fan_in: usize,

    /// Buffer pool capacity in bytes (default: 256MB)
    #[serde(default = "default_buffer_pool_capacity")]
    pub buffer_pool_capacity_bytes: u64,

    /// Live-trie leaf split threshold in rows (default: 1024)
    #[serde(default = "default_live_leaf_split_rows")]
    pub live_leaf_split_rows: usize,

    /// Live rows per table before an automatic chunk flush (default: 102400)
    #[serde(default = "default_chunk_row_limit")]
    pub chunk_row_limit: usize,

    /// Default time zone as an IANA name (default: "UTC")
    #[serde(default = "default_tz")]
    pub default_tz: String,

    /// Suppress custom time-literal printers in front ends (default: false)
    #[serde(default)]
    pub suppress_time_literals: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            page_size_rows: default_page_size_rows(),
            compactor_fan_in: default_compactor_fan_in(),
            buffer_pool_capacity_bytes: default_buffer_pool_capacity(),
            live_leaf_split_rows: default_live_leaf_split_rows(),
            chunk_row_limit: default_chunk_row_limit(),
            default_tz: default_tz(),
            suppress_time_literals: false,
        }
    }
}

fn default_page_size_rows() -> usize {
    256
}

fn default_compactor_fan_in() -> usize {
    4
}

fn default_buffer_pool_capacity() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_live_leaf_split_rows() -> usize {
    1024
}

fn default_chunk_row_limit() -> usize {
    100 * 1024
}

fn default_tz() -> String {
    "UTC".to_string()
}

impl NodeConfig {
    /// Basic sanity on construction-time knobs.
    pub fn validate(&self) -> timehouse_core::Result<()> {
        if self.page_size_rows == 0 {
            return Err(timehouse_core::Error::InvalidArgument(
                "page_size_rows must be positive".to_string(),
            ));
        }
        if self.compactor_fan_in < 2 {
            return Err(timehouse_core::Error::InvalidArgument(
                "compactor_fan_in must be at least 2".to_string(),
            ));
        }
        if self.default_tz.is_empty() {
            return Err(timehouse_core::Error::InvalidArgument(
                "default_tz must name an IANA zone".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.page_size_rows, 256);
        assert_eq!(config.compactor_fan_in, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.page_size_rows, 256);
        assert_eq!(config.default_tz, "UTC");
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::default();
        config.page_size_rows = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.compactor_fan_in = 1;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.default_tz = String::new();
        assert!(config.validate().is_err());
    }
}
