//! Database configuration
//!
//! Thresholds steering the lifecycle agents (log merging, persistence,
//! hard deletion) and the sizes of persisted blocks. Every field has a
//! default; hosts override individual fields with the `with_*` setters or
//! load the whole structure from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TesseraError};

// ============================================================================
// Defaults
// ============================================================================

/// Default byte budget of a persisted data block (32 KB)
const DEFAULT_MAX_BLOCK_SIZE: usize = 32 * 1024;
/// Default byte budget of a persisted metadata block (16 KB)
const DEFAULT_MAX_META_BLOCK_SIZE: usize = 16 * 1024;
/// Format limit: per-column payload lengths are stored as u16
const MAX_SUPPORTED_BLOCK_SIZE: usize = u16::MAX as usize;
const DEFAULT_MAX_LOG_BLOCKS: usize = 8;
const DEFAULT_MAX_IN_MEMORY_ROWS: usize = 4096;
const DEFAULT_MAX_IN_MEMORY_META_ROWS: usize = 256;
const DEFAULT_TOMBSTONE_BUDGET: usize = 1024;
const DEFAULT_HARD_DELETE_TARGET: usize = 4096;
const DEFAULT_HARD_DELETE_BRANCHES: usize = 8;
const DEFAULT_BATCH_WINDOW_MS: u64 = 50;
const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 256;
const DEFAULT_TRUNCATE_TOLERANCE: f64 = 0.02;

// ============================================================================
// DatabaseConfig
// ============================================================================

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Byte budget of a persisted data block
    pub max_block_size: usize,
    /// Byte budget of a persisted metadata block
    pub max_meta_block_size: usize,
    /// In-memory log blocks per table before the merge agent folds them
    pub max_log_blocks: usize,
    /// In-memory data rows per table before excess persistence kicks in
    pub max_in_memory_rows: usize,
    /// In-memory rows per metadata table before it persists
    pub max_in_memory_meta_rows: usize,
    /// Outstanding tombstones before excess hard deletion kicks in
    pub tombstone_budget: usize,
    /// Tombstones a policy-driven hard delete tries to resolve per run
    pub hard_delete_target: usize,
    /// Branches a policy-driven hard delete rewrites per table
    pub hard_delete_branches: usize,
    /// How long the lifecycle worker gathers triggers into one batch
    pub batch_window_ms: u64,
    /// Decoded blocks kept in the block cache
    pub block_cache_capacity: usize,
    /// Relative slack accepted when truncating a block to a byte budget
    pub truncate_tolerance: f64,
    /// Whether commits wake the lifecycle worker
    pub background_lifecycle: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_meta_block_size: DEFAULT_MAX_META_BLOCK_SIZE,
            max_log_blocks: DEFAULT_MAX_LOG_BLOCKS,
            max_in_memory_rows: DEFAULT_MAX_IN_MEMORY_ROWS,
            max_in_memory_meta_rows: DEFAULT_MAX_IN_MEMORY_META_ROWS,
            tombstone_budget: DEFAULT_TOMBSTONE_BUDGET,
            hard_delete_target: DEFAULT_HARD_DELETE_TARGET,
            hard_delete_branches: DEFAULT_HARD_DELETE_BRANCHES,
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            block_cache_capacity: DEFAULT_BLOCK_CACHE_CAPACITY,
            truncate_tolerance: DEFAULT_TRUNCATE_TOLERANCE,
            background_lifecycle: true,
        }
    }
}

impl DatabaseConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("max_block_size", self.max_block_size),
            ("max_meta_block_size", self.max_meta_block_size),
        ] {
            if size == 0 || size > MAX_SUPPORTED_BLOCK_SIZE {
                return Err(TesseraError::Config(format!(
                    "{} must be in 1..={}, got {}",
                    name, MAX_SUPPORTED_BLOCK_SIZE, size
                )));
            }
        }
        if self.max_log_blocks == 0 {
            return Err(TesseraError::Config(
                "max_log_blocks must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.truncate_tolerance) {
            return Err(TesseraError::Config(format!(
                "truncate_tolerance must be in [0, 1), got {}",
                self.truncate_tolerance
            )));
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn with_max_meta_block_size(mut self, bytes: usize) -> Self {
        self.max_meta_block_size = bytes;
        self
    }

    pub fn with_max_log_blocks(mut self, blocks: usize) -> Self {
        self.max_log_blocks = blocks;
        self
    }

    pub fn with_max_in_memory_rows(mut self, rows: usize) -> Self {
        self.max_in_memory_rows = rows;
        self
    }

    pub fn with_max_in_memory_meta_rows(mut self, rows: usize) -> Self {
        self.max_in_memory_meta_rows = rows;
        self
    }

    pub fn with_tombstone_budget(mut self, tombstones: usize) -> Self {
        self.tombstone_budget = tombstones;
        self
    }

    pub fn with_hard_delete_target(mut self, tombstones: usize) -> Self {
        self.hard_delete_target = tombstones;
        self
    }

    pub fn with_hard_delete_branches(mut self, branches: usize) -> Self {
        self.hard_delete_branches = branches;
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_block_cache_capacity(mut self, blocks: usize) -> Self {
        self.block_cache_capacity = blocks;
        self
    }

    pub fn with_truncate_tolerance(mut self, tolerance: f64) -> Self {
        self.truncate_tolerance = tolerance;
        self
    }

    /// Disable commit-driven lifecycle runs; agents then only run on
    /// explicit `Database::run_lifecycle` calls.
    pub fn with_background_lifecycle(mut self, enabled: bool) -> Self {
        self.background_lifecycle = enabled;
        self
    }

    /// Byte budget for blocks of a table at the given hierarchy level
    /// (0 = data table).
    pub(crate) fn block_budget(&self, level: u32) -> usize {
        if level == 0 {
            self.max_block_size
        } else {
            self.max_meta_block_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_budget(0), 32 * 1024);
        assert_eq!(config.block_budget(3), 16 * 1024);
    }

    #[test]
    fn test_from_json_partial() {
        let config = DatabaseConfig::from_json(r#"{"max_block_size": 1024, "max_log_blocks": 2}"#)
            .unwrap();
        assert_eq!(config.max_block_size, 1024);
        assert_eq!(config.max_log_blocks, 2);
        assert_eq!(config.max_in_memory_rows, DEFAULT_MAX_IN_MEMORY_ROWS);
    }

    #[test]
    fn test_validate_rejects_oversized_blocks() {
        let config = DatabaseConfig::default().with_max_block_size(1 << 20);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
        assert!(err.is_user_error() && !err.is_fatal());
        assert!(matches!(
            DatabaseConfig::from_json(r#"{"truncate_tolerance": 2.0}"#),
            Err(TesseraError::Config(_))
        ));
        assert!(matches!(
            DatabaseConfig::default().with_max_log_blocks(0).validate(),
            Err(TesseraError::Config(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = DatabaseConfig::default()
            .with_batch_window(Duration::from_millis(5))
            .with_background_lifecycle(false);
        let parsed = DatabaseConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
