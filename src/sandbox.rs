//! Execution limits for safe script execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

// Default limits
pub const DEFAULT_MAX_OPERATIONS: u64 = 5_000_000;
pub const DEFAULT_DEADLINE_MS: u64 = 5_000;
pub const DEFAULT_MAX_STRING_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_ARRAY_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MAP_SIZE: usize = 100_000;
pub const DEFAULT_MAX_CALL_LEVELS: usize = 64;
pub const DEFAULT_MAX_EXPR_DEPTH: usize = 64;

// Profiles
pub const QUICK_MAX_OPERATIONS: u64 = 100_000;
pub const QUICK_DEADLINE_MS: u64 = 1_000;
pub const EXTENDED_MAX_OPERATIONS: u64 = 100_000_000;
pub const EXTENDED_DEADLINE_MS: u64 = 30_000;

/// Limits applied to a single execution
///
/// A value of `0` for `max_operations` or any size limit means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Maximum number of script operations (stops runaway loops in-process)
    pub max_operations: u64,
    /// Wall-clock budget in milliseconds
    pub deadline_ms: u64,
    /// Maximum string size in bytes
    pub max_string_size: usize,
    /// Maximum array (and blob) length
    pub max_array_size: usize,
    /// Maximum map size
    pub max_map_size: usize,
    /// Maximum function call nesting
    pub max_call_levels: usize,
    /// Maximum expression nesting depth
    pub max_expr_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            deadline_ms: DEFAULT_DEADLINE_MS,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
            max_call_levels: DEFAULT_MAX_CALL_LEVELS,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
        }
    }
}

impl ExecutionLimits {
    /// Create new limits with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight limits for smoke tests of freshly authored scripts
    pub fn quick() -> Self {
        Self {
            max_operations: QUICK_MAX_OPERATIONS,
            deadline_ms: QUICK_DEADLINE_MS,
            ..Default::default()
        }
    }

    /// Generous limits for heavy inputs
    pub fn extended() -> Self {
        Self {
            max_operations: EXTENDED_MAX_OPERATIONS,
            deadline_ms: EXTENDED_DEADLINE_MS,
            ..Default::default()
        }
    }

    /// Only the deadline applies; used where a hard kill enforces the budget
    pub fn unbounded_operations(mut self) -> Self {
        self.max_operations = 0;
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Builder: set max operations
    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.max_operations = max;
        self
    }

    /// Builder: set deadline
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    /// Builder: set max string size
    pub fn with_max_string_size(mut self, size: usize) -> Self {
        self.max_string_size = size;
        self
    }

    /// Builder: set max array size
    pub fn with_max_array_size(mut self, size: usize) -> Self {
        self.max_array_size = size;
        self
    }

    /// Builder: set max map size
    pub fn with_max_map_size(mut self, size: usize) -> Self {
        self.max_map_size = size;
        self
    }

    /// Builder: set max call levels
    pub fn with_max_call_levels(mut self, levels: usize) -> Self {
        self.max_call_levels = levels;
        self
    }
}
