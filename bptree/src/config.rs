//! Engine configuration module.
//!
//! This module provides configuration loading from environment variables.
//!
//! # Environment Variables
//!
//! - `BPTREE_MAX_NODE_SIZE`: Maximum children per inner node and elements per leaf (default: `1000`)
//! - `BPTREE_ARENA_BLOCKS`: Number of node blocks in the arena (default: `65536`)
//! - `BPTREE_DEMO_ELEMENTS`: Number of elements the demo binary bulk-loads (default: `100000`)
//!
//! # Invariants
//!
//! - `max_node_size` is at least 2
//! - `arena_blocks` is at least 2 (block 0 is reserved)

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fan-out of the tree.
    pub max_node_size: usize,
    /// Number of blocks in the arena, including the reserved block 0.
    pub arena_blocks: usize,
    /// Number of elements the demo binary bulk-loads.
    pub demo_elements: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_size: Self::DEFAULT_MAX_NODE_SIZE,
            arena_blocks: Self::DEFAULT_ARENA_BLOCKS,
            demo_elements: Self::DEFAULT_DEMO_ELEMENTS,
        }
    }
}

impl EngineConfig {
    /// Default fan-out.
    pub const DEFAULT_MAX_NODE_SIZE: usize = 1000;
    /// Default arena size in blocks.
    pub const DEFAULT_ARENA_BLOCKS: usize = 65_536;
    /// Default demo load size.
    pub const DEFAULT_DEMO_ELEMENTS: usize = 100_000;

    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a number, or is below
    /// its minimum.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            max_node_size: load_usize(&lookup, "BPTREE_MAX_NODE_SIZE", Self::DEFAULT_MAX_NODE_SIZE, 2)?,
            arena_blocks: load_usize(&lookup, "BPTREE_ARENA_BLOCKS", Self::DEFAULT_ARENA_BLOCKS, 2)?,
            demo_elements: load_usize(&lookup, "BPTREE_DEMO_ELEMENTS", Self::DEFAULT_DEMO_ELEMENTS, 0)?,
        })
    }
}

/// Load a numeric variable.
///
/// Returns the default if not set.
fn load_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    min: usize,
) -> Result<usize, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let parsed = value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })?;
    if parsed < min {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("must be at least {min}, got {parsed}"),
        });
    }
    Ok(parsed)
}
