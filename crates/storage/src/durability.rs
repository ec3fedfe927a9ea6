//! Durability mode for journal writes.
//!
//! Defines when committed write sets reach stable storage.

use quarry_core::{Error, Result};

/// Durability mode for commits.
///
/// | Mode | Journal | fsync |
/// |------|---------|-------|
/// | InMemory | none | never |
/// | Standard | appended and flushed to the OS | never (OS decides) |
/// | Always | appended | after every commit |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No persistence - all data lost when the environment is dropped.
    ///
    /// Use case: tests, caches, ephemeral indexes.
    InMemory,

    /// Journal records are written on every commit but not fsynced.
    ///
    /// Survives a process crash, may lose the tail on power loss.
    Standard,

    /// fsync after every commit (slow, maximum durability).
    Always,
}

impl DurabilityMode {
    /// Check if this mode writes a journal.
    pub fn requires_journal(&self) -> bool {
        !matches!(self, DurabilityMode::InMemory)
    }

    /// Check if this mode requires fsync on every commit.
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Parse the configuration file spelling (`"standard"` / `"always"`).
    ///
    /// # Errors
    ///
    /// Returns `Config` for any other string.
    pub fn from_config_str(value: &str) -> Result<Self> {
        match value {
            "standard" => Ok(DurabilityMode::Standard),
            "always" => Ok(DurabilityMode::Always),
            "memory" => Ok(DurabilityMode::InMemory),
            other => Err(Error::Config(format!(
                "invalid durability mode '{}', expected \"standard\" or \"always\"",
                other
            ))),
        }
    }

    /// Human-readable description of the mode.
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::InMemory => "No persistence (all data lost on close)",
            DurabilityMode::Standard => "Journaled, OS-buffered",
            DurabilityMode::Always => "Journaled, fsync on every commit",
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Standard
    }
}
