//! Deadlock detector configuration.
//!
//! The detector enumerates elementary cycles, and a dense wait-for graph can
//! hold far more of them than anyone needs to break a deadlock. These caps
//! bound a single detection run.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_INITIAL_TRANSACTIONS, DEFAULT_MAX_CYCLES_PER_REGION, DEFAULT_MAX_TOTAL_CYCLES,
    MAX_TRANSACTION_SLOTS, UNLIMITED_CYCLES,
};

/// Deadlock detection configuration.
///
/// A cap of `0` means unlimited.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::DeadlockConfig;
///
/// let config = DeadlockConfig::default()
///     .with_max_cycles_per_region(4)
///     .with_max_total_cycles(16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Elementary cycles recorded within one connected region before the
    /// search of that region is pruned.
    /// Default: 10
    pub max_cycles_per_region: usize,

    /// Cycles recorded across all regions in one detection run.
    /// Default: 100
    pub max_total_cycles: usize,

    /// Transaction slots reserved in the node table at construction.
    /// Default: 0
    pub initial_capacity: usize,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            max_cycles_per_region: DEFAULT_MAX_CYCLES_PER_REGION,
            max_total_cycles: DEFAULT_MAX_TOTAL_CYCLES,
            initial_capacity: DEFAULT_INITIAL_TRANSACTIONS,
        }
    }
}

impl DeadlockConfig {
    /// Creates a configuration that never prunes.
    ///
    /// Used for diagnostic dumps, where completeness matters more than
    /// latency.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_cycles_per_region: UNLIMITED_CYCLES,
            max_total_cycles: UNLIMITED_CYCLES,
            ..Default::default()
        }
    }

    /// Sets the per-region cycle cap.
    #[must_use]
    pub fn with_max_cycles_per_region(mut self, max: usize) -> Self {
        self.max_cycles_per_region = max;
        self
    }

    /// Sets the global cycle cap.
    #[must_use]
    pub fn with_max_total_cycles(mut self, max: usize) -> Self {
        self.max_total_cycles = max;
        self
    }

    /// Sets the number of transaction slots reserved up front.
    #[must_use]
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Returns true if neither cap is set.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_cycles_per_region == UNLIMITED_CYCLES && self.max_total_cycles == UNLIMITED_CYCLES
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_cycles_per_region != UNLIMITED_CYCLES
            && self.max_total_cycles != UNLIMITED_CYCLES
            && self.max_cycles_per_region > self.max_total_cycles
        {
            return Err(format!(
                "max_cycles_per_region ({}) must not exceed max_total_cycles ({})",
                self.max_cycles_per_region, self.max_total_cycles
            ));
        }

        if self.initial_capacity > MAX_TRANSACTION_SLOTS {
            return Err(format!(
                "initial_capacity ({}) exceeds the {} addressable transaction slots",
                self.initial_capacity, MAX_TRANSACTION_SLOTS
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeadlockConfig::default();
        assert_eq!(config.max_cycles_per_region, 10);
        assert_eq!(config.max_total_cycles, 100);
        assert!(!config.is_unbounded());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unbounded_config() {
        let config = DeadlockConfig::unbounded();
        assert!(config.is_unbounded());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = DeadlockConfig::default()
            .with_max_cycles_per_region(50)
            .with_max_total_cycles(5);
        assert!(config.validate().is_err());

        // An unlimited global cap accepts any region cap
        let config = config.with_max_total_cycles(UNLIMITED_CYCLES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: DeadlockConfig =
            serde_json::from_str(r#"{ "max_cycles_per_region": 3 }"#).unwrap();
        assert_eq!(config.max_cycles_per_region, 3);
        assert_eq!(config.max_total_cycles, DEFAULT_MAX_TOTAL_CYCLES);
        assert_eq!(config.initial_capacity, 0);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"max_total_cycles\":100"));
    }
}
