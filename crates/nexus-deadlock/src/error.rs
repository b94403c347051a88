//! Wait-for graph error types.
//!
//! This module defines all error types for the deadlock detector.

use std::collections::TryReserveError;
use thiserror::Error;

/// Result type for wait-for graph operations.
pub type WfgResult<T> = Result<T, WfgError>;

/// Errors that can occur while maintaining or searching the wait-for graph.
#[derive(Debug, Error)]
pub enum WfgError {
    /// Memory for a graph structure could not be reserved.
    #[error("out of memory allocating {what}: {source}")]
    OutOfMemory {
        /// The structure being grown.
        what: &'static str,
        /// The allocator failure.
        #[source]
        source: TryReserveError,
    },

    /// The detector configuration was rejected.
    #[error("deadlock detector configuration error: {reason}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// An internal invariant was broken - this indicates a bug.
    #[error("wait-for graph internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl WfgError {
    /// Creates an out of memory error.
    pub fn out_of_memory(what: &'static str, source: TryReserveError) -> Self {
        Self::OutOfMemory { what, source }
    }

    /// Creates a config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the operation later may succeed.
    ///
    /// A failed detection run leaves the graph untouched, so the caller can
    /// simply run detection again once memory pressure eases.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Maps a failed reservation to [`WfgError::OutOfMemory`].
pub(crate) trait ReserveExt {
    /// Attaches the name of the structure being grown.
    fn or_oom(self, what: &'static str) -> WfgResult<()>;
}

impl ReserveExt for Result<(), TryReserveError> {
    #[inline]
    fn or_oom(self, what: &'static str) -> WfgResult<()> {
        #[cfg(test)]
        {
            if fault::should_fail() {
                return Err(WfgError::out_of_memory(what, fault::reserve_error()));
            }
        }
        self.map_err(|source| WfgError::out_of_memory(what, source))
    }
}
