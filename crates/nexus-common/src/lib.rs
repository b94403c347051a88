//! # nexus-common
//!
//! Common types and configuration shared by the NexusDB lock manager and its
//! deadlock detector.
//!
//! This crate provides the foundational types used across the transaction
//! layer. It includes:
//!
//! - **Types**: Dense slot identifiers (`TranIndex`, `TranGroupIndex`)
//! - **Config**: Deadlock detection configuration (`DeadlockConfig`)
//! - **Constants**: Pruning defaults and table limits
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::config::DeadlockConfig;
//! use nexus_common::types::{TranGroupIndex, TranIndex};
//!
//! let waiter = TranIndex::new(1);
//! let group = TranGroupIndex::new(0);
//! let config = DeadlockConfig::default();
//! assert!(config.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::DeadlockConfig;
pub use constants::*;
pub use types::{TranGroupIndex, TranIndex};
