//! Type definitions shared by the deadlock detector and its callers.

mod ids;

pub use ids::{TranGroupIndex, TranIndex};
