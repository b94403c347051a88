//! Configuration for the deadlock detector.

mod deadlock;

pub use deadlock::DeadlockConfig;
