//! # nexus-deadlock
//!
//! Wait-for graph deadlock detector for the NexusDB lock manager.
//!
//! The lock manager records who waits for whom; the detector searches those
//! relationships for cycles and hands them back so the caller can break them.
//!
//! - **Wait Graph**: one node per transaction slot, with wait edges kept in
//!   an arena and listed from both endpoints.
//!
//! - **Transaction Groups**: resources held collectively by several
//!   transactions, a hyper-edge generalization of a wait edge.
//!
//! - **Ordinary Cycles**: iterative depth-first search enumerating
//!   elementary cycles, bounded by per-region and per-run caps.
//!
//! - **Group Cycles**: reachability search declaring a deadlock when every
//!   holder of the groups reached is itself blocked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    DeadlockDetector                      │
//! │                 RwLock<graph + groups>                   │
//! │          │                              │                │
//! │          ▼                              ▼                │
//! │  ┌───────────────┐             ┌──────────────────┐      │
//! │  │   WaitGraph   │◄────────────│  TranGroupTable  │      │
//! │  └───────────────┘             └──────────────────┘      │
//! │          │                              │                │
//! │          ▼                              ▼                │
//! │  ┌───────────────┐             ┌──────────────────┐      │
//! │  │ ordinary DFS  │ ──────────► │ tran-group search│      │
//! │  └───────────────┘             └──────────────────┘      │
//! │                     CycleReport                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use nexus_common::types::TranIndex;
//! use nexus_deadlock::{CycleCase, DeadlockDetector};
//!
//! let detector = DeadlockDetector::new();
//! detector.grow(3).unwrap();
//!
//! let (t1, t2, t3) = (TranIndex::new(0), TranIndex::new(1), TranIndex::new(2));
//! detector.add_wait(t1, &[t2], None).unwrap();
//! detector.add_wait(t2, &[t3], None).unwrap();
//! detector.add_wait(t3, &[t1], None).unwrap();
//!
//! let report = detector.detect();
//! assert_eq!(report.case(), CycleCase::Yes);
//! assert_eq!(report.cycles()[0].len(), 3);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Cycle records.
///
/// This module provides:
/// - [`cycle::CycleReport`]: Result of a detection run
/// - [`cycle::Cycle`]: One deadlock and its participants
/// - [`cycle::CycleResolver`]: Hook that breaks a participant's wait
pub mod cycle;

/// Deadlock detection.
///
/// This module provides:
/// - [`deadlock::DeadlockDetector`]: Owns the graph and runs detection
/// - [`deadlock::DeadlockStats`]: Detection counters
/// - [`deadlock::WfgStatus`]: Size of the graph
pub mod deadlock;

/// Error types.
pub mod error;

/// Wait graph store.
pub mod graph;

/// Transaction group store.
pub mod group;

// Re-export commonly used types

pub use cycle::{
    Cycle, CycleCase, CycleKind, CycleReport, CycleResolver, CycleWaiter, Resolution, ResolverRef,
};
pub use deadlock::{DeadlockDetector, DeadlockStats, WfgStatus};
pub use error::{WfgError, WfgResult};
pub use graph::{NodeStatus, WaitGraph};
pub use group::{TranGroup, TranGroupTable};
