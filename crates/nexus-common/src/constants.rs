//! System-wide constants for the deadlock detector.
//!
//! These values bound how much work a single detection run may do.

// =============================================================================
// Cycle Pruning
// =============================================================================

/// Maximum elementary cycles recorded within one connected region.
///
/// A densely connected region can hold a combinatorial number of elementary
/// cycles over the same few transactions. Aborting one participant usually
/// breaks most of them, so enumerating past a handful is wasted effort.
pub const DEFAULT_MAX_CYCLES_PER_REGION: usize = 10;

/// Maximum cycles reported by a single detection run.
pub const DEFAULT_MAX_TOTAL_CYCLES: usize = 100;

/// Cap value meaning "no limit".
pub const UNLIMITED_CYCLES: usize = 0;

// =============================================================================
// Table Sizing
// =============================================================================

/// Node table size reserved when no capacity is configured.
pub const DEFAULT_INITIAL_TRANSACTIONS: usize = 0;

/// Upper bound on transaction slots a node table may cover.
///
/// Transaction indices are `u32`; the graph never grows past this.
pub const MAX_TRANSACTION_SLOTS: usize = u32::MAX as usize;
