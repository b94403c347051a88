//! Core identifier types for the deadlock detector.
//!
//! These types provide type-safe wrappers around dense slot indices,
//! preventing a transaction slot from being confused with a group slot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction index - the dense slot a live transaction occupies.
///
/// The lock manager hands out transaction slots in `[0, N)` and reuses them
/// once a transaction finishes. The wait-for graph keeps one node per slot,
/// so indices are expected to stay small and dense.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::TranIndex;
///
/// let tran = TranIndex::new(7);
/// assert_eq!(tran.as_usize(), 7);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TranIndex(u32);

impl TranIndex {
    /// Creates a new `TranIndex` from a raw slot number.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize`, for addressing node tables.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TranIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TranIndex({})", self.0)
    }
}

impl fmt::Display for TranIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TranIndex {
    #[inline]
    fn from(index: u32) -> Self {
        Self::new(index)
    }
}

impl From<TranIndex> for u32 {
    #[inline]
    fn from(index: TranIndex) -> Self {
        index.0
    }
}

/// Transaction group index - identifies a collective, multi-holder resource.
///
/// Groups are allocated append-only and never individually destroyed, so a
/// group index stays valid for the lifetime of the detector.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TranGroupIndex(u32);

impl TranGroupIndex {
    /// Creates a new `TranGroupIndex` from a raw slot number.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize`, for addressing the group table.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TranGroupIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TranGroupIndex({})", self.0)
    }
}

impl fmt::Display for TranGroupIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TG[{}]", self.0)
    }
}

impl From<u32> for TranGroupIndex {
    #[inline]
    fn from(index: u32) -> Self {
        Self::new(index)
    }
}

impl From<TranGroupIndex> for u32 {
    #[inline]
    fn from(index: TranGroupIndex) -> Self {
        index.0
    }
}
