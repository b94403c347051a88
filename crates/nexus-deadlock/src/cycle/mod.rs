//! Cycle records returned by deadlock detection.
//!
//! A detection run produces a [`CycleReport`]: a completeness flag and the
//! cycles found. Each cycle pairs its transactions with the resolver they had
//! registered when the cycle was recorded, so the caller can break the
//! deadlock after releasing the detector.
//!
//! ```text
//! CycleReport { case: Yes, cycles: [
//!     Cycle(Ordinary)  [3 -> 1 -> 2]
//!     Cycle(TranGroup) {4, 5, 7}
//! ]}
//! ```

use std::fmt;
use std::sync::Arc;

use nexus_common::types::TranIndex;

use crate::error::{ReserveExt, WfgResult};

/// Breaks a wait on behalf of a blocked transaction.
///
/// Registered by whoever records a transaction's wait (usually the lock
/// manager). Returns `true` if the wait was broken, e.g. the waiter was
/// timed out, and `false` if the transaction has to be aborted instead.
pub trait CycleResolver: Send + Sync {
    /// Attempts to break the wait of `tran`.
    fn resolve(&self, tran: TranIndex) -> bool;
}

impl<F> CycleResolver for F
where
    F: Fn(TranIndex) -> bool + Send + Sync,
{
    fn resolve(&self, tran: TranIndex) -> bool {
        self(tran)
    }
}

/// Shared handle to a registered resolver.
pub type ResolverRef = Arc<dyn CycleResolver>;

/// A transaction taking part in a cycle.
#[derive(Clone)]
pub struct CycleWaiter {
    /// The blocked transaction.
    pub tran: TranIndex,
    /// Resolver registered for `tran` when the cycle was recorded.
    pub resolver: Option<ResolverRef>,
}

impl CycleWaiter {
    /// Creates a cycle entry.
    pub fn new(tran: TranIndex, resolver: Option<ResolverRef>) -> Self {
        Self { tran, resolver }
    }

    /// Returns true if a resolver was registered.
    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }
}

impl fmt::Debug for CycleWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleWaiter")
            .field("tran", &self.tran)
            .field("has_resolver", &self.has_resolver())
            .finish()
    }
}

/// Which detector produced a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleKind {
    /// Elementary cycle over simple wait edges, in search path order.
    Ordinary,
    /// Collective blocking of transaction group holders; an unordered set.
    TranGroup,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Ordinary => write!(f, "ordinary"),
            CycleKind::TranGroup => write!(f, "tran-group"),
        }
    }
}

/// Outcome of running the resolvers of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The resolver of this transaction broke its wait.
    Resolved(TranIndex),
    /// No resolver succeeded. Holds the participants without a resolver,
    /// the candidates for an unilateral abort.
    Unresolved(Vec<TranIndex>),
}

/// One deadlock found by a detection run.
#[derive(Debug, Clone)]
pub struct Cycle {
    kind: CycleKind,
    waiters: Vec<CycleWaiter>,
}

impl Cycle {
    /// Creates a cycle from its participants.
    pub fn new(kind: CycleKind, waiters: Vec<CycleWaiter>) -> Self {
        Self { kind, waiters }
    }

    /// Which detector produced this cycle.
    pub fn kind(&self) -> CycleKind {
        self.kind
    }

    /// The participants with their resolvers.
    pub fn waiters(&self) -> &[CycleWaiter] {
        &self.waiters
    }

    /// The participating transactions, in record order.
    pub fn trans(&self) -> Vec<TranIndex> {
        self.waiters.iter().map(|w| w.tran).collect()
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns true if the cycle has no participants.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Returns true if `tran` takes part in this cycle.
    pub fn contains(&self, tran: TranIndex) -> bool {
        self.waiters.iter().any(|w| w.tran == tran)
    }

    /// Runs the registered resolvers in record order until one succeeds.
    ///
    /// Must be called without holding the detector, since resolvers
    /// usually call back into the lock manager.
    pub fn try_resolve(&self) -> Resolution {
        for waiter in &self.waiters {
            if let Some(resolver) = &waiter.resolver {
                if resolver.resolve(waiter.tran) {
                    return Resolution::Resolved(waiter.tran);
                }
            }
        }

        Resolution::Unresolved(
            self.waiters
                .iter()
                .filter(|w| !w.has_resolver())
                .map(|w| w.tran)
                .collect(),
        )
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cycle: ")?;
        for (i, waiter) in self.waiters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
                if i % 10 == 0 {
                    write!(f, "\n       ")?;
                }
            }
            write!(f, "{}", waiter.tran)?;
        }
        Ok(())
    }
}

/// Completeness of a detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleCase {
    /// No cycle exists.
    No,
    /// Every cycle found; the search was exhaustive.
    Yes,
    /// A cycle budget was hit; more cycles may exist.
    YesPrune,
    /// The run failed; no cycles are reported.
    Error,
}

impl CycleCase {
    /// Returns true if at least one cycle was found.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, CycleCase::Yes | CycleCase::YesPrune)
    }

    /// Combines the cases of two detectors run over the same graph.
    pub fn merge(self, other: CycleCase) -> CycleCase {
        use CycleCase::*;
        match (self, other) {
            (Error, _) | (_, Error) => Error,
            (YesPrune, _) | (_, YesPrune) => YesPrune,
            (Yes, _) | (_, Yes) => Yes,
            (No, No) => No,
        }
    }
}

impl fmt::Display for CycleCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleCase::No => write!(f, "NO"),
            CycleCase::Yes => write!(f, "YES"),
            CycleCase::YesPrune => write!(f, "YES_PRUNE"),
            CycleCase::Error => write!(f, "ERROR"),
        }
    }
}

/// Caller-owned result of a detection run.
///
/// Dropping the report releases every cycle record.
#[derive(Debug, Clone)]
pub struct CycleReport {
    case: CycleCase,
    cycles: Vec<Cycle>,
}

impl CycleReport {
    /// Creates a report from a case and its cycles.
    pub fn new(case: CycleCase, cycles: Vec<Cycle>) -> Self {
        debug_assert!(
            case.is_deadlock() != cycles.is_empty() || case == CycleCase::YesPrune,
            "cycle case {} does not match {} cycles",
            case,
            cycles.len()
        );
        Self { case, cycles }
    }

    /// A report with no cycles.
    pub fn none() -> Self {
        Self {
            case: CycleCase::No,
            cycles: Vec::new(),
        }
    }

    /// The report of a failed run.
    pub fn error() -> Self {
        Self {
            case: CycleCase::Error,
            cycles: Vec::new(),
        }
    }

    /// Concatenates the ordinary and transaction-group results.
    ///
    /// Pruning in either run makes the merged run pruned.
    pub fn merge(mut self, other: CycleReport) -> WfgResult<CycleReport> {
        let case = self.case.merge(other.case);
        if case == CycleCase::Error {
            return Ok(CycleReport::error());
        }
        self.cycles
            .try_reserve(other.cycles.len())
            .or_oom("cycle list")?;
        self.cycles.extend(other.cycles);
        Ok(CycleReport {
            case,
            cycles: self.cycles,
        })
    }

    /// Completeness of the run.
    pub fn case(&self) -> CycleCase {
        self.case
    }

    /// The cycles found.
    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    /// Number of cycles found.
    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    /// Returns true if no cycle was found.
    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Returns true if at least one deadlock was found.
    pub fn is_deadlock(&self) -> bool {
        self.case.is_deadlock() && !self.cycles.is_empty()
    }

    /// Returns true if the search stopped early.
    pub fn is_pruned(&self) -> bool {
        self.case == CycleCase::YesPrune
    }

    /// Iterates over the cycles.
    pub fn iter(&self) -> std::slice::Iter<'_, Cycle> {
        self.cycles.iter()
    }

    /// Takes ownership of the cycle list.
    pub fn into_cycles(self) -> Vec<Cycle> {
        self.cycles
    }
}

impl Default for CycleReport {
    fn default() -> Self {
        Self::none()
    }
}

impl IntoIterator for CycleReport {
    type Item = Cycle;
    type IntoIter = std::vec::IntoIter<Cycle>;

    fn into_iter(self) -> Self::IntoIter {
        self.cycles.into_iter()
    }
}

impl<'a> IntoIterator for &'a CycleReport {
    type Item = &'a Cycle;
    type IntoIter = std::slice::Iter<'a, Cycle>;

    fn into_iter(self) -> Self::IntoIter {
        self.cycles.iter()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----------------- CYCLES ------------------")?;
        writeln!(f, "case = {}, cycles = {}", self.case, self.cycles.len())?;
        for cycle in &self.cycles {
            writeln!(f, "{}", cycle)?;
        }
        Ok(())
    }
}
