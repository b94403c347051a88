//! Deadlock detection using wait-for graph analysis.
//!
//! [`DeadlockDetector`] owns the wait graph and the transaction group table
//! behind one lock and runs both cycle detectors over them:
//!
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1      ordinary cycle [T3, T2, T1]
//!
//! G held by {A, B}, C waits on G
//! A waits for C, B waits for C    group cycle {A, B, C}
//! ```
//!
//! # Resolving Deadlocks
//!
//! Detection only reports cycles. The caller releases the detector and then
//! breaks each cycle, typically through [`Cycle::try_resolve`] or by
//! aborting one participant.
//!
//! [`Cycle::try_resolve`]: crate::cycle::Cycle::try_resolve

mod ordinary;
mod tran_group;

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use nexus_common::config::DeadlockConfig;
use nexus_common::types::{TranGroupIndex, TranIndex};
use parking_lot::RwLock;
use serde::Serialize;

use crate::cycle::{CycleCase, CycleReport, ResolverRef};
use crate::error::{WfgError, WfgResult};
use crate::graph::WaitGraph;
use crate::group::TranGroupTable;

use ordinary::{detect_ordinary, CycleBudget};
use tran_group::detect_tran_group;

/// Statistics about deadlock detection.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Number of detection runs.
    pub detections: AtomicU64,
    /// Number of cycles reported.
    pub cycles_found: AtomicU64,
    /// Number of runs that stopped at a cycle cap.
    pub pruned_runs: AtomicU64,
    /// Number of runs that failed.
    pub failed_runs: AtomicU64,
}

impl DeadlockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a detection run.
    pub fn record_run(&self, report: &CycleReport) {
        self.detections.fetch_add(1, AtomicOrdering::Relaxed);
        self.cycles_found
            .fetch_add(report.len() as u64, AtomicOrdering::Relaxed);
        match report.case() {
            CycleCase::YesPrune => {
                self.pruned_runs.fetch_add(1, AtomicOrdering::Relaxed);
            }
            CycleCase::Error => {
                self.failed_runs.fetch_add(1, AtomicOrdering::Relaxed);
            }
            CycleCase::No | CycleCase::Yes => {}
        }
    }

    /// Number of detection runs.
    pub fn detections(&self) -> u64 {
        self.detections.load(AtomicOrdering::Relaxed)
    }

    /// Number of cycles reported.
    pub fn cycles_found(&self) -> u64 {
        self.cycles_found.load(AtomicOrdering::Relaxed)
    }

    /// Number of pruned runs.
    pub fn pruned_runs(&self) -> u64 {
        self.pruned_runs.load(AtomicOrdering::Relaxed)
    }

    /// Number of failed runs.
    pub fn failed_runs(&self) -> u64 {
        self.failed_runs.load(AtomicOrdering::Relaxed)
    }
}

/// Size of the wait-for graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WfgStatus {
    /// Transaction slots in the node table.
    pub num_nodes: usize,
    /// Wait edges.
    pub num_edges: usize,
    /// Transactions with at least one outgoing edge.
    pub num_waiters: usize,
    /// Transaction groups.
    pub num_groups: usize,
}

/// Both stores, read together by the group detector.
#[derive(Debug, Default)]
struct WfgState {
    graph: WaitGraph,
    groups: TranGroupTable,
}

impl WfgState {
    /// Drops the resolver of `tran` once it no longer waits anywhere.
    fn release_resolver(&mut self, tran: TranIndex) {
        if !self.graph.has_holders(tran) && !self.groups.is_waiter_anywhere(tran) {
            self.graph.set_resolver(tran, None);
        }
    }

    fn detect(&mut self, budget: CycleBudget) -> WfgResult<CycleReport> {
        let ordinary = detect_ordinary(&mut self.graph, budget)?;
        let groups = detect_tran_group(&mut self.graph, &self.groups)?;
        ordinary.merge(groups)
    }
}

/// Wait-for graph deadlock detector.
///
/// Shared by the lock manager, usually behind an `Arc`. Mutations and
/// detection runs are serialized; queries may run concurrently.
pub struct DeadlockDetector {
    state: RwLock<WfgState>,
    config: DeadlockConfig,
    stats: DeadlockStats,
}

impl DeadlockDetector {
    /// Creates a detector with the default configuration.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WfgState::default()),
            config: DeadlockConfig::default(),
            stats: DeadlockStats::new(),
        }
    }

    /// Creates a detector with a custom configuration.
    pub fn with_config(config: DeadlockConfig) -> WfgResult<Self> {
        config.validate().map_err(WfgError::invalid_config)?;
        let graph = WaitGraph::with_capacity(config.initial_capacity)?;

        tracing::info!(
            max_cycles_per_region = config.max_cycles_per_region,
            max_total_cycles = config.max_total_cycles,
            initial_capacity = config.initial_capacity,
            "deadlock detector created"
        );

        Ok(Self {
            state: RwLock::new(WfgState {
                graph,
                groups: TranGroupTable::new(),
            }),
            config,
            stats: DeadlockStats::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DeadlockConfig {
        &self.config
    }

    /// Returns statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    /// Extends the node table to cover at least `capacity` transactions.
    pub fn grow(&self, capacity: usize) -> WfgResult<()> {
        self.state.write().graph.grow(capacity)
    }

    // -------------------------------------------------------------------------
    // Wait edges
    // -------------------------------------------------------------------------

    /// Records that `waiter` is blocked by each of `holders`.
    ///
    /// `resolver` replaces any previous registration of `waiter`. On error no
    /// edge of the batch is linked.
    pub fn add_wait(
        &self,
        waiter: TranIndex,
        holders: &[TranIndex],
        resolver: Option<ResolverRef>,
    ) -> WfgResult<usize> {
        let mut state = self.state.write();
        let added = state.graph.add_wait(waiter, holders, resolver)?;
        state.release_resolver(waiter);
        Ok(added)
    }

    /// Records that `waiter` no longer waits for `holders`.
    pub fn remove_wait(&self, waiter: TranIndex, holders: &[TranIndex]) -> usize {
        let mut state = self.state.write();
        let removed = state.graph.remove_wait(waiter, holders);
        state.release_resolver(waiter);
        removed
    }

    /// Records that `waiter` no longer waits for anyone.
    pub fn clear_waits(&self, waiter: TranIndex) -> usize {
        let mut state = self.state.write();
        let removed = state.graph.clear_waits(waiter);
        state.release_resolver(waiter);
        removed
    }

    /// Returns the size of the graph.
    pub fn status(&self) -> WfgStatus {
        let state = self.state.read();
        WfgStatus {
            num_nodes: state.graph.num_nodes(),
            num_edges: state.graph.num_edges(),
            num_waiters: state.graph.num_waiters(),
            num_groups: state.groups.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Transaction groups
    // -------------------------------------------------------------------------

    /// Creates a transaction group.
    pub fn create_group(&self) -> WfgResult<TranGroupIndex> {
        self.state.write().groups.create_group()
    }

    /// Registers `tran` as a holder of `group`.
    pub fn add_group_holder(&self, group: TranGroupIndex, tran: TranIndex) -> WfgResult<bool> {
        self.state.write().groups.add_holder(group, tran)
    }

    /// Removes `tran` from the holders of `group`.
    pub fn remove_group_holder(&self, group: TranGroupIndex, tran: TranIndex) -> bool {
        self.state.write().groups.remove_holder(group, tran)
    }

    /// Registers `tran` as a waiter of `group`.
    ///
    /// `resolver` replaces any previous registration of `tran`.
    pub fn add_group_waiter(
        &self,
        group: TranGroupIndex,
        tran: TranIndex,
        resolver: Option<ResolverRef>,
    ) -> WfgResult<bool> {
        let mut state = self.state.write();
        debug_assert!(
            state.graph.contains(tran),
            "transaction {} out of range",
            tran
        );
        let added = state.groups.add_waiter(group, tran)?;
        state.graph.set_resolver(tran, resolver);
        Ok(added)
    }

    /// Removes `tran` from the waiters of `group`.
    pub fn remove_group_waiter(&self, group: TranGroupIndex, tran: TranIndex) -> bool {
        let mut state = self.state.write();
        let removed = state.groups.remove_waiter(group, tran);
        state.release_resolver(tran);
        removed
    }

    /// Number of holders of `group`.
    pub fn num_group_holders(&self, group: TranGroupIndex) -> usize {
        self.state
            .read()
            .groups
            .get(group)
            .map_or(0, |g| g.num_holders())
    }

    /// Number of waiters of `group`.
    pub fn num_group_waiters(&self, group: TranGroupIndex) -> usize {
        self.state
            .read()
            .groups
            .get(group)
            .map_or(0, |g| g.num_waiters())
    }

    // -------------------------------------------------------------------------
    // Detection
    // -------------------------------------------------------------------------

    /// Searches for deadlocks with the configured cycle caps.
    pub fn detect(&self) -> CycleReport {
        self.detect_with_limits(
            self.config.max_cycles_per_region,
            self.config.max_total_cycles,
        )
    }

    /// Searches for deadlocks with explicit cycle caps; `0` means unlimited.
    ///
    /// Holds the detector exclusively for the whole run. On failure the
    /// report has case [`CycleCase::Error`] and no cycles; run detection
    /// again later.
    pub fn detect_with_limits(
        &self,
        max_cycles_per_region: usize,
        max_total_cycles: usize,
    ) -> CycleReport {
        let budget = CycleBudget::new(max_cycles_per_region, max_total_cycles);
        let result = self.state.write().detect(budget);

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "deadlock detection failed"
                );
                CycleReport::error()
            }
        };

        self.stats.record_run(&report);
        match report.case() {
            CycleCase::YesPrune => tracing::warn!(
                cycles = report.len(),
                max_cycles_per_region,
                max_total_cycles,
                "deadlock detection pruned"
            ),
            _ => tracing::debug!(
                case = %report.case(),
                cycles = report.len(),
                "deadlock detection finished"
            ),
        }
        report
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Checks if a transaction waits for another or on a group.
    pub fn is_waiting(&self, tran: TranIndex) -> bool {
        let state = self.state.read();
        state.graph.has_holders(tran) || state.groups.is_waiter_anywhere(tran)
    }

    /// Checks if a transaction waits on a group.
    pub fn is_tran_group_waiting(&self, tran: TranIndex) -> bool {
        self.state.read().groups.is_waiter_anywhere(tran)
    }

    /// Counts the entries still referring to `tran` as a waiter or member.
    ///
    /// Zero once every wait and membership of a finished transaction was
    /// removed.
    pub fn tran_entries(&self, tran: TranIndex) -> usize {
        let state = self.state.read();
        state.graph.tran_entries(tran) + state.groups.tran_entries(tran)
    }

    /// Returns what a transaction is waiting for.
    pub fn holders_of(&self, tran: TranIndex) -> Vec<TranIndex> {
        self.state.read().graph.holders_of(tran).collect()
    }

    /// Checks the adjacency lists against the edge store.
    pub fn verify(&self) -> WfgResult<()> {
        self.state.read().graph.verify()
    }

    /// Renders both stores and every cycle of an unbounded detection run.
    pub fn dump(&self) -> String {
        let mut state = self.state.write();
        let mut out = String::new();

        // Writing to a String cannot fail
        let _ = writeln!(out, "--------------- WFG contents --------------");
        let _ = write!(out, "{}", state.graph);
        let _ = write!(out, "{}", state.groups);

        let unbounded = DeadlockConfig::unbounded();
        let budget = CycleBudget::new(
            unbounded.max_cycles_per_region,
            unbounded.max_total_cycles,
        );
        match state.detect(budget) {
            Ok(report) if report.is_deadlock() => {
                let _ = writeln!(out);
                let _ = write!(out, "{}", report);
            }
            Ok(_) => {}
            Err(e) => {
                let _ = writeln!(out, "cycle search failed: {}", e);
            }
        }
        out
    }

    /// Drops every edge and group, returning to the freshly built state.
    ///
    /// Slots reserved by the configured initial capacity are kept; slots
    /// added later by [`grow`](Self::grow) are dropped.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.graph.reset(self.config.initial_capacity);
        state.groups.clear();
        tracing::info!("wait-for graph reset");
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::{CycleKind, Resolution};
    use crate::error::fault;
    use std::sync::Arc;

    fn t(n: u32) -> TranIndex {
        TranIndex::new(n)
    }

    fn detector(n: usize) -> DeadlockDetector {
        let detector = DeadlockDetector::new();
        detector.grow(n).unwrap();
        detector
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let config = DeadlockConfig::default()
            .with_max_cycles_per_region(20)
            .with_max_total_cycles(5);
        let err = DeadlockDetector::with_config(config).unwrap_err();
        assert!(matches!(err, WfgError::InvalidConfig { .. }));
    }

    #[test]
    fn test_with_config_reserves_nodes() {
        let config = DeadlockConfig::default().with_initial_capacity(8);
        let detector = DeadlockDetector::with_config(config).unwrap();
        assert_eq!(detector.status().num_nodes, 8);
    }

    #[test]
    fn test_status() {
        let detector = detector(4);
        detector.add_wait(t(0), &[t(1), t(2)], None).unwrap();
        detector.add_wait(t(3), &[t(1)], None).unwrap();
        detector.create_group().unwrap();

        assert_eq!(
            detector.status(),
            WfgStatus {
                num_nodes: 4,
                num_edges: 3,
                num_waiters: 2,
                num_groups: 1,
            }
        );
    }

    #[test]
    fn test_detect_merges_both_detectors() {
        let detector = detector(5);
        // Ordinary cycle T0 <-> T1
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_wait(t(1), &[t(0)], None).unwrap();
        // Group cycle: T2 holds G, T4 waits on G, T2 waits for T4
        let g = detector.create_group().unwrap();
        detector.add_group_holder(g, t(2)).unwrap();
        detector.add_group_waiter(g, t(4), None).unwrap();
        detector.add_wait(t(2), &[t(4)], None).unwrap();

        let report = detector.detect();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 2);
        assert_eq!(report.cycles()[0].kind(), CycleKind::Ordinary);
        assert_eq!(report.cycles()[1].kind(), CycleKind::TranGroup);
        assert_eq!(report.cycles()[1].trans(), vec![t(2), t(4)]);
    }

    #[test]
    fn test_stats() {
        let detector = detector(6);
        detector.add_wait(t(0), &[t(1), t(2), t(3)], None).unwrap();
        for i in 1..=3 {
            detector.add_wait(t(i), &[t(0)], None).unwrap();
        }

        detector.detect_with_limits(2, 0);
        detector.detect();

        let stats = detector.stats();
        assert_eq!(stats.detections(), 2);
        assert_eq!(stats.cycles_found(), 5);
        assert_eq!(stats.pruned_runs(), 1);
        assert_eq!(stats.failed_runs(), 0);
    }

    #[test]
    fn test_resolver_released_when_not_waiting() {
        let detector = detector(3);
        let resolver: ResolverRef = Arc::new(|_: TranIndex| true);
        detector
            .add_wait(t(0), &[t(1), t(2)], Some(Arc::clone(&resolver)))
            .unwrap();

        detector.remove_wait(t(0), &[t(1)]);
        assert!(detector.state.read().graph.resolver(t(0)).is_some());

        detector.remove_wait(t(0), &[t(2)]);
        assert!(detector.state.read().graph.resolver(t(0)).is_none());
        // Only the test still holds the resolver
        assert_eq!(Arc::strong_count(&resolver), 1);
    }

    #[test]
    fn test_resolver_kept_while_group_waiting() {
        let detector = detector(3);
        let g = detector.create_group().unwrap();
        let resolver: ResolverRef = Arc::new(|_: TranIndex| true);

        detector.add_group_waiter(g, t(0), Some(resolver)).unwrap();
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        // The edge registration replaced the group one
        assert!(detector.state.read().graph.resolver(t(0)).is_none());

        let resolver: ResolverRef = Arc::new(|_: TranIndex| true);
        detector.add_wait(t(0), &[t(2)], Some(resolver)).unwrap();
        detector.clear_waits(t(0));
        assert!(detector.is_waiting(t(0)));
        assert!(detector.state.read().graph.resolver(t(0)).is_some());

        detector.remove_group_waiter(g, t(0));
        assert!(!detector.is_waiting(t(0)));
        assert!(detector.state.read().graph.resolver(t(0)).is_none());
    }

    #[test]
    fn test_resolve_group_cycle() {
        let detector = detector(3);
        let g = detector.create_group().unwrap();
        detector.add_group_holder(g, t(0)).unwrap();
        let timeout: ResolverRef = Arc::new(|tran: TranIndex| tran == t(2));
        detector.add_group_waiter(g, t(2), Some(timeout)).unwrap();
        detector.add_wait(t(0), &[t(2)], None).unwrap();

        let report = detector.detect();
        assert_eq!(report.len(), 1);
        assert_eq!(report.cycles()[0].try_resolve(), Resolution::Resolved(t(2)));
    }

    #[test]
    fn test_queries() {
        let detector = detector(4);
        let g = detector.create_group().unwrap();
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_group_waiter(g, t(2), None).unwrap();
        detector.add_group_holder(g, t(3)).unwrap();

        assert!(detector.is_waiting(t(0)));
        assert!(!detector.is_tran_group_waiting(t(0)));
        assert!(detector.is_waiting(t(2)));
        assert!(detector.is_tran_group_waiting(t(2)));
        assert!(!detector.is_waiting(t(3)));

        assert_eq!(detector.holders_of(t(0)), vec![t(1)]);
        assert_eq!(detector.num_group_holders(g), 1);
        assert_eq!(detector.num_group_waiters(g), 1);

        assert_eq!(detector.tran_entries(t(0)), 2);
        assert_eq!(detector.tran_entries(t(3)), 1);
        assert_eq!(detector.tran_entries(t(1)), 0);
    }

    #[test]
    fn test_dump() {
        let detector = detector(3);
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_wait(t(1), &[t(0)], None).unwrap();
        let g = detector.create_group().unwrap();
        detector.add_group_holder(g, t(2)).unwrap();

        let dump = detector.dump();
        assert!(dump.starts_with("--------------- WFG contents --------------"));
        assert!(dump.contains("[node_001]:\t holders = { 000 }"));
        assert!(dump.contains("TG[0]:\t Num_holders 1, Num_waiters 0"));
        assert!(dump.contains("Cycle: 1, 0"));
    }

    #[test]
    fn test_reset() {
        let detector = detector(3);
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.create_group().unwrap();

        detector.reset();
        assert_eq!(detector.status(), WfgStatus::default());
        assert_eq!(detector.detect().case(), CycleCase::No);
    }

    #[test]
    fn test_reset_keeps_initial_capacity() {
        let config = DeadlockConfig::default().with_initial_capacity(8);
        let detector = DeadlockDetector::with_config(config).unwrap();
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.grow(16).unwrap();
        detector.add_wait(t(12), &[t(0)], None).unwrap();

        detector.reset();
        let status = detector.status();
        assert_eq!(status.num_nodes, 8);
        assert_eq!(status.num_edges, 0);
        assert_eq!(detector.tran_entries(t(0)), 0);

        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_wait(t(1), &[t(0)], None).unwrap();
        assert_eq!(detector.detect().case(), CycleCase::Yes);
        detector.verify().unwrap();
    }

    #[test]
    fn test_failed_detection_reports_error() {
        let detector = detector(3);
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_wait(t(1), &[t(2)], None).unwrap();
        detector.add_wait(t(2), &[t(0)], None).unwrap();
        let before = detector.status();

        fault::fail_after(0);
        let report = detector.detect_with_limits(0, 0);
        assert_eq!(report.case(), CycleCase::Error);
        assert!(report.is_empty());
        assert!(!report.is_deadlock());
        assert_eq!(detector.stats().failed_runs(), 1);
        assert_eq!(detector.stats().cycles_found(), 0);

        // The graph is untouched and the next run succeeds
        assert_eq!(detector.status(), before);
        detector.verify().unwrap();
        let report = detector.detect();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 1);
        assert_eq!(detector.stats().failed_runs(), 1);
    }

    #[test]
    fn test_failed_group_detection_reports_error() {
        let detector = detector(3);
        let group = detector.create_group().unwrap();
        detector.add_group_holder(group, t(0)).unwrap();
        detector.add_wait(t(0), &[t(1)], None).unwrap();
        detector.add_group_waiter(group, t(1), None).unwrap();

        // One waiter: the ordinary search never allocates, the group search does
        fault::fail_after(0);
        let report = detector.detect();
        assert_eq!(report.case(), CycleCase::Error);
        assert!(report.is_empty());
        assert_eq!(detector.stats().failed_runs(), 1);

        assert_eq!(detector.detect().case(), CycleCase::Yes);
    }
}
