//! Ordinary cycle detection.
//!
//! Depth-first search over simple wait edges with an explicit stack, so a
//! large transaction population cannot overflow the call stack. Each search
//! started from an unvisited node explores one region and tags the nodes of
//! every cycle it records with the region number. A fully explored node that
//! carries the current tag may lie on another cycle through a different path,
//! so it is pushed again (`ReOnStack`). This finds several overlapping cycles
//! in one region without restarting the search.
//!
//! Enumeration is bounded by two caps: cycles per region and cycles per run.
//! Once a cap is reached no further cycle is recorded and the run is flagged
//! as pruned.

use nexus_common::constants::UNLIMITED_CYCLES;
use nexus_common::types::TranIndex;

use crate::cycle::{Cycle, CycleCase, CycleKind, CycleReport, CycleWaiter};
use crate::error::{ReserveExt, WfgError, WfgResult};
use crate::graph::{NodeStatus, WaitGraph};

/// Cycle caps for one detection run. `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleBudget {
    per_region: usize,
    total: usize,
}

impl CycleBudget {
    pub(crate) fn new(per_region: usize, total: usize) -> Self {
        Self { per_region, total }
    }

    fn region_exhausted(&self, in_region: usize) -> bool {
        self.per_region != UNLIMITED_CYCLES && in_region >= self.per_region
    }

    fn total_exhausted(&self, total: usize, in_region: usize) -> bool {
        self.total != UNLIMITED_CYCLES && total + in_region >= self.total
    }

    fn exhausted(&self, total: usize, in_region: usize) -> bool {
        self.region_exhausted(in_region) || self.total_exhausted(total, in_region)
    }
}

/// A node on the search stack and the next outgoing edge to scan.
#[derive(Debug, Clone, Copy)]
struct Frame {
    tran: TranIndex,
    cursor: usize,
}

/// State of one ordinary detection run.
struct OrdinarySearch<'a> {
    graph: &'a mut WaitGraph,
    budget: CycleBudget,
    stack: Vec<Frame>,
    cycles: Vec<Cycle>,
    /// Current region number.
    region: usize,
    /// Cycles recorded in the current region.
    in_region: usize,
    /// Cycles recorded in finished regions.
    total: usize,
    pruned: bool,
}

/// Enumerates the elementary cycles formed by wait edges.
///
/// Resets the visitation status of every node first. On allocation failure
/// the cycles found so far are dropped and the error is returned.
pub(crate) fn detect_ordinary(
    graph: &mut WaitGraph,
    budget: CycleBudget,
) -> WfgResult<CycleReport> {
    graph.for_each_node(|node| {
        node.status = NodeStatus::NotVisited;
        node.cycle_group_no = None;
    });

    // A cycle needs at least two waiting transactions
    if graph.num_waiters() < 2 {
        return Ok(CycleReport::none());
    }

    let mut search = OrdinarySearch {
        graph,
        budget,
        stack: Vec::new(),
        cycles: Vec::new(),
        region: 0,
        in_region: 0,
        total: 0,
        pruned: false,
    };
    search.run()?;

    let case = if search.cycles.is_empty() {
        CycleCase::No
    } else if search.pruned {
        CycleCase::YesPrune
    } else {
        CycleCase::Yes
    };
    Ok(CycleReport::new(case, search.cycles))
}

impl OrdinarySearch<'_> {
    fn run(&mut self) -> WfgResult<()> {
        self.stack
            .try_reserve(self.graph.num_waiters())
            .or_oom("search stack")?;

        for start in self.graph.trans() {
            if self.budget.total_exhausted(self.total, 0) {
                if self.has_unexplored() {
                    self.pruned = true;
                }
                break;
            }

            if self.graph.status(start) != NodeStatus::NotVisited {
                continue;
            }

            self.region += 1;
            self.in_region = 0;

            if !self.graph.has_holders(start) {
                self.graph.set_status(start, NodeStatus::OffStack);
                continue;
            }

            self.graph.set_status(start, NodeStatus::OnStack);
            self.push(start)?;
            self.search_region()?;

            self.total += self.in_region;
        }

        Ok(())
    }

    /// Runs the search until the stack empties.
    fn search_region(&mut self) -> WfgResult<()> {
        while let Some(frame) = self.stack.last_mut() {
            let tran = frame.tran;
            let cursor = frame.cursor;
            frame.cursor += 1;

            let target = match self.graph.holder_at(tran, cursor) {
                Some(target) => target,
                None => {
                    // Every edge of the top was scanned
                    self.graph.set_status(tran, NodeStatus::OffStack);
                    self.stack.pop();
                    continue;
                }
            };

            match self.graph.status(target) {
                NodeStatus::NotVisited => {
                    if self.graph.has_holders(target) {
                        self.graph.set_status(target, NodeStatus::OnStack);
                        self.push(target)?;
                    } else {
                        self.graph.set_status(target, NodeStatus::OffStack);
                    }
                }
                NodeStatus::OnStack => {
                    if self.budget.exhausted(self.total, self.in_region) {
                        self.pruned = true;
                        continue;
                    }
                    self.record_cycle(target)?;
                }
                NodeStatus::OffStack
                    if self.graph.node(target).cycle_group_no == Some(self.region) =>
                {
                    if self.budget.exhausted(self.total, self.in_region) {
                        self.pruned = true;
                        continue;
                    }
                    self.graph.set_status(target, NodeStatus::ReOnStack);
                    self.push(target)?;
                }
                // Explored in another region, or already on the stack again
                _ => {}
            }
        }

        Ok(())
    }

    fn push(&mut self, tran: TranIndex) -> WfgResult<()> {
        self.stack.try_reserve(1).or_oom("search stack")?;
        self.stack.push(Frame { tran, cursor: 0 });
        Ok(())
    }

    /// Records the stack segment from the top down to `target`.
    fn record_cycle(&mut self, target: TranIndex) -> WfgResult<()> {
        let bottom = self
            .stack
            .iter()
            .rposition(|frame| frame.tran == target)
            .ok_or_else(|| {
                WfgError::internal(format!("transaction {} on stack but not in it", target))
            })?;

        let segment = &self.stack[bottom..];
        let mut waiters = Vec::new();
        waiters.try_reserve(segment.len()).or_oom("cycle record")?;
        self.cycles.try_reserve(1).or_oom("cycle list")?;

        for frame in segment.iter().rev() {
            let node = self.graph.node_mut(frame.tran);
            node.cycle_group_no = Some(self.region);
            waiters.push(CycleWaiter::new(frame.tran, node.resolver.clone()));
        }

        self.cycles.push(Cycle::new(CycleKind::Ordinary, waiters));
        self.in_region += 1;
        Ok(())
    }

    /// Returns true if some waiting transaction was never reached.
    fn has_unexplored(&self) -> bool {
        self.graph
            .trans()
            .any(|t| self.graph.status(t) == NodeStatus::NotVisited && self.graph.has_holders(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::ResolverRef;
    use std::sync::Arc;

    fn t(n: u32) -> TranIndex {
        TranIndex::new(n)
    }

    fn unbounded() -> CycleBudget {
        CycleBudget::new(UNLIMITED_CYCLES, UNLIMITED_CYCLES)
    }

    fn sorted(cycle: &Cycle) -> Vec<TranIndex> {
        let mut trans = cycle.trans();
        trans.sort();
        trans
    }

    #[test]
    fn test_budget() {
        let budget = CycleBudget::new(3, 10);
        assert!(!budget.exhausted(0, 2));
        assert!(budget.exhausted(0, 3));
        assert!(budget.exhausted(8, 2));

        assert!(!unbounded().exhausted(1_000, 1_000));
    }

    #[test]
    fn test_no_cycle() {
        let mut g = WaitGraph::with_capacity(4).unwrap();
        // T0 -> T1 -> T2 -> T3
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(2)], None).unwrap();
        g.add_wait(t(2), &[t(3)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::No);
        assert!(report.is_empty());
    }

    #[test]
    fn test_single_waiter() {
        let mut g = WaitGraph::with_capacity(3).unwrap();
        g.add_wait(t(0), &[t(1), t(2)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::No);
    }

    #[test]
    fn test_simple_cycle_in_stack_order() {
        let mut g = WaitGraph::with_capacity(3).unwrap();
        // T0 -> T1 -> T2 -> T0
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(2)], None).unwrap();
        g.add_wait(t(2), &[t(0)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 1);
        // From the top of the stack down to the node that closed the cycle
        assert_eq!(report.cycles()[0].trans(), vec![t(2), t(1), t(0)]);
        assert_eq!(report.cycles()[0].kind(), CycleKind::Ordinary);
    }

    #[test]
    fn test_diamond_revisit() {
        let mut g = WaitGraph::with_capacity(4).unwrap();
        // T0 -> T1 -> T2 -> T0 and T0 -> T3 -> T1 share T1 -> T2 -> T0
        g.add_wait(t(0), &[t(1), t(3)], None).unwrap();
        g.add_wait(t(1), &[t(2)], None).unwrap();
        g.add_wait(t(2), &[t(0)], None).unwrap();
        g.add_wait(t(3), &[t(1)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 2);
        assert_eq!(report.cycles()[0].trans(), vec![t(2), t(1), t(0)]);
        assert_eq!(report.cycles()[1].trans(), vec![t(2), t(1), t(3), t(0)]);
    }

    #[test]
    fn test_disjoint_regions() {
        let mut g = WaitGraph::with_capacity(5).unwrap();
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(0)], None).unwrap();
        g.add_wait(t(3), &[t(4)], None).unwrap();
        g.add_wait(t(4), &[t(3)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 2);
        assert_eq!(sorted(&report.cycles()[0]), vec![t(0), t(1)]);
        assert_eq!(sorted(&report.cycles()[1]), vec![t(3), t(4)]);
    }

    #[test]
    fn test_region_cap_prunes() {
        let mut g = WaitGraph::with_capacity(6).unwrap();
        // T0 and each of T1..T5 wait for each other: five 2-cycles
        g.add_wait(t(0), &[t(1), t(2), t(3), t(4), t(5)], None)
            .unwrap();
        for i in 1..=5 {
            g.add_wait(t(i), &[t(0)], None).unwrap();
        }

        let report = detect_ordinary(&mut g, CycleBudget::new(3, 100)).unwrap();
        assert_eq!(report.case(), CycleCase::YesPrune);
        assert_eq!(report.len(), 3);

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 5);
    }

    #[test]
    fn test_total_cap_prunes_later_regions() {
        let mut g = WaitGraph::with_capacity(4).unwrap();
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(0)], None).unwrap();
        g.add_wait(t(2), &[t(3)], None).unwrap();
        g.add_wait(t(3), &[t(2)], None).unwrap();

        let report = detect_ordinary(&mut g, CycleBudget::new(10, 1)).unwrap();
        assert_eq!(report.case(), CycleCase::YesPrune);
        assert_eq!(report.len(), 1);
        assert_eq!(sorted(&report.cycles()[0]), vec![t(0), t(1)]);
    }

    #[test]
    fn test_total_cap_exactly_met() {
        let mut g = WaitGraph::with_capacity(3).unwrap();
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(0)], None).unwrap();

        // Nothing left to explore once the only cycle is recorded
        let report = detect_ordinary(&mut g, CycleBudget::new(1, 1)).unwrap();
        assert_eq!(report.case(), CycleCase::Yes);
        assert_eq!(report.len(), 1);
    }

    #[test]
    fn test_cycle_carries_resolvers() {
        let mut g = WaitGraph::with_capacity(2).unwrap();
        let resolver: ResolverRef = Arc::new(|_: TranIndex| true);
        g.add_wait(t(0), &[t(1)], Some(resolver)).unwrap();
        g.add_wait(t(1), &[t(0)], None).unwrap();

        let report = detect_ordinary(&mut g, unbounded()).unwrap();
        let cycle = &report.cycles()[0];
        for waiter in cycle.waiters() {
            assert_eq!(waiter.has_resolver(), waiter.tran == t(0));
        }
    }

    #[test]
    fn test_rerun_is_stable() {
        let mut g = WaitGraph::with_capacity(3).unwrap();
        g.add_wait(t(0), &[t(1)], None).unwrap();
        g.add_wait(t(1), &[t(2)], None).unwrap();
        g.add_wait(t(2), &[t(0)], None).unwrap();

        let first = detect_ordinary(&mut g, unbounded()).unwrap();
        let second = detect_ordinary(&mut g, unbounded()).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first.cycles()[0].trans(), second.cycles()[0].trans());
    }
}
