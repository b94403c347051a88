//! Transaction group cycle detection.
//!
//! A group deadlocks when, starting from one of its waiters, the set of
//! transactions transitively blocked behind that waiter covers every holder
//! of every group the search touched. No pairwise cycle needs to exist.
//!
//! The search walks wait edges backwards: from a blocked transaction `n` it
//! reaches the transactions waiting for `n`, and the waiters of every group
//! `n` holds. Transaction indices are dense, so pending nodes are picked up
//! with a low watermark over the node table instead of a queue.

use nexus_common::types::{TranGroupIndex, TranIndex};

use crate::cycle::{Cycle, CycleCase, CycleKind, CycleReport, CycleWaiter};
use crate::error::{ReserveExt, WfgResult};
use crate::graph::{NodeStatus, WaitGraph};
use crate::group::TranGroupTable;

/// Finds transaction group deadlocks.
///
/// Transactions reported in one group cycle are not reported again in the
/// same run. Never prunes.
pub(crate) fn detect_tran_group(
    graph: &mut WaitGraph,
    groups: &TranGroupTable,
) -> WfgResult<CycleReport> {
    graph.for_each_node(|node| node.status = NodeStatus::NotVisited);

    if groups.is_empty() {
        return Ok(CycleReport::none());
    }

    let mut cycles = Vec::new();
    let mut connected = Vec::new();
    connected.try_reserve(groups.len()).or_oom("connected groups")?;

    for (index, group) in groups.iter() {
        if !group.is_contended() {
            continue;
        }

        for &waiter in group.waiters() {
            if graph.status(waiter) == NodeStatus::OnTgCycle {
                continue;
            }

            graph.for_each_node(|node| {
                if node.status != NodeStatus::OnTgCycle {
                    node.status = NodeStatus::NotVisited;
                }
            });
            graph.set_status(waiter, NodeStatus::OnStack);
            expand_blocked(graph, groups, waiter);

            connected.clear();
            if !collect_blocked_groups(graph, groups, index, &mut connected) {
                continue;
            }

            let cycle = build_cycle(graph, groups, &connected, waiter)?;
            if !cycle.is_empty() {
                cycles.try_reserve(1).or_oom("cycle list")?;
                cycles.push(cycle);
            }
        }
    }

    let case = if cycles.is_empty() {
        CycleCase::No
    } else {
        CycleCase::Yes
    };
    Ok(CycleReport::new(case, cycles))
}

/// Marks every transaction blocked behind `seed` as `OffStack`.
fn expand_blocked(graph: &mut WaitGraph, groups: &TranGroupTable, seed: TranIndex) {
    let num_nodes = graph.num_nodes();
    let mut low = seed.as_usize();

    while low < num_nodes {
        let mut i = low;
        low = num_nodes;

        // Newly reached nodes below `i` lower the watermark and end the pass
        while i < num_nodes && i < low {
            // The node table never exceeds u32 slots
            let tran = TranIndex::new(i as u32);
            if graph.status(tran) == NodeStatus::OnStack {
                let mut cursor = 0;
                while let Some(waiter) = graph.waiter_at(tran, cursor) {
                    cursor += 1;
                    reach(graph, waiter, &mut low);
                }

                for (_, group) in groups.iter() {
                    if group.is_holder(tran) {
                        for &waiter in group.waiters() {
                            reach(graph, waiter, &mut low);
                        }
                    }
                }

                graph.set_status(tran, NodeStatus::OffStack);
            }
            i += 1;
        }
    }
}

#[inline]
fn reach(graph: &mut WaitGraph, tran: TranIndex, low: &mut usize) {
    if graph.status(tran) == NodeStatus::NotVisited {
        graph.set_status(tran, NodeStatus::OnStack);
        *low = (*low).min(tran.as_usize());
    }
}

/// Collects the groups connected to the search of `current`.
///
/// A group is connected if it is `current` or one of its waiters was reached.
/// Returns true if every holder of every connected group was reached.
fn collect_blocked_groups(
    graph: &WaitGraph,
    groups: &TranGroupTable,
    current: TranGroupIndex,
    connected: &mut Vec<TranGroupIndex>,
) -> bool {
    for (index, group) in groups.iter() {
        let is_connected = index == current
            || group
                .waiters()
                .iter()
                .any(|&w| graph.status(w) == NodeStatus::OffStack);
        if !is_connected {
            continue;
        }

        if !group
            .holders()
            .iter()
            .all(|&h| graph.status(h) == NodeStatus::OffStack)
        {
            return false;
        }

        // Capacity for every group was reserved up front
        connected.push(index);
    }
    true
}

/// Builds the cycle of the blocked holders plus the seeding waiter.
///
/// Each member is marked `OnTgCycle` so it is listed once.
fn build_cycle(
    graph: &mut WaitGraph,
    groups: &TranGroupTable,
    connected: &[TranGroupIndex],
    seed: TranIndex,
) -> WfgResult<Cycle> {
    let capacity = groups.total_holders().min(graph.num_nodes()) + 1;

    let mut waiters = Vec::new();
    waiters.try_reserve(capacity).or_oom("cycle record")?;

    let mut add = |graph: &mut WaitGraph, tran: TranIndex| {
        if graph.status(tran) == NodeStatus::OffStack {
            graph.set_status(tran, NodeStatus::OnTgCycle);
            waiters.push(CycleWaiter::new(tran, graph.resolver(tran)));
        }
    };

    for group in connected.iter().filter_map(|&index| groups.get(index)) {
        for &holder in group.holders() {
            add(graph, holder);
        }
    }
    // Already listed when the waiter also holds a connected group
    add(graph, seed);

    Ok(Cycle::new(CycleKind::TranGroup, waiters))
}
