//! Wait graph store: the node table and its wait edges.
//!
//! Every live transaction slot owns one node. A wait edge "W is blocked by H"
//! is stored once in an arena and referenced by handle from two adjacency
//! lists: W's holder list (whom W waits for) and H's waiter list (who waits
//! for H).
//!
//! ```text
//!   nodes[W].holders ──► EdgeId(4) ──► edges[4] = { waiter: W, holder: H }
//!   nodes[H].waiters ──► EdgeId(4) ──┘
//! ```
//!
//! Every allocation goes through `try_reserve` so that running out of memory
//! is reported as [`WfgError::OutOfMemory`](crate::error::WfgError) and never
//! leaves an edge linked on only one side.

use std::fmt;

use nexus_common::constants::MAX_TRANSACTION_SLOTS;
use nexus_common::types::TranIndex;

use crate::cycle::ResolverRef;
use crate::error::{ReserveExt, WfgError, WfgResult};

/// Visitation status of a node during a detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeStatus {
    /// Not reached by the current search.
    #[default]
    NotVisited,
    /// On the search stack.
    OnStack,
    /// Fully explored.
    OffStack,
    /// Pushed a second time to look for another cycle through it.
    ReOnStack,
    /// Already reported in a transaction-group cycle during this run.
    OnTgCycle,
}

/// Handle to an edge in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(usize);

impl EdgeId {
    /// Returns the arena slot.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// A wait edge: `waiter` is blocked by `holder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The blocked transaction.
    pub waiter: TranIndex,
    /// The transaction it waits for.
    pub holder: TranIndex,
}

/// Slot storage for edges with a free list.
///
/// The free list always has room for every slot, so releasing an edge
/// never allocates.
#[derive(Debug, Default)]
struct EdgeArena {
    slots: Vec<Option<Edge>>,
    free: Vec<EdgeId>,
    live: usize,
}

impl EdgeArena {
    /// Makes room for `additional` inserts that cannot fail.
    fn reserve(&mut self, additional: usize) -> WfgResult<()> {
        let new_slots = additional.saturating_sub(self.free.len());
        if new_slots == 0 {
            return Ok(());
        }
        self.slots.try_reserve(new_slots).or_oom("edge arena")?;
        let total_slots = self.slots.len() + new_slots;
        self.free
            .try_reserve(total_slots - self.free.len())
            .or_oom("edge free list")
    }

    /// Stores an edge. Capacity must have been reserved.
    fn insert(&mut self, edge: Edge) -> EdgeId {
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0] = Some(edge);
                id
            }
            None => {
                self.slots.push(Some(edge));
                EdgeId(self.slots.len() - 1)
            }
        }
    }

    /// Releases an edge slot.
    fn remove(&mut self, id: EdgeId) -> Option<Edge> {
        let edge = self.slots.get_mut(id.0).and_then(Option::take)?;
        self.live -= 1;
        self.free.push(id);
        Some(edge)
    }

    #[inline]
    fn get(&self, id: EdgeId) -> Option<&Edge> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn len(&self) -> usize {
        self.live
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}

/// One transaction slot in the wait graph.
#[derive(Default)]
pub(crate) struct Node {
    /// Visitation status of the current detection run.
    pub(crate) status: NodeStatus,
    /// Search region this node was last recorded in.
    pub(crate) cycle_group_no: Option<usize>,
    /// Resolver registered by the last recorded wait.
    pub(crate) resolver: Option<ResolverRef>,
    /// Edges on which this transaction is the waiter.
    pub(crate) holders: Vec<EdgeId>,
    /// Edges on which this transaction is the holder.
    pub(crate) waiters: Vec<EdgeId>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status)
            .field("cycle_group_no", &self.cycle_group_no)
            .field("has_resolver", &self.resolver.is_some())
            .field("holders", &self.holders.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// The wait graph store.
///
/// Not synchronized on its own; [`DeadlockDetector`](crate::DeadlockDetector)
/// guards it together with the transaction group table.
#[derive(Default)]
pub struct WaitGraph {
    nodes: Vec<Node>,
    edges: EdgeArena,
    /// Transactions with at least one outgoing edge.
    num_waiters: usize,
}

impl WaitGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph covering `capacity` transactions.
    pub fn with_capacity(capacity: usize) -> WfgResult<Self> {
        let mut graph = Self::new();
        graph.grow(capacity)?;
        Ok(graph)
    }

    /// Extends the node table to cover at least `capacity` transactions.
    ///
    /// Never shrinks; existing edges are preserved.
    pub fn grow(&mut self, capacity: usize) -> WfgResult<()> {
        debug_assert!(
            capacity <= MAX_TRANSACTION_SLOTS,
            "{} transaction slots exceed the index range",
            capacity
        );
        if capacity <= self.nodes.len() {
            return Ok(());
        }
        self.nodes
            .try_reserve(capacity - self.nodes.len())
            .or_oom("node table")?;
        self.nodes.resize_with(capacity, Node::default);
        Ok(())
    }

    /// Number of transaction slots.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of wait edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Number of transactions with at least one outgoing edge.
    pub fn num_waiters(&self) -> usize {
        self.num_waiters
    }

    /// Records that `waiter` is blocked by every transaction in `holders`.
    ///
    /// Holders `waiter` already waits for are skipped. The resolver replaces
    /// any previous registration of `waiter`. Either every new edge is linked
    /// or, on allocation failure, none is and the graph is unchanged.
    ///
    /// Returns the number of edges added.
    pub fn add_wait(
        &mut self,
        waiter: TranIndex,
        holders: &[TranIndex],
        resolver: Option<ResolverRef>,
    ) -> WfgResult<usize> {
        debug_assert!(self.contains(waiter), "waiter {} out of range", waiter);

        let mut fresh: Vec<TranIndex> = Vec::new();
        fresh.try_reserve(holders.len()).or_oom("holder batch")?;
        for &holder in holders {
            debug_assert!(self.contains(holder), "holder {} out of range", holder);
            debug_assert_ne!(waiter, holder, "transaction cannot wait for itself");
            if !fresh.contains(&holder) && !self.waits_for(waiter, holder) {
                fresh.push(holder);
            }
        }

        // Reserve everything first so the commit below cannot fail halfway
        self.edges.reserve(fresh.len())?;
        self.nodes[waiter.as_usize()]
            .holders
            .try_reserve(fresh.len())
            .or_oom("holder list")?;
        for &holder in &fresh {
            self.nodes[holder.as_usize()]
                .waiters
                .try_reserve(1)
                .or_oom("waiter list")?;
        }

        let was_waiting = !self.nodes[waiter.as_usize()].holders.is_empty();
        for &holder in &fresh {
            let id = self.edges.insert(Edge { waiter, holder });
            self.nodes[waiter.as_usize()].holders.push(id);
            self.nodes[holder.as_usize()].waiters.push(id);
        }
        if !was_waiting && !fresh.is_empty() {
            self.num_waiters += 1;
        }

        self.nodes[waiter.as_usize()].resolver = resolver;

        tracing::trace!(
            waiter = waiter.as_u32(),
            added = fresh.len(),
            edges = self.edges.len(),
            "wait edges added"
        );
        Ok(fresh.len())
    }

    /// Removes the edges from `waiter` to each of `holders`.
    ///
    /// Holders `waiter` does not wait for are ignored. Returns the number of
    /// edges removed.
    pub fn remove_wait(&mut self, waiter: TranIndex, holders: &[TranIndex]) -> usize {
        debug_assert!(self.contains(waiter), "waiter {} out of range", waiter);

        let mut removed = 0;
        for &holder in holders {
            let position = {
                let edges = &self.edges;
                self.nodes[waiter.as_usize()]
                    .holders
                    .iter()
                    .position(|&id| edges.get(id).map_or(false, |e| e.holder == holder))
            };
            if let Some(position) = position {
                let id = self.nodes[waiter.as_usize()].holders.remove(position);
                self.unlink_waiter_side(id);
                removed += 1;
            }
        }
        self.after_removal(waiter, removed);
        removed
    }

    /// Removes every outgoing edge of `waiter`.
    ///
    /// Returns the number of edges removed.
    pub fn clear_waits(&mut self, waiter: TranIndex) -> usize {
        debug_assert!(self.contains(waiter), "waiter {} out of range", waiter);

        let mut ids = std::mem::take(&mut self.nodes[waiter.as_usize()].holders);
        let removed = ids.len();
        for &id in &ids {
            self.unlink_waiter_side(id);
        }
        // Keep the list's capacity for the next wait
        ids.clear();
        self.nodes[waiter.as_usize()].holders = ids;

        self.after_removal(waiter, removed);
        removed
    }

    /// Drops the edge from its holder's waiter list and frees its slot.
    fn unlink_waiter_side(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges.remove(id) {
            let waiters = &mut self.nodes[edge.holder.as_usize()].waiters;
            if let Some(position) = waiters.iter().position(|&w| w == id) {
                waiters.remove(position);
            }
        }
    }

    fn after_removal(&mut self, waiter: TranIndex, removed: usize) {
        if removed > 0 && self.nodes[waiter.as_usize()].holders.is_empty() {
            self.num_waiters -= 1;
        }
        if removed > 0 {
            tracing::trace!(
                waiter = waiter.as_u32(),
                removed,
                edges = self.edges.len(),
                "wait edges removed"
            );
        }
    }

    /// Returns true if `tran` has a slot in the node table.
    #[inline]
    pub fn contains(&self, tran: TranIndex) -> bool {
        tran.as_usize() < self.nodes.len()
    }

    /// Returns true if `waiter` has an edge to `holder`.
    pub fn waits_for(&self, waiter: TranIndex, holder: TranIndex) -> bool {
        self.holders_of(waiter).any(|h| h == holder)
    }

    /// Returns true if `tran` has at least one outgoing edge.
    pub fn has_holders(&self, tran: TranIndex) -> bool {
        self.nodes
            .get(tran.as_usize())
            .map_or(false, |n| !n.holders.is_empty())
    }

    /// The transactions `tran` waits for, in insertion order.
    pub fn holders_of(&self, tran: TranIndex) -> impl Iterator<Item = TranIndex> + '_ {
        self.node_edges(tran, |n| &n.holders).map(|e| e.holder)
    }

    /// The transactions waiting for `tran`, in insertion order.
    pub fn waiters_of(&self, tran: TranIndex) -> impl Iterator<Item = TranIndex> + '_ {
        self.node_edges(tran, |n| &n.waiters).map(|e| e.waiter)
    }

    fn node_edges<'a>(
        &'a self,
        tran: TranIndex,
        list: fn(&Node) -> &Vec<EdgeId>,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.nodes
            .get(tran.as_usize())
            .map(list)
            .into_iter()
            .flatten()
            .filter_map(move |&id| self.edges.get(id))
    }

    /// The resolver registered for `tran`.
    pub fn resolver(&self, tran: TranIndex) -> Option<ResolverRef> {
        self.nodes
            .get(tran.as_usize())
            .and_then(|n| n.resolver.clone())
    }

    /// Replaces the resolver registered for `tran`.
    pub fn set_resolver(&mut self, tran: TranIndex, resolver: Option<ResolverRef>) {
        debug_assert!(self.contains(tran), "transaction {} out of range", tran);
        self.nodes[tran.as_usize()].resolver = resolver;
    }

    /// Counts adjacency entries of edges on which `tran` is the waiter.
    ///
    /// Each such edge is listed twice, once per endpoint.
    pub fn tran_entries(&self, tran: TranIndex) -> usize {
        let edges = &self.edges;
        self.nodes
            .iter()
            .flat_map(|n| n.holders.iter().chain(n.waiters.iter()))
            .filter(|&&id| edges.get(id).map_or(false, |e| e.waiter == tran))
            .count()
    }

    /// Total entries across all holder lists.
    pub fn holder_entries(&self) -> usize {
        self.nodes.iter().map(|n| n.holders.len()).sum()
    }

    /// Total entries across all waiter lists.
    pub fn waiter_entries(&self) -> usize {
        self.nodes.iter().map(|n| n.waiters.len()).sum()
    }

    /// Checks that both adjacency lists agree with the edge arena.
    pub fn verify(&self) -> WfgResult<()> {
        let holder_entries = self.holder_entries();
        let waiter_entries = self.waiter_entries();
        if holder_entries != self.num_edges() || waiter_entries != self.num_edges() {
            return Err(WfgError::internal(format!(
                "adjacency mismatch: {} holder entries, {} waiter entries, {} edges",
                holder_entries,
                waiter_entries,
                self.num_edges()
            )));
        }

        for (index, node) in self.nodes.iter().enumerate() {
            for &id in &node.holders {
                match self.edges.get(id) {
                    Some(edge) if edge.waiter.as_usize() == index => {}
                    _ => {
                        return Err(WfgError::internal(format!(
                            "node {} lists edge {} it does not wait on",
                            index,
                            id.as_usize()
                        )))
                    }
                }
            }
            for &id in &node.waiters {
                match self.edges.get(id) {
                    Some(edge) if edge.holder.as_usize() == index => {}
                    _ => {
                        return Err(WfgError::internal(format!(
                            "node {} lists edge {} it does not hold",
                            index,
                            id.as_usize()
                        )))
                    }
                }
            }
        }

        let waiters = self.nodes.iter().filter(|n| !n.holders.is_empty()).count();
        if waiters != self.num_waiters {
            return Err(WfgError::internal(format!(
                "waiter count {} does not match {} waiting nodes",
                self.num_waiters, waiters
            )));
        }
        Ok(())
    }

    /// Drops every edge and keeps the first `capacity` slots, emptied.
    ///
    /// Does not allocate.
    pub fn reset(&mut self, capacity: usize) {
        self.nodes.truncate(capacity);
        self.nodes.iter_mut().for_each(|n| *n = Node::default());
        self.edges.clear();
        self.num_waiters = 0;
    }

    // -------------------------------------------------------------------------
    // Detector access
    // -------------------------------------------------------------------------

    #[inline]
    pub(crate) fn node(&self, tran: TranIndex) -> &Node {
        &self.nodes[tran.as_usize()]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, tran: TranIndex) -> &mut Node {
        &mut self.nodes[tran.as_usize()]
    }

    #[inline]
    pub(crate) fn status(&self, tran: TranIndex) -> NodeStatus {
        self.nodes[tran.as_usize()].status
    }

    #[inline]
    pub(crate) fn set_status(&mut self, tran: TranIndex, status: NodeStatus) {
        self.nodes[tran.as_usize()].status = status;
    }

    /// The holder of the `cursor`-th outgoing edge of `tran`.
    #[inline]
    pub(crate) fn holder_at(&self, tran: TranIndex, cursor: usize) -> Option<TranIndex> {
        let id = *self.nodes[tran.as_usize()].holders.get(cursor)?;
        self.edges.get(id).map(|e| e.holder)
    }

    /// The waiter of the `cursor`-th incoming edge of `tran`.
    #[inline]
    pub(crate) fn waiter_at(&self, tran: TranIndex, cursor: usize) -> Option<TranIndex> {
        let id = *self.nodes[tran.as_usize()].waiters.get(cursor)?;
        self.edges.get(id).map(|e| e.waiter)
    }

    /// All transaction slots in index order.
    pub(crate) fn trans(&self) -> impl Iterator<Item = TranIndex> {
        // The node table never exceeds u32 slots
        (0..self.nodes.len() as u32).map(TranIndex::new)
    }

    /// Applies `f` to every node.
    pub(crate) fn for_each_node(&mut self, mut f: impl FnMut(&mut Node)) {
        self.nodes.iter_mut().for_each(|n| f(n));
    }
}

impl fmt::Debug for WaitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGraph")
            .field("num_nodes", &self.num_nodes())
            .field("num_edges", &self.num_edges())
            .field("num_waiters", &self.num_waiters())
            .finish()
    }
}

impl fmt::Display for WaitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "total_nodes = {}, total_edges = {}, total_waiters = {}",
            self.num_nodes(),
            self.num_edges(),
            self.num_waiters()
        )?;
        writeln!(f)?;
        writeln!(f, "---------- Ordinary WFG contents ----------")?;
        for tran in self.trans() {
            write!(f, "[node_{:03}]:\t holders = {{ ", tran.as_u32())?;
            for holder in self.holders_of(tran) {
                write!(f, "{:03} ", holder.as_u32())?;
            }
            writeln!(f, "}}")?;
            write!(f, "\t\t waiters = {{ ")?;
            for waiter in self.waiters_of(tran) {
                write!(f, "{:03} ", waiter.as_u32())?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
