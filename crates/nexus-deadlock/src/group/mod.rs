//! Transaction group store.
//!
//! A transaction group is a resource held collectively by several
//! transactions and waited on by others. It generalizes a wait edge to a
//! hyper-edge: every waiter of the group is blocked by all of its holders
//! together.
//!
//! Membership is plain lists of transaction indices; groups are never
//! destroyed individually, only together with the whole table.

use std::fmt;

use nexus_common::types::{TranGroupIndex, TranIndex};

use crate::error::{ReserveExt, WfgResult};

/// A collectively held resource.
#[derive(Debug, Clone, Default)]
pub struct TranGroup {
    holders: Vec<TranIndex>,
    waiters: Vec<TranIndex>,
}

impl TranGroup {
    /// The holding transactions, in insertion order.
    pub fn holders(&self) -> &[TranIndex] {
        &self.holders
    }

    /// The waiting transactions, in insertion order.
    pub fn waiters(&self) -> &[TranIndex] {
        &self.waiters
    }

    /// Number of holders.
    pub fn num_holders(&self) -> usize {
        self.holders.len()
    }

    /// Number of waiters.
    pub fn num_waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Returns true if `tran` holds this group.
    pub fn is_holder(&self, tran: TranIndex) -> bool {
        self.holders.contains(&tran)
    }

    /// Returns true if `tran` waits on this group.
    pub fn is_waiter(&self, tran: TranIndex) -> bool {
        self.waiters.contains(&tran)
    }

    /// Returns true if the group both has holders and is waited on.
    pub fn is_contended(&self) -> bool {
        !self.holders.is_empty() && !self.waiters.is_empty()
    }
}

fn insert_member(list: &mut Vec<TranIndex>, tran: TranIndex) -> WfgResult<bool> {
    if list.contains(&tran) {
        return Ok(false);
    }
    list.try_reserve(1).or_oom("group membership")?;
    list.push(tran);
    Ok(true)
}

fn remove_member(list: &mut Vec<TranIndex>, tran: TranIndex) -> bool {
    match list.iter().position(|&t| t == tran) {
        Some(position) => {
            list.remove(position);
            true
        }
        None => false,
    }
}

/// The table of transaction groups.
///
/// Append-only; guarded by [`DeadlockDetector`](crate::DeadlockDetector)
/// together with the wait graph.
#[derive(Debug, Clone, Default)]
pub struct TranGroupTable {
    groups: Vec<TranGroup>,
}

impl TranGroupTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new empty group and returns its index.
    pub fn create_group(&mut self) -> WfgResult<TranGroupIndex> {
        // Group indices are u32; the table never outgrows them
        let index = TranGroupIndex::new(self.groups.len() as u32);
        self.groups.try_reserve(1).or_oom("transaction group table")?;
        self.groups.push(TranGroup::default());
        tracing::trace!(group = index.as_u32(), "transaction group created");
        Ok(index)
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if no group was created.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns the group at `index`.
    pub fn get(&self, index: TranGroupIndex) -> Option<&TranGroup> {
        self.groups.get(index.as_usize())
    }

    /// Iterates over all groups in index order.
    pub fn iter(&self) -> impl Iterator<Item = (TranGroupIndex, &TranGroup)> {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, g)| (TranGroupIndex::new(i as u32), g))
    }

    fn group_mut(&mut self, index: TranGroupIndex) -> &mut TranGroup {
        debug_assert!(
            index.as_usize() < self.groups.len(),
            "group {} out of range",
            index
        );
        &mut self.groups[index.as_usize()]
    }

    /// Registers `tran` as a holder of `group`.
    ///
    /// Returns false if it already was one.
    pub fn add_holder(&mut self, group: TranGroupIndex, tran: TranIndex) -> WfgResult<bool> {
        let added = insert_member(&mut self.group_mut(group).holders, tran)?;
        tracing::trace!(
            group = group.as_u32(),
            tran = tran.as_u32(),
            added,
            "group holder added"
        );
        Ok(added)
    }

    /// Removes `tran` from the holders of `group`.
    ///
    /// Returns false if it was not a holder.
    pub fn remove_holder(&mut self, group: TranGroupIndex, tran: TranIndex) -> bool {
        let removed = remove_member(&mut self.group_mut(group).holders, tran);
        tracing::trace!(
            group = group.as_u32(),
            tran = tran.as_u32(),
            removed,
            "group holder removed"
        );
        removed
    }

    /// Registers `tran` as a waiter of `group`.
    ///
    /// Returns false if it already was one.
    pub fn add_waiter(&mut self, group: TranGroupIndex, tran: TranIndex) -> WfgResult<bool> {
        let added = insert_member(&mut self.group_mut(group).waiters, tran)?;
        tracing::trace!(
            group = group.as_u32(),
            tran = tran.as_u32(),
            added,
            "group waiter added"
        );
        Ok(added)
    }

    /// Removes `tran` from the waiters of `group`.
    ///
    /// Returns false if it was not a waiter.
    pub fn remove_waiter(&mut self, group: TranGroupIndex, tran: TranIndex) -> bool {
        let removed = remove_member(&mut self.group_mut(group).waiters, tran);
        tracing::trace!(
            group = group.as_u32(),
            tran = tran.as_u32(),
            removed,
            "group waiter removed"
        );
        removed
    }

    /// Returns true if `tran` waits on any group.
    pub fn is_waiter_anywhere(&self, tran: TranIndex) -> bool {
        self.groups.iter().any(|g| g.is_waiter(tran))
    }

    /// Counts the memberships of `tran`, as holder or waiter, across all groups.
    pub fn tran_entries(&self, tran: TranIndex) -> usize {
        self.groups
            .iter()
            .map(|g| usize::from(g.is_holder(tran)) + usize::from(g.is_waiter(tran)))
            .sum()
    }

    /// Total holder memberships across all groups.
    pub fn total_holders(&self) -> usize {
        self.groups.iter().map(TranGroup::num_holders).sum()
    }

    /// Drops every group.
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

impl fmt::Display for TranGroupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups.is_empty() {
            return Ok(());
        }
        writeln!(f)?;
        writeln!(f, "------------- WFG_TG contents -------------")?;
        for (index, group) in self.iter() {
            writeln!(
                f,
                "{}:\t Num_holders {}, Num_waiters {}",
                index,
                group.num_holders(),
                group.num_waiters()
            )?;
            if group.holders.is_empty() {
                continue;
            }
            write!(f, "\t holders = {{ ")?;
            for holder in &group.holders {
                write!(f, "{} ", holder)?;
            }
            writeln!(f, "}}")?;
            if !group.waiters.is_empty() {
                write!(f, "\t waiters = {{ ")?;
                for waiter in &group.waiters {
                    write!(f, "{} ", waiter)?;
                }
                writeln!(f, "}}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u32) -> TranIndex {
        TranIndex::new(n)
    }

    #[test]
    fn test_create_group_append_only() {
        let mut table = TranGroupTable::new();
        assert!(table.is_empty());

        let g0 = table.create_group().unwrap();
        let g1 = table.create_group().unwrap();
        assert_eq!(g0, TranGroupIndex::new(0));
        assert_eq!(g1, TranGroupIndex::new(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_holder_membership() {
        let mut table = TranGroupTable::new();
        let g = table.create_group().unwrap();

        assert!(table.add_holder(g, t(1)).unwrap());
        assert!(table.add_holder(g, t(2)).unwrap());
        assert!(!table.add_holder(g, t(1)).unwrap());

        let group = table.get(g).unwrap();
        assert_eq!(group.holders(), &[t(1), t(2)]);
        assert_eq!(group.num_holders(), 2);

        assert!(table.remove_holder(g, t(1)));
        assert!(!table.remove_holder(g, t(1)));
        assert_eq!(table.get(g).unwrap().holders(), &[t(2)]);
    }

    #[test]
    fn test_waiter_membership() {
        let mut table = TranGroupTable::new();
        let g0 = table.create_group().unwrap();
        let g1 = table.create_group().unwrap();

        table.add_waiter(g1, t(3)).unwrap();
        assert!(table.is_waiter_anywhere(t(3)));
        assert!(!table.is_waiter_anywhere(t(4)));
        assert_eq!(table.get(g0).unwrap().num_waiters(), 0);
        assert_eq!(table.get(g1).unwrap().num_waiters(), 1);

        assert!(table.remove_waiter(g1, t(3)));
        assert!(!table.is_waiter_anywhere(t(3)));
    }

    #[test]
    fn test_contended() {
        let mut table = TranGroupTable::new();
        let g = table.create_group().unwrap();

        table.add_holder(g, t(1)).unwrap();
        assert!(!table.get(g).unwrap().is_contended());
        table.add_waiter(g, t(2)).unwrap();
        assert!(table.get(g).unwrap().is_contended());
    }

    #[test]
    fn test_tran_entries() {
        let mut table = TranGroupTable::new();
        let g0 = table.create_group().unwrap();
        let g1 = table.create_group().unwrap();

        table.add_holder(g0, t(1)).unwrap();
        table.add_waiter(g1, t(1)).unwrap();
        table.add_holder(g1, t(1)).unwrap();

        assert_eq!(table.tran_entries(t(1)), 3);
        assert_eq!(table.tran_entries(t(2)), 0);
        assert_eq!(table.total_holders(), 2);
    }

    #[test]
    fn test_display() {
        let mut table = TranGroupTable::new();
        assert_eq!(format!("{}", table), "");

        let g = table.create_group().unwrap();
        table.add_holder(g, t(1)).unwrap();
        table.add_waiter(g, t(2)).unwrap();

        let dump = format!("{}", table);
        assert!(dump.contains("TG[0]:\t Num_holders 1, Num_waiters 1"));
        assert!(dump.contains("holders = { 1 }"));
        assert!(dump.contains("waiters = { 2 }"));
    }
}
