//! Interface to the state collaborator.
//!
//! The scheduler never interprets transactions. It asks the backend for a
//! private snapshot at some watermark, lets the snapshot apply a transaction
//! outside any lock, and later asks the backend whether the snapshot's
//! footprint still holds against everything merged since.

use crate::types::{AccessSet, BlockTransaction, Receipt, TxnIndex, Watermark};
use std::collections::BTreeMap;

/// A private, copy-based view of the base state.
pub trait ExecutionSnapshot: Send + 'static {
    type Transaction;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Watermark of the base state this snapshot was taken at.
    fn base(&self) -> Watermark;

    /// Applies one transaction, spending at most `gas_limit`.
    fn apply(
        &mut self,
        tx: &Self::Transaction,
        index: TxnIndex,
        gas_limit: u64,
    ) -> Result<Receipt, Self::Error>;

    /// Addresses read or written so far.
    fn access_set(&self) -> &AccessSet;
}

/// The shared base state, owned by the merge coordinator.
pub trait StateBackend: Send + 'static {
    type Transaction: BlockTransaction + Send + Sync + 'static;
    type Snapshot: ExecutionSnapshot<Transaction = Self::Transaction>;

    /// Creates a snapshot rooted at `watermark`.
    fn snapshot(&self, watermark: Watermark) -> Self::Snapshot;

    /// Returns true if `snapshot` does not overlap anything merged after its base.
    fn can_merge(&self, snapshot: &Self::Snapshot, merged: &MergedAccessTable) -> bool {
        !merged.conflicts_with(snapshot.access_set(), snapshot.base())
    }

    /// Applies the snapshot's writes onto the base state.
    fn merge(&mut self, snapshot: Self::Snapshot);

    /// Consolidates the base state once the whole block is merged.
    fn finalize(&mut self, merged: &MergedAccessTable, block_len: usize);
}

/// Footprints of merged transactions, keyed by index.
#[derive(Debug, Clone, Default)]
pub struct MergedAccessTable {
    entries: BTreeMap<TxnIndex, AccessSet>,
}

impl MergedAccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, index: TxnIndex, access: AccessSet) {
        self.entries.insert(index, access);
    }

    /// Returns true if `access` intersects any footprint merged after `since`.
    pub fn conflicts_with(&self, access: &AccessSet, since: Watermark) -> bool {
        self.merged_after(since)
            .any(|(_, merged)| !merged.is_disjoint(access))
    }

    /// Footprints merged strictly after `since`, in index order.
    pub fn merged_after(
        &self,
        since: Watermark,
    ) -> impl Iterator<Item = (TxnIndex, &AccessSet)> + '_ {
        self.entries
            .range(since.next_index()..)
            .map(|(&index, access)| (index, access))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of every merged footprint.
    pub fn touched(&self) -> AccessSet {
        self.entries.values().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn set(bytes: &[u8]) -> AccessSet {
        bytes.iter().map(|&b| Address::with_last_byte(b)).collect()
    }

    #[test]
    fn test_conflicts_only_after_base() {
        let mut table = MergedAccessTable::new();
        table.record(0, set(&[1, 2]));
        table.record(1, set(&[3]));
        table.record(2, set(&[4]));

        // Snapshot taken before anything merged sees all three.
        assert!(table.conflicts_with(&set(&[1]), Watermark::GENESIS));
        // Index 0 merged before the snapshot: its footprint no longer matters.
        assert!(!table.conflicts_with(&set(&[1, 2]), Watermark::at(0)));
        assert!(table.conflicts_with(&set(&[4]), Watermark::at(1)));
        assert!(!table.conflicts_with(&set(&[4]), Watermark::at(2)));
        assert!(!table.conflicts_with(&set(&[9]), Watermark::GENESIS));
    }

    #[test]
    fn test_touched_is_union() {
        let mut table = MergedAccessTable::new();
        table.record(0, set(&[1, 2]));
        table.record(1, set(&[2, 3]));
        assert_eq!(table.touched(), set(&[1, 2, 3]));
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.merged_after(Watermark::at(0)).map(|(i, _)| i).collect::<Vec<_>>(),
            vec![1]
        );
    }
}
