//! Address grouping.
//!
//! Transactions that touch a common address are placed in the same group and
//! are released to the workers one at a time, in block order. Grouping only
//! decides scheduling: a missed link costs wasted speculative work, the merge
//! step still rejects conflicting results.

use crate::types::{BlockTransaction, GroupId, TxnIndex};
use alloy_primitives::Address;
use std::collections::HashMap;

/// How transactions are partitioned into groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupingStrategy {
    /// Single pass that keeps only the most recent group per address.
    ///
    /// Order dependent: two groups linked by an address seen late in the
    /// block are not merged, and earlier members keep their old group.
    Greedy,
    /// Union-find over addresses; groups are exactly the connected
    /// components of the sender/recipient graph.
    #[default]
    UnionFind,
}

/// Partition of a block into address groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroups {
    /// Group id -> member indices in block order.
    groups: Vec<Vec<TxnIndex>>,
    /// Transaction index -> group id.
    tx_group: Vec<GroupId>,
}

impl AddressGroups {
    /// Groups `transactions` with the given strategy.
    pub fn build<T: BlockTransaction>(transactions: &[T], strategy: GroupingStrategy) -> Self {
        match strategy {
            GroupingStrategy::Greedy => Self::greedy(transactions),
            GroupingStrategy::UnionFind => Self::union_find(transactions),
        }
    }

    fn greedy<T: BlockTransaction>(transactions: &[T]) -> Self {
        let mut by_address: HashMap<Address, GroupId> = HashMap::new();
        let mut groups: Vec<Vec<TxnIndex>> = Vec::new();
        let mut tx_group = Vec::with_capacity(transactions.len());

        for (index, tx) in transactions.iter().enumerate() {
            let from = tx.sender();
            let to = tx.recipient();

            let mut group = groups.len();
            if let Some(&existing) = to.and_then(|to| by_address.get(&to)) {
                group = existing;
            }
            // The sender's group wins over the recipient's.
            if let Some(&existing) = by_address.get(&from) {
                group = existing;
            }

            by_address.insert(from, group);
            if let Some(to) = to {
                by_address.insert(to, group);
            }

            if group == groups.len() {
                groups.push(Vec::new());
            }
            groups[group].push(index);
            tx_group.push(group);
        }

        Self { groups, tx_group }
    }

    fn union_find<T: BlockTransaction>(transactions: &[T]) -> Self {
        let mut nodes = AddressUnion::default();
        let senders: Vec<usize> = transactions
            .iter()
            .map(|tx| {
                let from = nodes.node(tx.sender());
                if let Some(to) = tx.recipient() {
                    let to = nodes.node(to);
                    nodes.union(from, to);
                }
                from
            })
            .collect();

        // Number groups by the first transaction that reaches each root.
        let mut by_root: HashMap<usize, GroupId> = HashMap::new();
        let mut groups: Vec<Vec<TxnIndex>> = Vec::new();
        let mut tx_group = Vec::with_capacity(transactions.len());
        for (index, sender) in senders.into_iter().enumerate() {
            let root = nodes.find(sender);
            let group = *by_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(index);
            tx_group.push(group);
        }

        Self { groups, tx_group }
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of grouped transactions.
    pub fn num_txns(&self) -> usize {
        self.tx_group.len()
    }

    /// Group of the transaction at `index`.
    pub fn group_of(&self, index: TxnIndex) -> Option<GroupId> {
        self.tx_group.get(index).copied()
    }

    /// Members of `group` in block order.
    pub fn members(&self, group: GroupId) -> &[TxnIndex] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or_default()
    }

    /// First member of every group; these seed the work queue.
    pub fn heads(&self) -> impl Iterator<Item = TxnIndex> + '_ {
        self.groups.iter().filter_map(|members| members.first().copied())
    }

    /// Size of the largest group.
    pub fn largest(&self) -> usize {
        self.groups.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Disjoint sets over addresses, with path halving and union by rank.
#[derive(Default)]
struct AddressUnion {
    ids: HashMap<Address, usize>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl AddressUnion {
    fn node(&mut self, address: Address) -> usize {
        *self.ids.entry(address).or_insert_with(|| {
            self.parent.push(self.parent.len());
            self.rank.push(0);
            self.parent.len() - 1
        })
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => self.parent[a] = b,
            std::cmp::Ordering::Greater => self.parent[b] = a,
            std::cmp::Ordering::Equal => {
                self.parent[b] = a;
                self.rank[a] += 1;
            }
        }
    }
}
