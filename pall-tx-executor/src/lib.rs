//! Grouped speculative executor for blockchain transactions.
//!
//! Transactions of a block are partitioned into address groups, executed
//! speculatively on a pool of worker threads against private snapshots of the
//! base state, and merged back strictly in block order. A candidate whose
//! snapshot overlaps anything merged after it was taken is discarded and
//! re-executed, so the final state and receipts always match sequential
//! execution.
//!
//! # Core Components
//!
//! - **AddressGroups**: partitions the block by shared sender/recipient addresses
//! - **WorkQueue**: bounded queue of runnable indices plus the completion signal
//! - **MergeCoordinator**: owns the base state, merges candidates in order
//! - **ParallelExecutor**: worker pool and block driver
//! - **MemoryState**: in-memory base state with ETH transfer semantics
//!
//! # Algorithm Overview
//!
//! 1. The first transaction of every group is enqueued
//! 2. A worker takes an index, snapshots the base state at the current
//!    watermark and applies the transaction outside any lock
//! 3. The candidate is stored in its receipt slot; the coordinator merges
//!    consecutive candidates after the watermark while their footprints do
//!    not intersect anything merged since their snapshot
//! 4. A conflicting candidate is cleared and its index re-enqueued
//! 5. Merging a transaction releases the next member of its group
//! 6. Once the last index merges, the base state is finalized and the block
//!    completes
//!
//! # Example
//!
//! ```rust,ignore
//! use pall_tx_executor::{Block, ExecutorConfig, MemoryState, ParallelExecutor};
//! use alloy_primitives::Address;
//!
//! let state = MemoryState::new(Address::ZERO);
//! let executor = ParallelExecutor::new(ExecutorConfig::default());
//! let result = executor.execute_block(state, Block::new(30_000_000, transactions))?;
//!
//! println!("gas used: {}, receipts: {}", result.gas_used, result.receipts.len());
//! ```

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod memory;
pub mod queue;
pub mod result;
pub mod retry;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;

pub use coordinator::SchedulerStats;
pub use error::{Result, SchedulerError};
pub use executor::{ExecutorConfig, ParallelExecutor};
pub use grouping::{AddressGroups, GroupingStrategy};
pub use memory::{ApplyError, MemorySnapshot, MemoryState, TRANSFER_GAS};
pub use result::BlockExecution;
pub use retry::RetryPolicy;
pub use state::{ExecutionSnapshot, MergedAccessTable, StateBackend};
pub use types::{
    signing_hash, AccessSet, AccountState, Block, BlockTransaction, Receipt, Transaction,
    TxnIndex, Watermark,
};
