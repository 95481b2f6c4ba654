//! Fatal block execution errors.
//!
//! Conflicts and application failures that are retried never show up here;
//! only conditions that abort the whole block do.

use crate::types::TxnIndex;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("block execution failed: invariant violated: {0}")]
    InvariantViolation(String),
    #[error("block execution failed: transaction {index} kept failing: {reason}")]
    RetriesExhausted { index: TxnIndex, reason: String },
    #[error(
        "block execution failed: transaction {index} used {gas_used} gas, only {remaining} left in block"
    )]
    BlockGasExceeded {
        index: TxnIndex,
        gas_used: u64,
        remaining: u64,
    },
    #[error("block execution failed: work queue full ({capacity}) enqueueing {index}")]
    QueueOverflow { index: TxnIndex, capacity: usize },
    #[error("block execution failed: worker panicked")]
    WorkerPanicked,
    #[error("block execution failed: spawning worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, SchedulerError>;
