//! Reading receipts and logs back once the block is fully merged.

use crate::coordinator::{SchedulerStats, Slot};
use crate::error::{Result, SchedulerError};
use crate::types::Receipt;
use alloy_primitives::Log;
use std::time::Duration;

/// Outcome of executing one block.
#[derive(Debug)]
pub struct BlockExecution<S> {
    /// Receipts in block order, with cumulative gas filled in.
    pub receipts: Vec<Receipt>,
    /// All logs in block order.
    pub logs: Vec<Log>,
    /// Total gas used by the block.
    pub gas_used: u64,
    /// The base state after the last merge.
    pub state: S,
    pub stats: SchedulerStats,
    pub duration: Duration,
}

/// Flattens merged slots into receipts, logs and total gas.
///
/// Every slot must hold a merged receipt.
pub fn extract_receipts<P>(slots: Vec<Slot<P>>) -> Result<(Vec<Receipt>, Vec<Log>, u64)> {
    let mut receipts = Vec::with_capacity(slots.len());
    let mut logs = Vec::new();
    let mut cumulative_gas_used = 0u64;

    for (index, slot) in slots.into_iter().enumerate() {
        let Slot::Merged(mut receipt) = slot else {
            return Err(SchedulerError::InvariantViolation(format!(
                "transaction {index} not merged at completion"
            )));
        };
        cumulative_gas_used = cumulative_gas_used
            .checked_add(receipt.gas_used)
            .ok_or_else(|| {
                SchedulerError::InvariantViolation("cumulative gas overflow".to_string())
            })?;
        receipt.cumulative_gas_used = cumulative_gas_used;
        logs.extend(receipt.logs.iter().cloned());
        receipts.push(receipt);
    }

    Ok((receipts, logs, cumulative_gas_used))
}
