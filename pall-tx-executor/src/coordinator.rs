//! Merge coordinator: the single owner of the base state.
//!
//! Workers only ever see private snapshots. Every mutation of the base state,
//! the receipt slots, the merged footprints, the watermark and the gas pool
//! happens here, under one lock that is never held across an apply call.

use crate::error::{Result, SchedulerError};
use crate::grouping::AddressGroups;
use crate::queue::{CompletionSignal, WorkQueue};
use crate::state::{ExecutionSnapshot, MergedAccessTable, StateBackend};
use crate::types::{Receipt, TxnIndex, Watermark};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Unmerged result of one speculative execution.
#[derive(Debug)]
pub struct Candidate<P> {
    pub index: TxnIndex,
    pub snapshot: P,
    pub receipt: Receipt,
    /// Gas the transaction reserved from the pool.
    pub gas_limit: u64,
}

/// Receipt slot of one transaction.
#[derive(Debug)]
pub enum Slot<P> {
    /// Not executed, or cleared after a conflict.
    Empty,
    /// Latest execution result, waiting for its turn to merge.
    Candidate(Candidate<P>),
    /// Merged into the base state.
    Merged(Receipt),
}

impl<P> Default for Slot<P> {
    fn default() -> Self {
        Self::Empty
    }
}

/// What a worker needs to execute one transaction.
pub struct Lease<P> {
    pub snapshot: P,
    /// Gas left in the block when the snapshot was taken; advisory only.
    pub gas_limit: u64,
}

/// Counters describing how much work a block took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Speculative executions started.
    pub executions: usize,
    /// Candidates rejected at merge time.
    pub conflicts: usize,
    /// Apply calls that returned an error.
    pub apply_failures: usize,
    /// Dequeued indices that needed no execution.
    pub skipped: usize,
}

struct MergeState<S: StateBackend> {
    base: S,
    watermark: Watermark,
    slots: Vec<Slot<S::Snapshot>>,
    merged: MergedAccessTable,
    gas_pool: u64,
    /// Group id -> number of merged members.
    group_merged: Vec<usize>,
    ended: bool,
}

pub struct MergeCoordinator<S: StateBackend> {
    state: Mutex<MergeState<S>>,
    groups: AddressGroups,
    queue: Arc<WorkQueue>,
    completion: CompletionSignal,
    block_len: usize,

    executions: AtomicUsize,
    conflicts: AtomicUsize,
    apply_failures: AtomicUsize,
    skipped: AtomicUsize,
}

impl<S: StateBackend> MergeCoordinator<S> {
    pub fn new(
        base: S,
        groups: AddressGroups,
        queue: Arc<WorkQueue>,
        gas_limit: u64,
        completion: CompletionSignal,
    ) -> Self {
        let block_len = groups.num_txns();
        Self {
            state: Mutex::new(MergeState {
                base,
                watermark: Watermark::GENESIS,
                slots: (0..block_len).map(|_| Slot::Empty).collect(),
                merged: MergedAccessTable::new(),
                gas_pool: gas_limit,
                group_merged: vec![0; groups.len()],
                ended: false,
            }),
            groups,
            queue,
            completion,
            block_len,
            executions: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
            apply_failures: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    /// Enqueues the first transaction of every group.
    pub fn seed(&self) -> Result<()> {
        for head in self.groups.heads() {
            self.queue.enqueue(head)?;
        }
        Ok(())
    }

    /// Takes a snapshot for executing `index`, or `None` if there is nothing to do.
    ///
    /// Indices that are already merged, that have a pending candidate, or
    /// that arrive after the block ended are skipped.
    pub fn begin(&self, index: TxnIndex) -> Option<Lease<S::Snapshot>> {
        let state = self.state.lock();
        let pending = !matches!(state.slots.get(index), Some(Slot::Empty));
        if state.ended || state.watermark.covers(index) || pending {
            drop(state);
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(index, "skipping dequeued transaction");
            return None;
        }

        let lease = Lease {
            snapshot: state.base.snapshot(state.watermark),
            gas_limit: state.gas_pool,
        };
        drop(state);

        self.executions.fetch_add(1, Ordering::Relaxed);
        Some(lease)
    }

    /// Stores a candidate and merges as far as the slots allow.
    pub fn submit(&self, candidate: Candidate<S::Snapshot>) {
        let mut state = self.state.lock();
        if let Err(err) = self.submit_locked(&mut state, candidate) {
            self.abort_locked(&mut state, err);
        }
    }

    fn submit_locked(
        &self,
        state: &mut MergeState<S>,
        candidate: Candidate<S::Snapshot>,
    ) -> Result<()> {
        let index = candidate.index;
        if index >= self.block_len {
            return Err(SchedulerError::InvariantViolation(format!(
                "candidate {index} outside block of {}",
                self.block_len
            )));
        }
        if state.watermark.covers(index) {
            trace!(index, "ignoring candidate for merged transaction");
            return Ok(());
        }

        state.slots[index] = Slot::Candidate(candidate);
        if state.ended {
            return Ok(());
        }

        self.advance(state)?;

        if state.watermark.next_index() == self.block_len {
            self.complete(state);
        }
        Ok(())
    }

    /// Merges consecutive candidates starting right after the watermark.
    fn advance(&self, state: &mut MergeState<S>) -> Result<()> {
        let mut next = state.watermark.next_index();
        while next < self.block_len {
            let candidate = match std::mem::take(&mut state.slots[next]) {
                Slot::Candidate(candidate) => candidate,
                Slot::Empty => break,
                Slot::Merged(_) => {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "transaction {next} merged ahead of watermark {}",
                        state.watermark
                    )));
                }
            };

            if !state.base.can_merge(&candidate.snapshot, &state.merged) {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    index = next,
                    base = %candidate.snapshot.base(),
                    watermark = %state.watermark,
                    "conflict, re-executing"
                );
                // The slot stays empty so the index can run again.
                self.queue.enqueue(next)?;
                break;
            }

            // The pool the snapshot saw may have shrunk since; only a run
            // against the current pool decides whether the reservation fits.
            if candidate.gas_limit > state.gas_pool
                && candidate.snapshot.base() != state.watermark
            {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    index = next,
                    gas_limit = candidate.gas_limit,
                    gas_left = state.gas_pool,
                    "gas pool shrank since snapshot, re-executing"
                );
                self.queue.enqueue(next)?;
                break;
            }

            let gas_used = candidate.receipt.gas_used;
            state.gas_pool = state.gas_pool.checked_sub(gas_used).ok_or(
                SchedulerError::BlockGasExceeded {
                    index: next,
                    gas_used,
                    remaining: state.gas_pool,
                },
            )?;

            let access = candidate.snapshot.access_set().clone();
            state.base.merge(candidate.snapshot);
            state.merged.record(next, access);
            state.watermark = state.watermark.advance_to(next).ok_or_else(|| {
                SchedulerError::InvariantViolation(format!(
                    "watermark {} cannot advance to {next}",
                    state.watermark
                ))
            })?;
            state.slots[next] = Slot::Merged(candidate.receipt);
            debug!(index = next, gas_left = state.gas_pool, "merged");

            self.release_next_in_group(state, next)?;
            next += 1;
        }
        Ok(())
    }

    /// Enqueues the group member following the just merged `index`.
    fn release_next_in_group(&self, state: &mut MergeState<S>, index: TxnIndex) -> Result<()> {
        let group = self.groups.group_of(index).ok_or_else(|| {
            SchedulerError::InvariantViolation(format!("transaction {index} has no group"))
        })?;
        let members = self.groups.members(group);
        let merged = &mut state.group_merged[group];
        if members.get(*merged) != Some(&index) {
            return Err(SchedulerError::InvariantViolation(format!(
                "group {group} merged {index} out of order"
            )));
        }
        *merged += 1;
        if let Some(&released) = members.get(*merged) {
            trace!(group, released, "releasing next group member");
            self.queue.enqueue(released)?;
        }
        Ok(())
    }

    fn complete(&self, state: &mut MergeState<S>) {
        state.ended = true;
        state.base.finalize(&state.merged, self.block_len);
        self.queue.close();
        self.completion.fire(Ok(()));
        info!(
            block_len = self.block_len,
            groups = self.groups.len(),
            executions = self.executions.load(Ordering::Relaxed),
            conflicts = self.conflicts.load(Ordering::Relaxed),
            "block fully merged"
        );
    }

    /// Ends the block with a fatal error.
    pub fn abort(&self, err: SchedulerError) {
        let mut state = self.state.lock();
        self.abort_locked(&mut state, err);
    }

    fn abort_locked(&self, state: &mut MergeState<S>, err: SchedulerError) {
        if state.ended {
            return;
        }
        error!(%err, watermark = %state.watermark, "aborting block");
        state.ended = true;
        self.queue.close();
        self.completion.fire(Err(err));
    }

    pub fn record_apply_failure(&self) {
        self.apply_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn watermark(&self) -> Watermark {
        self.state.lock().watermark
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Gas left in the block.
    pub fn gas_pool(&self) -> u64 {
        self.state.lock().gas_pool
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executions: self.executions.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Returns the base state and the receipt slots.
    pub fn into_parts(self) -> (S, Vec<Slot<S::Snapshot>>) {
        let state = self.state.into_inner();
        (state.base, state.slots)
    }
}
