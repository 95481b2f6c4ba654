//! Worker pool and block driver.

use crate::coordinator::{Candidate, MergeCoordinator};
use crate::error::{Result, SchedulerError};
use crate::grouping::{AddressGroups, GroupingStrategy};
use crate::queue::{completion, WorkQueue};
use crate::result::{extract_receipts, BlockExecution};
use crate::retry::RetryPolicy;
use crate::state::{ExecutionSnapshot, MergedAccessTable, StateBackend};
use crate::types::{Block, BlockTransaction, TxnIndex, Watermark};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    pub grouping: GroupingStrategy,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: 8,
            grouping: GroupingStrategy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Executes blocks speculatively on a pool of workers, merging in block order.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `block` on top of `state`.
    ///
    /// Returns once every transaction has been merged exactly once, or with
    /// the first fatal error. Partial results are never returned.
    pub fn execute_block<S: StateBackend>(
        &self,
        state: S,
        block: Block<S::Transaction>,
    ) -> Result<BlockExecution<S>> {
        let start = Instant::now();
        let Block {
            gas_limit,
            transactions,
        } = block;
        let num_txns = transactions.len();
        let num_workers = self.config.num_workers.max(1);

        let groups = AddressGroups::build(&transactions, self.config.grouping);
        info!(
            num_txns,
            groups = groups.len(),
            largest_group = groups.largest(),
            num_workers,
            "executing block"
        );

        if num_txns == 0 {
            let mut state = state;
            state.finalize(&MergedAccessTable::new(), 0);
            return Ok(BlockExecution {
                receipts: Vec::new(),
                logs: Vec::new(),
                gas_used: 0,
                state,
                stats: Default::default(),
                duration: start.elapsed(),
            });
        }

        let queue = Arc::new(WorkQueue::new(num_txns));
        let (signal, waiter) = completion();
        let coordinator = Arc::new(MergeCoordinator::new(
            state,
            groups,
            queue.clone(),
            gas_limit,
            signal,
        ));
        coordinator.seed()?;

        let transactions = Arc::new(transactions);
        let retries = Arc::new(RetryLedger::new(num_txns));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let worker = Worker {
                id: worker_id,
                coordinator: coordinator.clone(),
                queue: queue.clone(),
                transactions: transactions.clone(),
                retries: retries.clone(),
                policy: self.config.retry,
            };
            let spawned = thread::Builder::new()
                .name(format!("pall-worker-{worker_id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    coordinator.abort(SchedulerError::Spawn(err));
                    break;
                }
            }
        }

        let outcome = waiter.wait();
        queue.close();

        let mut panicked = false;
        for handle in handles {
            panicked |= handle.join().is_err();
        }
        outcome?;
        if panicked {
            return Err(SchedulerError::WorkerPanicked);
        }

        let coordinator = Arc::try_unwrap(coordinator).map_err(|_| {
            SchedulerError::InvariantViolation(
                "coordinator still shared after workers exited".to_string(),
            )
        })?;
        let stats = coordinator.stats();
        let (state, slots) = coordinator.into_parts();
        let (receipts, logs, gas_used) = extract_receipts(slots)?;

        let duration = start.elapsed();
        info!(
            num_txns,
            gas_used,
            executions = stats.executions,
            conflicts = stats.conflicts,
            apply_failures = stats.apply_failures,
            ?duration,
            "block executed"
        );

        Ok(BlockExecution {
            receipts,
            logs,
            gas_used,
            state,
            stats,
            duration,
        })
    }
}

/// Per-index apply failure counters.
struct RetryLedger {
    /// All failures, drives the backoff delay.
    total: Vec<AtomicU32>,
    /// Failures against a snapshot with every predecessor merged.
    charged: Vec<AtomicU32>,
}

impl RetryLedger {
    fn new(num_txns: usize) -> Self {
        Self {
            total: (0..num_txns).map(|_| AtomicU32::new(0)).collect(),
            charged: (0..num_txns).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Records a failure; returns (total, charged) counts including it.
    fn record(&self, index: TxnIndex, charge: bool) -> (u32, u32) {
        let total = self.total[index].fetch_add(1, Ordering::AcqRel) + 1;
        let charged = if charge {
            self.charged[index].fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.charged[index].load(Ordering::Acquire)
        };
        (total, charged)
    }
}

struct Worker<S: StateBackend> {
    id: usize,
    coordinator: Arc<MergeCoordinator<S>>,
    queue: Arc<WorkQueue>,
    transactions: Arc<Vec<S::Transaction>>,
    retries: Arc<RetryLedger>,
    policy: RetryPolicy,
}

impl<S: StateBackend> Worker<S> {
    fn run(self) {
        let _guard = AbortOnPanic(&*self.coordinator);
        let mut executed = 0usize;

        while let Some(index) = self.queue.dequeue() {
            trace!(worker = self.id, index, "dequeued");
            let Some(mut lease) = self.coordinator.begin(index) else {
                continue;
            };
            executed += 1;

            let tx = &self.transactions[index];
            match lease.snapshot.apply(tx, index, lease.gas_limit) {
                Ok(receipt) => self.coordinator.submit(Candidate {
                    index,
                    snapshot: lease.snapshot,
                    receipt,
                    gas_limit: tx.gas_limit(),
                }),
                Err(err) => self.retry_later(index, lease.snapshot.base(), &err),
            }
        }

        debug!(worker = self.id, executed, "worker done");
    }

    /// Backs off and re-enqueues an index whose apply step failed.
    fn retry_later(&self, index: TxnIndex, base: Watermark, err: &dyn std::error::Error) {
        self.coordinator.record_apply_failure();

        // With every predecessor merged the failure cannot be a stale read.
        let current = base.next_index() == index;
        let (total, charged) = self.retries.record(index, current);
        if current && self.policy.exhausted(charged) {
            self.coordinator.abort(SchedulerError::RetriesExhausted {
                index,
                reason: err.to_string(),
            });
            return;
        }

        let delay = self.policy.delay(total - 1);
        warn!(
            worker = self.id,
            index,
            base = %base,
            current,
            %err,
            ?delay,
            "apply failed, retrying"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if self.coordinator.is_ended() {
            return;
        }
        if let Err(err) = self.queue.enqueue(index) {
            self.coordinator.abort(err);
        }
    }
}

/// Aborts the block if the owning worker unwinds.
struct AbortOnPanic<'a, S: StateBackend>(&'a MergeCoordinator<S>);

impl<S: StateBackend> Drop for AbortOnPanic<'_, S> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort(SchedulerError::WorkerPanicked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ApplyError, MemorySnapshot, MemoryState, TRANSFER_GAS};
    use crate::testing::{addr, transfer, TestAccount};
    use crate::types::{AccessSet, AccountState, Receipt, Transaction};
    use alloy_primitives::{Address, U256};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const FUNDS: u64 = 1_000_000_000;

    fn funded_state(count: u8) -> MemoryState {
        MemoryState::with_accounts(
            Address::ZERO,
            (1..=count).map(|b| (addr(b), AccountState::new(0, U256::from(FUNDS)))),
        )
    }

    fn config(num_workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            num_workers,
            grouping: GroupingStrategy::UnionFind,
            retry: RetryPolicy::immediate(4),
        }
    }

    /// Builds transfers between `(from, to, value)` with sequential nonces.
    fn transfers(edges: &[(u8, u8, u64)]) -> Vec<Transaction> {
        let mut nonces: HashMap<u8, u64> = HashMap::new();
        edges
            .iter()
            .map(|&(from, to, value)| {
                let nonce = nonces.entry(from).or_insert(0);
                let tx = transfer(addr(from), addr(to), value, *nonce);
                *nonce += 1;
                tx
            })
            .collect()
    }

    /// Applies transactions one at a time, merging each before the next.
    fn serial(mut state: MemoryState, txs: &[Transaction]) -> (MemoryState, Vec<Receipt>) {
        let mut receipts = Vec::new();
        let mut watermark = Watermark::GENESIS;
        let mut cumulative = 0;
        for (index, tx) in txs.iter().enumerate() {
            let mut snapshot = state.snapshot(watermark);
            let mut receipt = snapshot.apply(tx, index, u64::MAX).expect("serially valid");
            state.merge(snapshot);
            watermark = Watermark::at(index);
            cumulative += receipt.gas_used;
            receipt.cumulative_gas_used = cumulative;
            receipts.push(receipt);
        }
        (state, receipts)
    }

    #[test]
    fn test_parallel_execution_simple() {
        let acc1 = TestAccount::from_seed(1);
        let acc2 = TestAccount::from_seed(2);
        let acc3 = TestAccount::from_seed(3);

        let state = MemoryState::with_accounts(
            Address::ZERO,
            [&acc1, &acc2, &acc3]
                .iter()
                .map(|acc| (acc.address, AccountState::new(0, U256::from(FUNDS)))),
        )
        .verify_signatures(true);

        let transactions = vec![
            acc1.sign_transfer(acc2.address, U256::from(10), 0),
            acc2.sign_transfer(acc3.address, U256::from(5), 0),
        ];

        let executor = ParallelExecutor::new(config(2));
        let result = executor
            .execute_block(state, Block::new(u64::MAX, transactions))
            .unwrap();

        assert_eq!(result.receipts.len(), 2);
        assert_eq!(result.gas_used, 2 * TRANSFER_GAS);
        assert_eq!(result.state.account(acc1.address).nonce, 1);
        assert_eq!(
            result.state.account(acc3.address).balance,
            U256::from(FUNDS + 5)
        );
        assert_eq!(
            result.state.account(Address::ZERO).balance,
            U256::from(2 * TRANSFER_GAS)
        );
    }

    #[test]
    fn test_matches_serial_execution() {
        let txs = transfers(&[(1, 2, 5), (3, 4, 7), (2, 3, 1), (5, 6, 9), (1, 5, 2), (4, 1, 3)]);
        let (expected_state, expected_receipts) = serial(funded_state(6), &txs);

        let result = ParallelExecutor::new(config(4))
            .execute_block(funded_state(6), Block::new(u64::MAX, txs))
            .unwrap();

        assert_eq!(result.receipts, expected_receipts);
        assert_eq!(result.state.into_accounts(), expected_state.into_accounts());
    }

    #[test]
    fn test_cumulative_gas_is_running_sum() {
        let txs = transfers(&[(1, 2, 1), (3, 4, 1), (5, 6, 1), (1, 3, 1)]);
        let result = ParallelExecutor::new(config(3))
            .execute_block(funded_state(6), Block::new(u64::MAX, txs))
            .unwrap();

        let mut sum = 0;
        for (index, receipt) in result.receipts.iter().enumerate() {
            assert_eq!(receipt.tx_index, index);
            sum += receipt.gas_used;
            assert_eq!(receipt.cumulative_gas_used, sum);
        }
        assert_eq!(result.gas_used, sum);
        assert_eq!(result.logs.len(), 4);
    }

    #[test]
    fn test_one_worker_and_eight_workers_agree() {
        let edges: Vec<(u8, u8, u64)> = (0..60u64)
            .map(|i| ((i % 7 + 1) as u8, ((i * 3) % 11 + 1) as u8, i + 1))
            .collect();
        let txs = transfers(&edges);

        let single = ParallelExecutor::new(config(1))
            .execute_block(funded_state(11), Block::new(u64::MAX, txs.clone()))
            .unwrap();
        let pooled = ParallelExecutor::new(config(8))
            .execute_block(funded_state(11), Block::new(u64::MAX, txs))
            .unwrap();

        assert_eq!(single.receipts, pooled.receipts);
        assert_eq!(single.logs, pooled.logs);
        assert_eq!(single.gas_used, pooled.gas_used);
        assert_eq!(single.state.into_accounts(), pooled.state.into_accounts());
    }

    #[test]
    fn test_single_address_block_is_serialized() {
        let edges: Vec<(u8, u8, u64)> = (0..20).map(|i| (1, 2 + (i % 5) as u8, 1)).collect();
        let txs = transfers(&edges);

        let result = ParallelExecutor::new(config(8))
            .execute_block(funded_state(6), Block::new(u64::MAX, txs))
            .unwrap();

        // Each transaction is released only after its predecessor merged.
        assert_eq!(result.stats.executions, 20);
        assert_eq!(result.stats.conflicts, 0);
        assert_eq!(result.stats.apply_failures, 0);
        assert_eq!(result.state.account(addr(1)).nonce, 20);
    }

    #[test]
    fn test_greedy_grouping_still_correct() {
        // Greedy grouping splits the transactions sent by 0xa across groups;
        // the merge step has to catch the stale reads.
        let txs = transfers(&[(10, 11, 1), (12, 13, 1), (12, 10, 1), (10, 14, 1), (10, 12, 1)]);
        let (expected_state, expected_receipts) = serial(funded_state(14), &txs);

        let executor = ParallelExecutor::new(ExecutorConfig {
            grouping: GroupingStrategy::Greedy,
            ..config(4)
        });
        let result = executor
            .execute_block(funded_state(14), Block::new(u64::MAX, txs))
            .unwrap();

        assert_eq!(result.receipts, expected_receipts);
        assert_eq!(result.state.into_accounts(), expected_state.into_accounts());
    }

    #[test]
    fn test_empty_block() {
        let result = ParallelExecutor::new(config(4))
            .execute_block(funded_state(1), Block::new(u64::MAX, Vec::new()))
            .unwrap();
        assert!(result.receipts.is_empty());
        assert_eq!(result.gas_used, 0);
        assert_eq!(result.state.finalized().map(|f| f.block_len), Some(0));
    }

    #[test]
    fn test_invalid_transaction_exhausts_retries() {
        // Address 9 has no funds.
        let txs = vec![transfer(addr(1), addr(2), 1, 0), transfer(addr(9), addr(2), 1, 0)];
        let err = ParallelExecutor::new(config(2))
            .execute_block(funded_state(2), Block::new(u64::MAX, txs))
            .unwrap_err();

        assert!(matches!(err, SchedulerError::RetriesExhausted { index: 1, .. }));
        assert!(err.to_string().starts_with("block execution failed"));
    }

    #[test]
    fn test_block_gas_limit_enforced() {
        let txs = transfers(&[(1, 2, 1), (1, 3, 1), (1, 4, 1)]);
        let err = ParallelExecutor::new(config(2))
            .execute_block(funded_state(4), Block::new(2 * TRANSFER_GAS, txs))
            .unwrap_err();

        // The third transfer no longer fits; its apply step keeps failing.
        assert!(matches!(err, SchedulerError::RetriesExhausted { index: 2, .. }));
    }

    #[test]
    fn test_gas_limited_block_independent_of_worker_count() {
        // The second transfer reserves more gas than is left after the first.
        let mut txs = transfers(&[(1, 2, 1), (3, 4, 1)]);
        txs[1].gas_limit = 30_000;

        for num_workers in [1, 2, 8] {
            for _ in 0..20 {
                let err = ParallelExecutor::new(config(num_workers))
                    .execute_block(funded_state(4), Block::new(50_000, txs.clone()))
                    .unwrap_err();
                assert!(
                    matches!(err, SchedulerError::RetriesExhausted { index: 1, .. }),
                    "{num_workers} workers: {err}"
                );
            }
        }

        // With room for both reservations every worker count succeeds.
        for num_workers in [1, 8] {
            let result = ParallelExecutor::new(config(num_workers))
                .execute_block(funded_state(4), Block::new(51_000, txs.clone()))
                .unwrap();
            assert_eq!(result.gas_used, 2 * TRANSFER_GAS);
        }
    }

    /// Failure injected by [`ScriptedState`].
    #[derive(thiserror::Error, Debug)]
    enum ScriptedError {
        #[error("injected failure")]
        Injected,
        #[error(transparent)]
        Apply(#[from] ApplyError),
    }

    #[derive(Debug, Clone, Copy)]
    enum Script {
        FailTimes(u32),
        Panic,
    }

    /// Memory state whose snapshots fail or panic on chosen indices.
    #[derive(Debug)]
    struct ScriptedState {
        inner: MemoryState,
        script: Arc<Mutex<HashMap<TxnIndex, Script>>>,
    }

    #[derive(Debug)]
    struct ScriptedSnapshot {
        inner: MemorySnapshot,
        script: Arc<Mutex<HashMap<TxnIndex, Script>>>,
    }

    impl StateBackend for ScriptedState {
        type Transaction = Transaction;
        type Snapshot = ScriptedSnapshot;

        fn snapshot(&self, watermark: Watermark) -> ScriptedSnapshot {
            ScriptedSnapshot {
                inner: self.inner.snapshot(watermark),
                script: self.script.clone(),
            }
        }

        fn can_merge(&self, snapshot: &ScriptedSnapshot, merged: &MergedAccessTable) -> bool {
            self.inner.can_merge(&snapshot.inner, merged)
        }

        fn merge(&mut self, snapshot: ScriptedSnapshot) {
            self.inner.merge(snapshot.inner);
        }

        fn finalize(&mut self, merged: &MergedAccessTable, block_len: usize) {
            self.inner.finalize(merged, block_len);
        }
    }

    impl ExecutionSnapshot for ScriptedSnapshot {
        type Transaction = Transaction;
        type Error = ScriptedError;

        fn base(&self) -> Watermark {
            self.inner.base()
        }

        fn apply(
            &mut self,
            tx: &Transaction,
            index: TxnIndex,
            gas_limit: u64,
        ) -> std::result::Result<Receipt, ScriptedError> {
            let action = self.script.lock().get(&index).copied();
            match action {
                Some(Script::FailTimes(n)) if n > 0 => {
                    self.script.lock().insert(index, Script::FailTimes(n - 1));
                    return Err(ScriptedError::Injected);
                }
                Some(Script::Panic) => panic!("scripted panic at {index}"),
                _ => {}
            }
            Ok(self.inner.apply(tx, index, gas_limit)?)
        }

        fn access_set(&self) -> &AccessSet {
            self.inner.access_set()
        }
    }

    fn scripted(script: &[(TxnIndex, Script)]) -> ScriptedState {
        ScriptedState {
            inner: funded_state(4),
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
        }
    }

    #[test]
    fn test_apply_failure_then_success() {
        let txs = transfers(&[(1, 2, 3), (3, 4, 5), (2, 3, 1)]);
        let state = scripted(&[(1, Script::FailTimes(1))]);

        let result = ParallelExecutor::new(config(3))
            .execute_block(state, Block::new(u64::MAX, txs))
            .unwrap();

        assert_eq!(result.stats.apply_failures, 1);
        assert_eq!(result.receipts[1].gas_used, TRANSFER_GAS);
        assert_eq!(result.receipts[1].cumulative_gas_used, 2 * TRANSFER_GAS);
        assert_eq!(result.gas_used, 3 * TRANSFER_GAS);
        assert_eq!(result.state.inner.account(addr(4)).balance, U256::from(FUNDS + 5));
    }

    #[test]
    fn test_worker_panic_aborts_block() {
        let txs = transfers(&[(1, 2, 1), (3, 4, 1)]);
        let state = scripted(&[(1, Script::Panic)]);

        let err = ParallelExecutor::new(config(2))
            .execute_block(state, Block::new(u64::MAX, txs))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerPanicked));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_parallel_equals_serial(
            edges in prop::collection::vec((1u8..9, 1u8..9, 1u64..1_000), 1..40),
            workers in 1usize..6,
            greedy in any::<bool>(),
        ) {
            let txs = transfers(&edges);
            let (expected_state, expected_receipts) = serial(funded_state(8), &txs);

            let executor = ParallelExecutor::new(ExecutorConfig {
                grouping: if greedy { GroupingStrategy::Greedy } else { GroupingStrategy::UnionFind },
                ..config(workers)
            });
            let result = executor
                .execute_block(funded_state(8), Block::new(u64::MAX, txs))
                .unwrap();

            prop_assert_eq!(result.receipts, expected_receipts);
            prop_assert_eq!(result.state.into_accounts(), expected_state.into_accounts());
        }
    }
}
