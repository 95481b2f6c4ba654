//! Grouped speculative executor.
//!
//! Wraps [`pall_tx_executor::ParallelExecutor`] behind the [`Executor`]
//! trait: the `CacheDB` accounts become the in-memory base state, the
//! workload becomes one block, and the merged accounts are written back.

use crate::executor::{ExecutionResult, Executor};
use crate::{Workload, COINBASE};
use eyre::WrapErr;
use pall_tx_executor::{
    AccountState, ExecutorConfig, GroupingStrategy, MemoryState, ParallelExecutor,
};
use revm::database::{CacheDB, EmptyDB};
use tracing::debug;

/// Parallel executor merging speculative results in block order.
#[derive(Debug, Clone)]
pub struct GroupedExecutor {
    pub config: ExecutorConfig,
    pub verify_signatures: bool,
}

impl GroupedExecutor {
    /// Creates an executor with `num_workers` threads and default grouping.
    pub fn new(num_workers: usize, verify_signatures: bool) -> Self {
        Self {
            config: ExecutorConfig {
                num_workers,
                ..Default::default()
            },
            verify_signatures,
        }
    }

    pub fn with_grouping(mut self, grouping: GroupingStrategy) -> Self {
        self.config.grouping = grouping;
        self
    }
}

/// Loads every cached account into an in-memory base state.
fn state_from_db(db: &CacheDB<EmptyDB>, verify_signatures: bool) -> MemoryState {
    MemoryState::with_accounts(
        COINBASE,
        db.cache.accounts.iter().map(|(&address, account)| {
            (
                address,
                AccountState::new(account.info.nonce, account.info.balance),
            )
        }),
    )
    .verify_signatures(verify_signatures)
}

/// Writes balances and nonces back, keeping any other account fields.
fn write_back(db: &mut CacheDB<EmptyDB>, state: &MemoryState) {
    for (address, account) in state.accounts() {
        let mut info = db
            .cache
            .accounts
            .get(&address)
            .map(|cached| cached.info.clone())
            .unwrap_or_default();
        info.balance = account.balance;
        info.nonce = account.nonce;
        db.insert_account_info(address, info);
    }
}

impl Executor for GroupedExecutor {
    type Database = CacheDB<EmptyDB>;

    fn execute(
        &self,
        mut db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)> {
        let state = state_from_db(&db, self.verify_signatures);
        let block = workload.block();
        let num_txns = block.len();

        let executor = ParallelExecutor::new(self.config.clone());
        let outcome = executor
            .execute_block(state, block)
            .wrap_err_with(|| format!("grouped execution of {num_txns} transactions"))?;

        debug!(
            stats = ?outcome.stats,
            duration = ?outcome.duration,
            "grouped execution done"
        );
        write_back(&mut db, &outcome.state);

        Ok((
            db,
            ExecutionResult::new(outcome.receipts.len(), 0, outcome.gas_used),
        ))
    }

    fn name(&self) -> &'static str {
        "grouped"
    }
}
