//! Sequential transaction executor.
//!
//! The baseline: revm processes transactions one at a time, in block order,
//! with optional signature verification.

use revm::{
    context::TxEnv,
    database::{CacheDB, EmptyDB},
    primitives::TxKind,
    Context, ExecuteCommitEvm, MainBuilder, MainContext,
};
use tracing::{debug, trace};

use super::{ExecutionResult, Executor};
use crate::Workload;
use pall_tx_executor::TRANSFER_GAS;

/// Sequential executor that processes transactions one at a time.
///
/// # Example
///
/// ```
/// use pall_test::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default()).unwrap();
/// let db = workload.create_db();
///
/// let executor = SequentialExecutor::new(true); // with signature verification
/// let (_final_db, result) = executor.execute(db, &workload).unwrap();
///
/// assert_eq!(result.successful, 100);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    /// Whether to verify signatures during execution.
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    /// Creates a new sequential executor.
    ///
    /// # Arguments
    /// * `verify_signatures` - If true, recovers and verifies the signer address
    ///   from each transaction's signature before execution.
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    type Database = CacheDB<EmptyDB>;

    fn execute(
        &self,
        db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)> {
        let mut successful = 0;
        let mut failed = 0;
        let mut gas_used = 0;

        let mut evm = Context::mainnet().with_db(db).build_mainnet();

        for (index, tx) in workload.transactions.iter().enumerate() {
            if self.verify_signatures && !tx.verify() {
                trace!(index, "invalid signature");
                failed += 1;
                continue;
            }

            let tx_env = TxEnv {
                caller: tx.from,
                kind: TxKind::Call(tx.to),
                value: tx.value,
                gas_limit: TRANSFER_GAS,
                gas_price: tx.gas_price,
                nonce: tx.nonce,
                chain_id: Some(workload.config.chain_id),
                ..Default::default()
            };

            match evm.transact_commit(tx_env) {
                Ok(result) if result.is_success() => {
                    successful += 1;
                    gas_used += result.gas_used();
                }
                Ok(result) => {
                    trace!(index, ?result, "transaction reverted");
                    failed += 1;
                }
                Err(err) => {
                    trace!(index, %err, "transaction rejected");
                    failed += 1;
                }
            }
        }

        debug!(successful, failed, gas_used, "sequential execution done");
        Ok((
            evm.ctx.journaled_state.database,
            ExecutionResult::new(successful, failed, gas_used),
        ))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
