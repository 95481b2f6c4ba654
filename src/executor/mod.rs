//! Transaction execution strategies.
//!
//! This module provides the [`Executor`] trait with a revm-backed sequential
//! baseline and the grouped speculative executor.

mod grouped;
mod sequential;

pub use grouped::GroupedExecutor;
pub use sequential::SequentialExecutor;

use crate::Workload;

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Number of successfully executed transactions.
    pub successful: usize,
    /// Number of failed transactions (reverted or validation error).
    pub failed: usize,
    /// Gas used by the successful transactions.
    pub gas_used: u64,
}

impl ExecutionResult {
    pub fn new(successful: usize, failed: usize, gas_used: u64) -> Self {
        Self {
            successful,
            failed,
            gas_used,
        }
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Trait for different transaction execution strategies.
///
/// Every strategy must leave the database in the state sequential
/// execution of the workload in block order would produce.
pub trait Executor {
    /// The database type this executor operates on.
    type Database: revm::Database + revm::DatabaseCommit;

    /// Executes the workload on the given database.
    ///
    /// Returns the final database state with the execution counters, or an
    /// error if the workload could not be executed as a whole.
    fn execute(
        &self,
        db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
