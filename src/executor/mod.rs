//! Block execution strategies.
//!
//! Both strategies run the same transfer logic from [`crate::transfer`]; they only
//! differ in how transactions are scheduled against the base state.

mod block_stm;
mod sequential;

pub use block_stm::BlockStmExecutor;
pub use sequential::SequentialExecutor;

use crate::{transfer::BankState, Workload};

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Number of transfers applied.
    pub successful: usize,
    /// Number of transfers rejected (bad signature, nonce or balance).
    pub failed: usize,
}

impl ExecutionResult {
    pub fn new(successful: usize, failed: usize) -> Self {
        Self { successful, failed }
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// A strategy for executing a block of transfers.
///
/// Every implementation must leave the state exactly as executing the workload's
/// transactions one by one, in order, would.
pub trait Executor {
    /// Executes the workload on `state` and returns the final state.
    fn execute(
        &self,
        state: BankState,
        workload: &Workload,
    ) -> block_stm_executor::Result<(BankState, ExecutionResult)>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
