//! Sequential transaction executor.
//!
//! The baseline: transfers run one at a time, in order, directly against the base
//! state.

use super::{ExecutionResult, Executor};
use crate::{
    transfer::{apply_transfer, BankState},
    Workload,
};
use block_stm_executor::execute_block_sequential;
use tracing::trace;

/// Sequential executor that processes transactions one at a time.
///
/// # Example
///
/// ```
/// use stm_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default());
/// let state = workload.genesis();
///
/// let executor = SequentialExecutor::new(true); // with signature verification
/// let (_final_state, result) = executor.execute(state, &workload).unwrap();
///
/// println!("Successful: {}, Failed: {}", result.successful, result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    /// Whether to verify signatures during execution.
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        mut state: BankState,
        workload: &Workload,
    ) -> block_stm_executor::Result<(BankState, ExecutionResult)> {
        let mut result = ExecutionResult::default();

        let num_txns = workload.payloads.len();
        execute_block_sequential::<Vec<u8>, _, _>(num_txns, &mut state, |txn_idx, view| {
            let payload = &workload.payloads[txn_idx as usize];
            match apply_transfer(view, payload, self.verify_signatures) {
                Ok(()) => result.successful += 1,
                Err(err) => {
                    trace!(txn_idx, %err, "transfer rejected");
                    result.failed += 1;
                }
            }
        });

        Ok((state, result))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
