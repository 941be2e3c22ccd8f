//! Block-STM parallel executor wrapper.
//!
//! Runs the transfer logic through [`ParallelExecutor`], optionally seeding the
//! multi-version memory with the write-sets predicted by
//! [`estimate_transfer`](crate::transfer::estimate_transfer).

use super::{ExecutionResult, Executor};
use crate::{
    transfer::{apply_transfer, estimate_transfer, store_keys, BankState},
    Workload,
};
use block_stm_executor::{
    estimate_block, ExecutorConfig, MVView, ParallelExecutor, StoreSlots, TxnIndex,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Payloads per rayon task when estimating.
const ESTIMATE_CHUNK_SIZE: usize = 64;

/// Block-STM parallel executor.
#[derive(Debug, Clone, Default)]
pub struct BlockStmExecutor {
    /// Worker threads; 0 selects one per CPU.
    pub num_threads: usize,
    pub verify_signatures: bool,
    /// Run the transfer pre-estimator before execution.
    pub pre_estimate: bool,
    pub cancel: CancellationToken,
}

impl BlockStmExecutor {
    pub fn new(num_threads: usize, verify_signatures: bool) -> Self {
        Self {
            num_threads,
            verify_signatures,
            ..Self::default()
        }
    }

    pub fn with_pre_estimate(mut self, pre_estimate: bool) -> Self {
        self.pre_estimate = pre_estimate;
        self
    }

    /// Aborts execution once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Executor for BlockStmExecutor {
    fn execute(
        &self,
        mut state: BankState,
        workload: &Workload,
    ) -> block_stm_executor::Result<(BankState, ExecutionResult)> {
        let (acc, bank) = store_keys();
        let stores = StoreSlots::new([acc, bank]);

        let estimates = self.pre_estimate.then(|| {
            estimate_block(&workload.payloads, ESTIMATE_CHUNK_SIZE, |payload: &Vec<u8>| {
                estimate_transfer(payload)
            })
        });

        // Every incarnation overwrites its receipt; the committed one is written last.
        let receipts: DashMap<TxnIndex, bool> = DashMap::with_capacity(workload.payloads.len());

        let executor = ParallelExecutor::new(ExecutorConfig::with_threads(self.num_threads));
        let summary = executor.execute_block(
            &self.cancel,
            workload.payloads.len(),
            &stores,
            &mut state,
            estimates,
            |txn_idx, view: &MVView<'_, Vec<u8>, _>| {
                let payload = &workload.payloads[txn_idx as usize];
                let ok = apply_transfer(view, payload, self.verify_signatures).is_ok();
                receipts.insert(txn_idx, ok);
            },
        )?;

        let successful = receipts.iter().filter(|receipt| *receipt.value()).count();
        let result = ExecutionResult::new(successful, receipts.len() - successful);
        debug!(
            executed = summary.executed_txns,
            validated = summary.validated_txns,
            workers = summary.num_workers,
            successful = result.successful,
            "block-stm workload executed"
        );

        Ok((state, result))
    }

    fn name(&self) -> &'static str {
        "block_stm_parallel"
    }
}
