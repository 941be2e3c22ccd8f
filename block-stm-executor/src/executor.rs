//! Parallel block executor driving Block-STM workers.

use crate::{
    counters,
    errors::{BlockStmError, Result},
    mvmemory::MVMemory,
    mvview::MVView,
    scheduler::{Scheduler, Task, MAX_BLOCK_SIZE},
    store::MultiStore,
    types::{MultiLocations, StoreSlots, StoreValue, TxnIndex, TxnVersion, Wave},
};
use crossbeam::utils::Backoff;
use std::{thread, time::Duration, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Configuration for parallel execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads. `0` picks `min(available cores, max_threads)`.
    pub num_threads: usize,
    /// Upper bound for the automatic thread count.
    pub max_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            max_threads: 32,
        }
    }
}

impl ExecutorConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    /// Number of workers to spawn for a block.
    pub fn num_workers(&self) -> Result<usize> {
        if self.max_threads == 0 {
            return Err(BlockStmError::InvalidArgument(
                "max_threads must be at least 1".to_string(),
            ));
        }
        Ok(match self.num_threads {
            0 => num_cpus::get().clamp(1, self.max_threads),
            n => n,
        })
    }
}

/// Counters of a successfully executed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    /// Incarnations started, including re-executions.
    pub executed_txns: usize,
    /// Validation tasks issued.
    pub validated_txns: usize,
    pub num_workers: usize,
    /// Bytes of the values written back to storage.
    pub written_bytes: usize,
}

/// Parallel Block-STM executor.
#[derive(Debug, Clone, Default)]
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

    /// Executes a block of `block_size` transactions and writes the resulting state to
    /// `storage`.
    ///
    /// `tx_executor` is called once per incarnation with a fresh view and may run
    /// several times for the same transaction. Side effects outside the view must be
    /// idempotent per transaction index; the last call for each index wins.
    ///
    /// Base storage is only read while the block executes. On any error nothing is
    /// written to it.
    pub fn execute_block<V, S, F>(
        &self,
        cancel: &CancellationToken,
        block_size: usize,
        stores: &StoreSlots,
        storage: &mut S,
        estimates: Option<Vec<MultiLocations>>,
        tx_executor: F,
    ) -> Result<BlockSummary>
    where
        V: StoreValue,
        S: MultiStore<V> + Sync,
        F: Fn(TxnIndex, &MVView<'_, V, S>) + Sync,
    {
        let start = Instant::now();
        let num_workers = self.config.num_workers()?;
        if block_size > MAX_BLOCK_SIZE {
            return Err(BlockStmError::InvalidArgument(format!(
                "block of {block_size} transactions exceeds the maximum of {MAX_BLOCK_SIZE}"
            )));
        }
        if let Some((_, key)) = stores.iter().find(|(_, key)| storage.get_kv_store(key).is_none()) {
            return Err(BlockStmError::UnknownStore(key.clone()));
        }

        let scheduler = Scheduler::new(block_size);
        let mvm = MVMemory::new(block_size, stores.clone(), estimates)?;
        // Cancelled by the caller or by a panicking worker.
        let block_cancel = cancel.child_token();

        let base: &S = storage;
        let workers = crossbeam::thread::scope(|scope| {
            for worker_id in 0..num_workers {
                let worker = Worker {
                    worker_id,
                    scheduler: &scheduler,
                    mvm: &mvm,
                    storage: base,
                    cancel: &block_cancel,
                    tx_executor: &tx_executor,
                };
                scope.spawn(move |_| {
                    let _guard = CancelOnPanic(worker.cancel);
                    worker.run();
                });
            }
        });

        if workers.is_err() {
            warn!(block_size, "worker panicked, block aborted");
            return Err(BlockStmError::WorkerPanicked);
        }
        if !scheduler.is_done() {
            let committed = scheduler.committed_idx();
            if cancel.is_cancelled() {
                warn!(block_size, committed, "block execution cancelled");
                return Err(BlockStmError::Cancelled);
            }
            warn!(block_size, committed, "workers exited before the block completed");
            return Err(BlockStmError::BlockIncomplete);
        }

        let written_bytes = mvm.write_snapshot(storage)?;

        let summary = BlockSummary {
            executed_txns: scheduler.executed_txns(),
            validated_txns: scheduler.validated_txns(),
            num_workers,
            written_bytes,
        };
        counters::set_block_gauges(summary.executed_txns, summary.validated_txns);
        info!(
            block_size,
            num_workers,
            executed_txns = summary.executed_txns,
            validated_txns = summary.validated_txns,
            written_bytes,
            elapsed = ?start.elapsed(),
            "executed block"
        );
        Ok(summary)
    }
}

/// Cancels the block when a worker unwinds, so that no sibling stays parked on a
/// dependency of the dead worker.
struct CancelOnPanic<'a>(&'a CancellationToken);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

struct Worker<'a, V: StoreValue, S: MultiStore<V>, F> {
    worker_id: usize,
    scheduler: &'a Scheduler,
    mvm: &'a MVMemory<V>,
    storage: &'a S,
    cancel: &'a CancellationToken,
    tx_executor: &'a F,
}

impl<'a, V, S, F> Worker<'a, V, S, F>
where
    V: StoreValue,
    S: MultiStore<V>,
    F: Fn(TxnIndex, &MVView<'_, V, S>),
{
    fn run(&self) {
        let backoff = Backoff::new();
        let mut task = Task::Wait;
        loop {
            task = match task {
                Task::Execute(version) => self.try_execute(version),
                Task::Validate(version, wave) => self.needs_reexecution(version, wave),
                Task::Wait => {
                    if self.cancel.is_cancelled() {
                        debug!(worker_id = self.worker_id, "worker observed cancellation");
                        break;
                    }
                    self.scheduler.process_commits();
                    let next = self.scheduler.next_task();
                    if next != Task::Wait {
                        backoff.reset();
                    } else if backoff.is_completed() {
                        thread::sleep(Duration::from_micros(10));
                    } else {
                        backoff.snooze();
                    }
                    next
                }
                Task::Done => break,
            };
        }
        trace!(worker_id = self.worker_id, "worker exited");
    }

    /// Runs one incarnation and publishes its effects. An incarnation that gave up on a
    /// dependency because of cancellation is dropped without recording anything.
    fn try_execute(&self, version: TxnVersion) -> Task {
        let view = self
            .mvm
            .view(version.index, self.scheduler, self.storage, self.cancel);
        (self.tx_executor)(version.index, &view);
        if view.is_cancelled() {
            return Task::Wait;
        }

        let wrote_new_location = self.mvm.record(version, &view);
        self.scheduler.finish_execution(version, wrote_new_location)
    }

    fn needs_reexecution(&self, version: TxnVersion, wave: Wave) -> Task {
        let valid = self.mvm.validate_read_set(version.index);
        let aborted = !valid && self.scheduler.try_validation_abort(version);
        if aborted {
            debug!(
                txn_idx = version.index,
                incarnation = version.incarnation,
                wave,
                "validation failed, aborting"
            );
            self.mvm.convert_writes_to_estimates(version.index);
        }
        self.scheduler.finish_validation(version, wave, aborted, valid)
    }
}
