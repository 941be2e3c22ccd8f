//! Scheduler for coordinating parallel execution and validation.
//!
//! Workers pull tasks from two cursors: `execution_idx` for first incarnations and
//! `validation_idx` for (re)validations. Validation is preferred whenever the
//! validation cursor trails the execution cursor. A commit sweep, gated by an
//! [`ArmedLock`], advances the committed prefix in index order.
//!
//! Lock order: `dependencies[b] -> txn_status[b], txn_status[t]` (dependency wait),
//! `validation_status[i] -> txn_status[i], dependencies[i], validation_status[i + 1]`
//! (finish execution). The commit sweep only ever try-locks.

use crate::{
    armed_lock::ArmedLock,
    condvar::DependencyCondvar,
    status::{TxnStatus, ValidationStatus},
    types::{TxnIndex, TxnVersion, Wave},
    utils::{pack_validation_idx, unpack_validation_idx},
};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Largest block the scheduler accepts. Leaves headroom in the 32-bit execution
/// cursor, which may overshoot the block size by the number of workers.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX >> 1) as usize;

/// Task for a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(TxnVersion),
    /// Validate the read-set of an executed incarnation at a wave.
    Validate(TxnVersion, Wave),
    /// No task currently available, retry later.
    Wait,
    /// All transactions are committed.
    Done,
}

/// Outcome of a single commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitAttempt {
    Committed,
    /// Another worker held a status lock of the next transaction.
    Contended,
    /// The next transaction is not ready to commit.
    Blocked,
}

#[derive(Debug, Default)]
struct CommitState {
    /// Next transaction to commit.
    index: TxnIndex,
    /// Max triggered wave over the committed prefix and the next transaction.
    wave: Wave,
}

pub struct Scheduler {
    /// Number of transactions in the block.
    block_size: TxnIndex,

    /// Next transaction to try to execute for the first time.
    execution_idx: AtomicU32,

    /// Next transaction to validate, packed with the current wave.
    validation_idx: AtomicU64,

    commit_lock: ArmedLock,
    commit_state: Mutex<CommitState>,

    /// Transactions suspended on each transaction.
    dependencies: Vec<CachePadded<Mutex<Vec<TxnIndex>>>>,
    txn_status: Vec<CachePadded<Mutex<TxnStatus>>>,
    validation_status: Vec<CachePadded<Mutex<ValidationStatus>>>,

    /// Whether every transaction is committed.
    done: AtomicBool,

    executed_txns: AtomicUsize,
    validated_txns: AtomicUsize,
}

impl Scheduler {
    /// Creates a scheduler for a block of `block_size` transactions.
    ///
    /// Panics if `block_size` exceeds [`MAX_BLOCK_SIZE`]; the driver rejects such
    /// blocks before building a scheduler.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size <= MAX_BLOCK_SIZE, "block too large: {block_size}");
        let block_size = block_size as TxnIndex;

        Self {
            block_size,
            execution_idx: AtomicU32::new(0),
            validation_idx: AtomicU64::new(0),
            commit_lock: ArmedLock::new(),
            commit_state: Mutex::new(CommitState::default()),
            dependencies: (0..block_size)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            txn_status: (0..block_size)
                .map(|idx| CachePadded::new(Mutex::new(TxnStatus::new(idx))))
                .collect(),
            validation_status: (0..block_size)
                .map(|_| CachePadded::new(Mutex::new(ValidationStatus::default())))
                .collect(),
            done: AtomicBool::new(block_size == 0),
            executed_txns: AtomicUsize::new(0),
            validated_txns: AtomicUsize::new(0),
        }
    }

    pub fn block_size(&self) -> TxnIndex {
        self.block_size
    }

    /// Checks if all transactions are committed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of committed transactions. Never decreases.
    pub fn committed_idx(&self) -> TxnIndex {
        self.commit_state.lock().index
    }

    /// Incarnations started so far.
    pub fn executed_txns(&self) -> usize {
        self.executed_txns.load(Ordering::Relaxed)
    }

    /// Validation tasks handed out so far.
    pub fn validated_txns(&self) -> usize {
        self.validated_txns.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Task dispatch
    // ========================================================================

    /// Gets the next task for a worker thread. Makes a single attempt: on a lost race
    /// it returns [`Task::Wait`] and the caller retries.
    pub fn next_task(&self) -> Task {
        if self.is_done() {
            return Task::Done;
        }

        let (idx_to_validate, wave) =
            unpack_validation_idx(self.validation_idx.load(Ordering::Acquire));
        let idx_to_execute = self.execution_idx.load(Ordering::Acquire);

        let prefer_validate = idx_to_validate < idx_to_execute.min(self.block_size)
            && self.txn_status[idx_to_validate as usize]
                .lock()
                .executed_once();

        if prefer_validate {
            return self.try_validate_next_version(idx_to_validate, wave);
        }
        if idx_to_execute < self.block_size {
            return self.try_execute_next_version();
        }
        Task::Wait
    }

    fn try_validate_next_version(&self, idx_to_validate: TxnIndex, wave: Wave) -> Task {
        let current = pack_validation_idx(idx_to_validate, wave);
        let next = pack_validation_idx(idx_to_validate + 1, wave);
        if self
            .validation_idx
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Task::Wait;
        }

        match self.txn_status[idx_to_validate as usize]
            .lock()
            .is_executed(false)
        {
            Some(incarnation) => {
                self.validated_txns.fetch_add(1, Ordering::Relaxed);
                Task::Validate(TxnVersion::new(idx_to_validate, incarnation), wave)
            }
            None => Task::Wait,
        }
    }

    fn try_execute_next_version(&self) -> Task {
        let idx_to_execute = self.execution_idx.fetch_add(1, Ordering::AcqRel);
        if idx_to_execute >= self.block_size {
            return Task::Wait;
        }
        self.try_incarnate(idx_to_execute)
    }

    fn try_incarnate(&self, txn_idx: TxnIndex) -> Task {
        match self.txn_status[txn_idx as usize].lock().try_set_executing() {
            Some(incarnation) => {
                self.executed_txns.fetch_add(1, Ordering::Relaxed);
                Task::Execute(TxnVersion::new(txn_idx, incarnation))
            }
            None => Task::Wait,
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Marks an incarnation as executed and wakes its dependents.
    ///
    /// If the validation cursor already passed the transaction, returns a validation
    /// task for it; a write to a new location additionally pulls the cursor back to
    /// the next transaction with a new wave.
    pub fn finish_execution(&self, version: TxnVersion, wrote_new_path: bool) -> Task {
        let txn_idx = version.index;
        let mut validation_status = self.validation_status[txn_idx as usize].lock();

        self.txn_status[txn_idx as usize].lock().set_executed();
        self.resume_dependencies(txn_idx);

        // Validations of older incarnations never count for this one.
        validation_status.reset_validated_wave();

        let (idx_to_validate, mut wave) =
            unpack_validation_idx(self.validation_idx.load(Ordering::Acquire));
        if idx_to_validate > txn_idx {
            if wrote_new_path {
                if let Some(new_wave) = self.decrease_validation_idx(txn_idx + 1) {
                    wave = new_wave;
                }
            }
            validation_status.set_required_wave(wave);
            self.validated_txns.fetch_add(1, Ordering::Relaxed);
            return Task::Validate(version, wave);
        }

        // The cursor will reach this transaction at the current wave or later.
        validation_status.set_required_wave(wave);
        Task::Wait
    }

    /// Records the outcome of a validation task.
    ///
    /// An aborted transaction is immediately re-incarnated when the execution cursor
    /// already passed it.
    pub fn finish_validation(
        &self,
        version: TxnVersion,
        wave: Wave,
        aborted: bool,
        valid: bool,
    ) -> Task {
        let txn_idx = version.index;
        if aborted {
            self.txn_status[txn_idx as usize].lock().set_ready_status();
            self.decrease_validation_idx(txn_idx + 1);
            if self.execution_idx.load(Ordering::Acquire) > txn_idx {
                return self.try_incarnate(txn_idx);
            }
        } else if valid {
            let mut validation_status = self.validation_status[txn_idx as usize].lock();
            let status = self.txn_status[txn_idx as usize].lock();
            // A newer incarnation may have been recorded since the task was issued.
            if status.incarnation() == version.incarnation {
                validation_status.set_validated_wave(wave);
                drop(status);
                drop(validation_status);
                self.commit_lock.arm();
            }
        }
        Task::Wait
    }

    /// Executed -> Aborting for exactly this incarnation.
    pub fn try_validation_abort(&self, version: TxnVersion) -> bool {
        self.txn_status[version.index as usize]
            .lock()
            .try_validation_abort(version.incarnation)
    }

    /// Pulls the validation cursor back to `target_idx` and starts a new wave. Returns
    /// the new wave, or `None` if the cursor was not past `target_idx`.
    fn decrease_validation_idx(&self, target_idx: TxnIndex) -> Option<Wave> {
        if target_idx >= self.block_size {
            return None;
        }

        // Held across the update so a commit of `target_idx` cannot slip in between.
        let mut target_status = self.validation_status[target_idx as usize].lock();
        let prev = self
            .validation_idx
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (idx, wave) = unpack_validation_idx(packed);
                (idx > target_idx).then(|| pack_validation_idx(target_idx, wave + 1))
            })
            .ok()?;

        let new_wave = unpack_validation_idx(prev).1 + 1;
        target_status.set_triggered_wave(new_wave);
        trace!(target_idx, new_wave, "validation index decreased");
        Some(new_wave)
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// Registers `txn_idx` as waiting on `blocking_txn_idx`.
    ///
    /// Returns `None` if the blocking transaction already finished executing, in
    /// which case the caller should simply read again. Otherwise the transaction is
    /// now suspended and the caller must wait on the returned condvar.
    pub fn wait_for_dependency(
        &self,
        txn_idx: TxnIndex,
        blocking_txn_idx: TxnIndex,
    ) -> Option<DependencyCondvar> {
        let mut dependents = self.dependencies[blocking_txn_idx as usize].lock();
        if self.txn_status[blocking_txn_idx as usize]
            .lock()
            .is_executed(true)
            .is_some()
        {
            return None;
        }

        let cond = DependencyCondvar::new();
        self.txn_status[txn_idx as usize].lock().suspend(cond.clone());
        dependents.push(txn_idx);
        debug!(txn_idx, blocking_txn_idx, "suspended on dependency");
        Some(cond)
    }

    fn resume_dependencies(&self, txn_idx: TxnIndex) {
        let dependents = std::mem::take(&mut *self.dependencies[txn_idx as usize].lock());
        for dependent in dependents {
            self.txn_status[dependent as usize].lock().resume();
        }
    }

    // ========================================================================
    // Commit sweep
    // ========================================================================

    fn try_commit(&self) -> CommitAttempt {
        let mut commit_state = self.commit_state.lock();
        let commit_idx = commit_state.index;
        if commit_idx == self.block_size {
            return CommitAttempt::Blocked;
        }

        let Some(validation_status) = self.validation_status[commit_idx as usize].try_lock() else {
            return CommitAttempt::Contended;
        };
        let Some(mut status) = self.txn_status[commit_idx as usize].try_lock() else {
            return CommitAttempt::Contended;
        };
        if status.is_executed(false).is_none() {
            return CommitAttempt::Blocked;
        }

        commit_state.wave = commit_state.wave.max(validation_status.triggered_wave);
        let Some(validated_wave) = validation_status.validated_wave else {
            return CommitAttempt::Blocked;
        };
        if validated_wave < commit_state.wave.max(validation_status.required_wave) {
            return CommitAttempt::Blocked;
        }

        status.set_committed();
        commit_state.index += 1;
        if commit_state.index == self.block_size {
            self.done.store(true, Ordering::Release);
        }
        CommitAttempt::Committed
    }

    /// Commits as long a prefix as possible. Only one worker sweeps at a time and only
    /// after the commit lock was armed by a successful validation.
    pub fn process_commits(&self) {
        while self.commit_lock.try_lock() {
            let attempt = loop {
                match self.try_commit() {
                    CommitAttempt::Committed => continue,
                    attempt => break attempt,
                }
            };
            self.commit_lock.unlock();
            if attempt == CommitAttempt::Contended {
                // Let a later sweep retry once the holder released the status.
                self.commit_lock.arm();
                return;
            }
        }
    }
}
