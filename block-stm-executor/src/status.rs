//! Per-transaction execution and validation status records.
//!
//! Both records live behind their own mutex in the scheduler. Methods here assume
//! the caller holds that mutex.

use crate::{
    condvar::DependencyCondvar,
    types::{Incarnation, TxnIndex, Wave},
};

/// Lifecycle of one transaction.
///
/// ```text
/// Ready -> Executing -> Executed -> Committed
///            |   ^         |
///            v   |         v
///         Suspended     Aborting -> Ready (incarnation + 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ready,
    Executing,
    Executed,
    Aborting,
    Suspended,
    Committed,
}

#[derive(Debug)]
pub struct TxnStatus {
    index: TxnIndex,
    incarnation: Incarnation,
    status: ExecutionStatus,
    /// Set while suspended, notified on resume.
    cond: Option<DependencyCondvar>,
}

impl TxnStatus {
    pub fn new(index: TxnIndex) -> Self {
        Self {
            index,
            incarnation: 0,
            status: ExecutionStatus::Ready,
            cond: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    fn bad_transition(&self, transition: &str) -> ! {
        panic!(
            "BadStateTransition: {} on txn {} (incarnation {}) in status {:?}",
            transition, self.index, self.incarnation, self.status
        )
    }

    /// Ready -> Executing. Returns the incarnation to execute.
    pub fn try_set_executing(&mut self) -> Option<Incarnation> {
        if self.status == ExecutionStatus::Ready {
            self.status = ExecutionStatus::Executing;
            return Some(self.incarnation);
        }
        None
    }

    pub fn set_executed(&mut self) {
        if self.status != ExecutionStatus::Executing {
            self.bad_transition("SetExecuted");
        }
        self.status = ExecutionStatus::Executed;
    }

    /// Executing -> Suspended, parking `cond` until [`TxnStatus::resume`].
    pub fn suspend(&mut self, cond: DependencyCondvar) {
        if self.status != ExecutionStatus::Executing {
            self.bad_transition("Suspend");
        }
        self.status = ExecutionStatus::Suspended;
        self.cond = Some(cond);
    }

    /// Suspended -> Executing, waking the parked worker.
    pub fn resume(&mut self) {
        if self.status != ExecutionStatus::Suspended {
            self.bad_transition("Resume");
        }
        self.status = ExecutionStatus::Executing;
        if let Some(cond) = self.cond.take() {
            cond.notify();
        }
    }

    /// Executed -> Aborting, only for the given incarnation.
    pub fn try_validation_abort(&mut self, incarnation: Incarnation) -> bool {
        if self.incarnation == incarnation && self.status == ExecutionStatus::Executed {
            self.status = ExecutionStatus::Aborting;
            return true;
        }
        false
    }

    /// Aborting -> Ready with the next incarnation.
    pub fn set_ready_status(&mut self) {
        if self.status != ExecutionStatus::Aborting {
            self.bad_transition("SetReadyStatus");
        }
        self.incarnation += 1;
        self.status = ExecutionStatus::Ready;
    }

    pub fn set_committed(&mut self) {
        if self.status != ExecutionStatus::Executed {
            self.bad_transition("SetCommitted");
        }
        self.status = ExecutionStatus::Committed;
    }

    /// The incarnation, if the transaction is executed (or committed when asked for).
    pub fn is_executed(&self, include_committed: bool) -> Option<Incarnation> {
        match self.status {
            ExecutionStatus::Executed => Some(self.incarnation),
            ExecutionStatus::Committed if include_committed => Some(self.incarnation),
            _ => None,
        }
    }

    /// Whether some incarnation finished, i.e. a read-set exists to validate.
    pub fn executed_once(&self) -> bool {
        self.incarnation > 0
            || matches!(
                self.status,
                ExecutionStatus::Executed | ExecutionStatus::Aborting | ExecutionStatus::Committed
            )
    }
}

/// Wave bookkeeping used to decide when a transaction may commit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationStatus {
    /// Highest wave of downstream revalidation this transaction caused.
    pub triggered_wave: Wave,
    /// Wave at which the latest incarnation must be validated.
    pub required_wave: Wave,
    /// Highest wave at which the latest incarnation passed validation.
    pub validated_wave: Option<Wave>,
}

impl ValidationStatus {
    pub fn set_triggered_wave(&mut self, wave: Wave) {
        self.triggered_wave = self.triggered_wave.max(wave);
    }

    pub fn set_required_wave(&mut self, wave: Wave) {
        self.required_wave = self.required_wave.max(wave);
    }

    pub fn set_validated_wave(&mut self, wave: Wave) {
        self.validated_wave = Some(self.validated_wave.map_or(wave, |w| w.max(wave)));
    }

    /// Forgets validations of earlier incarnations.
    pub fn reset_validated_wave(&mut self) {
        self.validated_wave = None;
    }
}
