//! One-shot notification used to park a worker on a dependency.

use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// How often a parked worker re-checks the cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Flag + condvar pair shared by the waiting worker and the dependency list of the
/// transaction it waits on. Notifying is idempotent.
#[derive(Debug, Clone, Default)]
pub struct DependencyCondvar {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl DependencyCondvar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let (lock, cvar) = &*self.inner;
        let mut resolved = lock.lock();
        *resolved = true;
        cvar.notify_all();
    }

    /// Blocks until notified. Returns `false` if `cancel` fired first.
    pub fn wait(&self, cancel: &CancellationToken) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut resolved = lock.lock();
        while !*resolved {
            if cancel.is_cancelled() {
                return false;
            }
            cvar.wait_for(&mut resolved, CANCEL_POLL_INTERVAL);
        }
        true
    }

    pub fn is_notified(&self) -> bool {
        *self.inner.0.lock()
    }
}
