//! Two-bit gate for the commit sweep.
//!
//! The lock can only be taken while it is armed, and taking it disarms it. Validators
//! arm the lock whenever a validation succeeds, so a sweep runs at most once per
//! burst of successful validations instead of once per validation.

use std::sync::atomic::{AtomicU8, Ordering};

const LOCKED: u8 = 0b01;
const ARMED: u8 = 0b10;

#[derive(Debug)]
pub struct ArmedLock {
    state: AtomicU8,
}

impl ArmedLock {
    /// Starts armed and unlocked.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
        }
    }

    /// Takes the lock if it is armed and free, disarming it in the same step.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(ARMED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.state.fetch_and(!LOCKED, Ordering::Release);
    }

    pub fn arm(&self) {
        self.state.fetch_or(ARMED, Ordering::Release);
    }
}

impl Default for ArmedLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_requires_arming() {
        let lock = ArmedLock::new();
        assert!(lock.try_lock());
        // Held.
        assert!(!lock.try_lock());

        lock.unlock();
        // Free but disarmed.
        assert!(!lock.try_lock());

        lock.arm();
        assert!(lock.try_lock());
    }

    #[test]
    fn test_arm_while_locked() {
        let lock = ArmedLock::new();
        assert!(lock.try_lock());
        lock.arm();
        assert!(!lock.try_lock());
        lock.unlock();
        // Arming survived the unlock.
        assert!(lock.try_lock());
    }
}
