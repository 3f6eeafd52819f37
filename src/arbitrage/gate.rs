//! Process-wide single-cycle execution flag.
//!
//! Acquired by the analyzer before dispatching an opportunity, released by
//! the position controller when the cycle ends (failed open or finished
//! close). While held, further opportunities are dropped silently.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct ExecutionGate {
    executing: Mutex<bool>,
}

impl ExecutionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the gate. Returns false when a cycle is already live.
    pub fn try_acquire(&self) -> bool {
        let mut executing = self.executing.lock();
        if *executing {
            return false;
        }
        *executing = true;
        true
    }

    /// Re-open the gate for the next opportunity.
    pub fn release(&self) {
        let mut executing = self.executing.lock();
        if *executing {
            *executing = false;
            info!("execution gate released, ready for next cycle");
        }
    }

    pub fn is_executing(&self) -> bool {
        *self.executing.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_until_released() {
        let gate = ExecutionGate::new();
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn release_without_acquire_is_harmless() {
        let gate = ExecutionGate::new();
        gate.release();
        assert!(!gate.is_executing());
        assert!(gate.try_acquire());
    }
}
