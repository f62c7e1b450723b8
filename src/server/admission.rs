use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

/// Bounds the number of concurrently running measurement sessions. The counter is the only state
///  shared between connections.
#[derive(Debug)]
pub struct AdmissionGate {
    max_running: usize,
    running: AtomicUsize,
}

impl AdmissionGate {
    pub fn new(max_running: usize) -> AdmissionGate {
        AdmissionGate {
            max_running,
            running: AtomicUsize::new(0),
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Takes a slot if one is available
    pub fn try_acquire(&self) -> bool {
        let result = self.running.fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
            if running < self.max_running {
                Some(running + 1)
            }
            else {
                None
            }
        });
        trace!("admission: {:?} (max {})", result, self.max_running);
        result.is_ok()
    }

    /// Returns a slot. Panics if no slot is taken, since that means acquire / release calls are
    ///  unbalanced.
    pub fn release(&self) {
        let result = self.running.fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| running.checked_sub(1));
        if result.is_err() {
            panic!("admission gate released more often than acquired");
        }
    }

    /// Takes a slot that is returned when the permit is dropped
    pub fn try_acquire_permit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        if self.try_acquire() {
            Some(AdmissionPermit { gate: self.clone() })
        }
        else {
            None
        }
    }
}

#[must_use]
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
