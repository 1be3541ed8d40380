//! Single-flight gate
//!
//! At most one holder at a time; the holder releases by dropping its guard,
//! so every exit path of a dispatch (success, failure, panic) frees the gate.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SingleFlightGate {
    held: AtomicBool,
}

impl SingleFlightGate {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Take the gate, or `None` if someone already holds it.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof of holding the gate; dropping it releases.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a SingleFlightGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.held.store(false, Ordering::Release);
    }
}
