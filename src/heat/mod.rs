// src/heat/mod.rs - the thermal subsystem as seen from the interpreter
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-heater fault flags. A fault is raised from interrupt-style callbacks
/// (over-temperature trip, sensor failure) with a single lock-free store;
/// the interpreter reads the flags at defined checkpoints and treats a set
/// flag as an abort signal for the protocol in flight.
#[derive(Debug)]
pub struct FaultFlags {
    flags: Vec<AtomicBool>,
}

impl FaultFlags {
    pub fn new(heater_count: usize) -> Self {
        Self {
            flags: (0..heater_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Safe to call from interrupt context: one atomic store, no locks.
    pub fn raise(&self, heater: usize) {
        if let Some(f) = self.flags.get(heater) {
            f.store(true, Ordering::SeqCst);
        }
    }

    pub fn clear(&self, heater: usize) {
        if let Some(f) = self.flags.get(heater) {
            f.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_set(&self, heater: usize) -> bool {
        self.flags.get(heater).is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Lowest-numbered heater with a raised fault, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.flags.iter().position(|f| f.load(Ordering::SeqCst))
    }
}

/// The heater bank as seen from the interpreter: set-point commands in,
/// reached/fault status out. All queries are non-blocking.
pub trait HeatBackend {
    fn heater_count(&self) -> usize;

    fn set_active_temperature(&mut self, heater: usize, temp: f64);

    fn set_standby_temperature(&mut self, heater: usize, temp: f64);

    /// Run the heater at its active set-point.
    fn select_active(&mut self, heater: usize);

    /// Drop the heater to its standby set-point.
    fn select_standby(&mut self, heater: usize);

    fn current_temperature(&self, heater: usize) -> f64;

    /// True when the heater has settled within `tolerance` of its selected
    /// set-point.
    fn at_target(&self, heater: usize, tolerance: f64) -> bool;

    fn faults(&self) -> &FaultFlags;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_clear() {
        let flags = FaultFlags::new(3);
        assert_eq!(flags.first_set(), None);
        flags.raise(2);
        assert!(flags.is_set(2));
        assert!(!flags.is_set(0));
        assert_eq!(flags.first_set(), Some(2));
        flags.clear(2);
        assert_eq!(flags.first_set(), None);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let flags = FaultFlags::new(1);
        flags.raise(7);
        assert!(!flags.is_set(7));
        assert_eq!(flags.first_set(), None);
    }

    #[test]
    fn flags_are_shareable_across_threads() {
        use std::sync::Arc;
        let flags = Arc::new(FaultFlags::new(2));
        let t = {
            let flags = flags.clone();
            std::thread::spawn(move || flags.raise(1))
        };
        t.join().unwrap();
        assert!(flags.is_set(1));
    }
}
