// src/motion/mod.rs - the staged-move handoff to the motion executor
pub mod bed;
pub mod endstops;

use thiserror::Error;

pub use bed::ProbeSample;
pub use endstops::{EndstopCheck, EndstopSet};

/// A primitive move handed to the motion executor. Axis entries are
/// absolute machine positions; extruder entries are movement amounts.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMove {
    pub targets: Vec<f64>,
    /// Distance units per second.
    pub feed_rate: f64,
    /// Offset in the file being printed that this move was read from.
    pub file_offset: Option<u64>,
    pub endstops: EndstopSet,
    /// The S parameter of the G0/G1 that produced it; 0 for a normal move.
    pub move_type: u8,
    pub retraction: bool,
    pub use_pressure_advance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("move slot occupied")]
    SlotOccupied,
}

/// Single-slot mailbox between the interpreter and the motion executor.
/// Staging fails while the slot is occupied; only the executor clears it,
/// which is the backpressure that throttles the interpreter.
#[derive(Debug, Default)]
pub struct MoveMailbox {
    slot: Option<StagedMove>,
}

impl MoveMailbox {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Stage a move. The slot is written whole or not at all; a failed
    /// stage leaves the occupant untouched.
    pub fn stage(&mut self, m: StagedMove) -> Result<(), StagingError> {
        if self.slot.is_some() {
            return Err(StagingError::SlotOccupied);
        }
        self.slot = Some(m);
        Ok(())
    }

    /// Executor side: claim the staged move, clearing the slot.
    pub fn take(&mut self) -> Option<StagedMove> {
        self.slot.take()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn peek(&self) -> Option<&StagedMove> {
        self.slot.as_ref()
    }
}

/// The motion executor as seen from the interpreter. Implementations pull
/// staged moves from the interpreter's mailbox at their own pace and
/// execute them asynchronously; these queries are all non-blocking.
pub trait MotionBackend {
    /// True when the move queue is drained and nothing is executing.
    fn idle(&self) -> bool;

    /// Current machine position, one entry per drive.
    fn live_position(&self) -> &[f64];

    /// Force the executor's idea of the current position (G92, homing).
    fn set_position(&mut self, position: &[f64]);

    /// Instantaneous Z-probe reading.
    fn z_probe_reading(&self) -> f64;

    /// Feed the collected probe samples to the leveling computation and
    /// apply the resulting correction to subsequent motion.
    fn apply_bed_compensation(&mut self, samples: &[ProbeSample]);

    fn clear_bed_compensation(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(x: f64) -> StagedMove {
        StagedMove {
            targets: vec![x, 0.0, 0.0, 0.0],
            feed_rate: 50.0,
            file_offset: None,
            endstops: EndstopSet::EMPTY,
            move_type: 0,
            retraction: false,
            use_pressure_advance: false,
        }
    }

    #[test]
    fn staging_while_occupied_fails_and_preserves_the_occupant() {
        let mut mb = MoveMailbox::new();
        mb.stage(mv(1.0)).unwrap();
        assert_eq!(mb.stage(mv(2.0)), Err(StagingError::SlotOccupied));
        assert_eq!(mb.peek().unwrap().targets[0], 1.0);

        // Cleared by the executor, a new move may be staged.
        let taken = mb.take().unwrap();
        assert_eq!(taken.targets[0], 1.0);
        mb.stage(mv(2.0)).unwrap();
        assert_eq!(mb.peek().unwrap().targets[0], 2.0);
    }
}
