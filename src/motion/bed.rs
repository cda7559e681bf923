// src/motion/bed.rs - probe points and collected height samples
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BedError {
    #[error("a probe sequence is already in progress")]
    AlreadyProbing,
    #[error("probe point {0} out of range")]
    BadIndex(usize),
    #[error("no probe points configured")]
    NoPoints,
}

/// One recorded probe measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub x: f64,
    pub y: f64,
    pub height: f64,
}

/// The configured probe points and the heights collected so far. A probing
/// cycle must run to completion (or be aborted) before another may begin.
#[derive(Debug)]
pub struct ProbeGrid {
    points: Vec<(f64, f64)>,
    samples: Vec<ProbeSample>,
    in_progress: bool,
}

impl ProbeGrid {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self {
            points,
            samples: Vec::new(),
            in_progress: false,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<(f64, f64)> {
        self.points.get(index).copied()
    }

    /// Move one probe point (G30 P with coordinates).
    pub fn set_point(&mut self, index: usize, x: f64, y: f64) -> Result<(), BedError> {
        let p = self.points.get_mut(index).ok_or(BedError::BadIndex(index))?;
        *p = (x, y);
        Ok(())
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Start a probing cycle. Re-probing before the prior cycle completes
    /// is rejected.
    pub fn begin(&mut self) -> Result<(), BedError> {
        if self.in_progress {
            return Err(BedError::AlreadyProbing);
        }
        if self.points.is_empty() {
            return Err(BedError::NoPoints);
        }
        self.in_progress = true;
        self.samples.clear();
        Ok(())
    }

    pub fn record(&mut self, index: usize, height: f64) -> Result<(), BedError> {
        let (x, y) = self.point(index).ok_or(BedError::BadIndex(index))?;
        self.samples.push(ProbeSample { x, y, height });
        Ok(())
    }

    pub fn complete(&self) -> bool {
        self.samples.len() >= self.points.len()
    }

    /// Close the cycle and hand out the collected samples.
    pub fn finish(&mut self) -> &[ProbeSample] {
        self.in_progress = false;
        &self.samples
    }

    pub fn abort(&mut self) {
        self.in_progress = false;
        self.samples.clear();
    }
}
