// src/machine.rs - shared machine state, owned by the interpreter
//
// Everything that used to be ambient ("which axes are homed", "which tool is
// live", fan values, factors) lives in this one value so the state machine
// can be driven deterministically in tests.

/// Number of positional axes. Drives beyond these are extruders.
pub const AXES: usize = 3;
pub const AXIS_LETTERS: [char; AXES] = ['X', 'Y', 'Z'];

pub const MINUTES_TO_SECONDS: f64 = 60.0;

/// Machine context captured when a print is paused, restored on resume.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseSnapshot {
    /// Axis positions plus raw extruder positions, one entry per drive.
    pub position: Vec<f64>,
    /// Feed rate of the paused file context, units per minute.
    pub feed_rate: f64,
    pub fan_values: Vec<f64>,
    /// Byte offset reached in the file being printed.
    pub file_offset: u64,
}

#[derive(Debug)]
pub struct MachineContext {
    drive_count: usize,
    pub axes_homed: [bool; AXES],
    /// Last staged axis targets (machine coordinates). Extruder entries are
    /// unused; extruder bookkeeping is in `last_raw_extruder_pos`.
    pub last_target: Vec<f64>,
    pub fan_values: Vec<f64>,
    /// 1.0 == 100% (M220).
    pub speed_factor: f64,
    /// Per-extruder scale on commanded extrusion, 1.0 == 100% (M221).
    pub extrusion_factors: Vec<f64>,
    /// Commanded (pre-factor) extrusion totals since print start.
    pub raw_extrusion_by_drive: Vec<f64>,
    pub raw_extrusion_total: f64,
    /// Last raw commanded position per extruder, for absolute-mode deltas.
    pub last_raw_extruder_pos: Vec<f64>,
    pub axis_scale: [f64; AXES],
    pub paused: bool,
    pub pause_snapshot: Option<PauseSnapshot>,
}

impl MachineContext {
    pub fn new(drive_count: usize, fan_count: usize, axis_scale: [f64; AXES]) -> Self {
        let extruders = drive_count - AXES;
        Self {
            drive_count,
            axes_homed: [false; AXES],
            last_target: vec![0.0; drive_count],
            fan_values: vec![0.0; fan_count],
            speed_factor: 1.0,
            extrusion_factors: vec![1.0; extruders],
            raw_extrusion_by_drive: vec![0.0; extruders],
            raw_extrusion_total: 0.0,
            last_raw_extruder_pos: vec![0.0; extruders],
            axis_scale,
            paused: false,
            pause_snapshot: None,
        }
    }

    pub fn drive_count(&self) -> usize {
        self.drive_count
    }

    pub fn extruder_count(&self) -> usize {
        self.drive_count - AXES
    }

    pub fn all_axes_homed(&self) -> bool {
        self.axes_homed.iter().all(|&h| h)
    }

    pub fn clear_all_homed(&mut self) {
        self.axes_homed = [false; AXES];
    }

    /// Per-drive position vector: axis targets followed by raw extruder
    /// positions. This is what pause snapshots capture.
    pub fn position(&self) -> Vec<f64> {
        let mut pos = Vec::with_capacity(self.drive_count);
        pos.extend_from_slice(&self.last_target[..AXES]);
        pos.extend_from_slice(&self.last_raw_extruder_pos);
        pos
    }

    /// Reset per-print accumulators. Called at print start and on cancel.
    pub fn reset_print_accumulators(&mut self) {
        for v in &mut self.raw_extrusion_by_drive {
            *v = 0.0;
        }
        for v in &mut self.last_raw_extruder_pos {
            *v = 0.0;
        }
        self.raw_extrusion_total = 0.0;
    }
}
