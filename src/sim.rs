// src/sim.rs - deterministic simulation backends
//
// Stand-ins for the motion executor and the heater bank, driven one tick at
// a time. They exist so the state machine can be exercised end to end
// without hardware: the host binary runs against them by default and the
// integration tests drive them through SimRig.

use crate::config::Config;
use crate::gcode::Interpreter;
use crate::gcode::source::SourceId;
use crate::heat::{FaultFlags, HeatBackend};
use crate::machine::AXES;
use crate::motion::{EndstopCheck, MotionBackend, ProbeSample, StagedMove};

/// Simulated motion executor. Pulls one staged move at a time from the
/// interpreter's mailbox and completes it after a fixed number of ticks.
/// Moves with endstop checks stop at the configured trigger positions
/// instead of their targets, the way a real homing or probing move would.
#[derive(Debug)]
pub struct SimMotion {
    position: Vec<f64>,
    current: Option<StagedMove>,
    ticks_left: u32,
    move_ticks: u32,
    endstop_positions: [f64; AXES],
    probe_trigger_z: f64,
    probe_reading: f64,
    bed_samples: Vec<ProbeSample>,
    /// Every completed move, in execution order.
    pub executed: Vec<StagedMove>,
}

impl SimMotion {
    pub fn new(drive_count: usize) -> Self {
        Self {
            position: vec![0.0; drive_count],
            current: None,
            ticks_left: 0,
            move_ticks: 1,
            endstop_positions: [0.0; AXES],
            probe_trigger_z: 0.0,
            probe_reading: 0.0,
            bed_samples: Vec::new(),
            executed: Vec::new(),
        }
    }

    /// Ticks each move takes to complete; 0 completes on the first pump.
    pub fn set_move_ticks(&mut self, ticks: u32) {
        self.move_ticks = ticks;
    }

    /// Height at which the Z probe fires during probing moves.
    pub fn set_probe_trigger(&mut self, z: f64) {
        self.probe_trigger_z = z;
    }

    pub fn set_probe_reading(&mut self, value: f64) {
        self.probe_reading = value;
    }

    pub fn bed_samples(&self) -> &[ProbeSample] {
        &self.bed_samples
    }

    /// The executor side of the handoff: claim a staged move when free and
    /// advance the one in flight.
    pub fn pump(&mut self, interp: &mut Interpreter) {
        if self.current.is_none() {
            if let Some(m) = interp.take_staged_move() {
                self.ticks_left = self.move_ticks;
                self.current = Some(m);
            }
        }
        if let Some(m) = self.current.take() {
            if self.ticks_left > 0 {
                self.ticks_left -= 1;
            }
            if self.ticks_left == 0 {
                self.complete(m);
            } else {
                self.current = Some(m);
            }
        }
    }

    fn complete(&mut self, m: StagedMove) {
        for axis in 0..AXES {
            if axis == 2 && m.endstops.contains(EndstopCheck::ZProbe) {
                self.position[2] = self.probe_trigger_z;
            } else if m.endstops.contains(EndstopCheck::Drive(axis)) {
                self.position[axis] = self.endstop_positions[axis];
            } else {
                self.position[axis] = m.targets[axis];
            }
        }
        for d in AXES..self.position.len() {
            self.position[d] += m.targets[d];
        }
        self.executed.push(m);
    }
}

impl MotionBackend for SimMotion {
    fn idle(&self) -> bool {
        self.current.is_none()
    }

    fn live_position(&self) -> &[f64] {
        &self.position
    }

    fn set_position(&mut self, position: &[f64]) {
        let n = self.position.len().min(position.len());
        self.position[..n].copy_from_slice(&position[..n]);
    }

    fn z_probe_reading(&self) -> f64 {
        self.probe_reading
    }

    fn apply_bed_compensation(&mut self, samples: &[ProbeSample]) {
        self.bed_samples = samples.to_vec();
    }

    fn clear_bed_compensation(&mut self) {
        self.bed_samples.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaterMode {
    Off,
    Active,
    Standby,
}

/// Simulated heater bank. Each heater snaps to its selected set-point after
/// `settle_ticks` ticks, so blocking temperature commands can be tested
/// deterministically.
#[derive(Debug)]
pub struct SimHeat {
    active_temps: Vec<f64>,
    standby_temps: Vec<f64>,
    current: Vec<f64>,
    mode: Vec<HeaterMode>,
    countdown: Vec<u32>,
    settle_ticks: u32,
    faults: FaultFlags,
}

impl SimHeat {
    pub fn new(heater_count: usize) -> Self {
        Self {
            active_temps: vec![0.0; heater_count],
            standby_temps: vec![0.0; heater_count],
            current: vec![0.0; heater_count],
            mode: vec![HeaterMode::Off; heater_count],
            countdown: vec![0; heater_count],
            settle_ticks: 0,
            faults: FaultFlags::new(heater_count),
        }
    }

    /// Ticks a heater takes to settle after its set-point changes.
    pub fn set_settle_ticks(&mut self, ticks: u32) {
        self.settle_ticks = ticks;
    }

    /// Raise a fault the way an interrupt-context trip would.
    pub fn raise_fault(&self, heater: usize) {
        self.faults.raise(heater);
    }

    pub fn step(&mut self) {
        for h in 0..self.current.len() {
            if self.countdown[h] > 0 {
                self.countdown[h] -= 1;
            } else {
                self.current[h] = self.target(h);
            }
        }
    }

    fn target(&self, heater: usize) -> f64 {
        match self.mode[heater] {
            HeaterMode::Off => 0.0,
            HeaterMode::Active => self.active_temps[heater],
            HeaterMode::Standby => self.standby_temps[heater],
        }
    }

    fn touch(&mut self, heater: usize) {
        self.countdown[heater] = self.settle_ticks;
    }
}

impl HeatBackend for SimHeat {
    fn heater_count(&self) -> usize {
        self.current.len()
    }

    fn set_active_temperature(&mut self, heater: usize, temp: f64) {
        if heater >= self.active_temps.len() {
            return;
        }
        if self.active_temps[heater] != temp {
            self.active_temps[heater] = temp;
            if self.mode[heater] == HeaterMode::Active {
                self.touch(heater);
            }
        }
    }

    fn set_standby_temperature(&mut self, heater: usize, temp: f64) {
        if heater >= self.standby_temps.len() {
            return;
        }
        if self.standby_temps[heater] != temp {
            self.standby_temps[heater] = temp;
            if self.mode[heater] == HeaterMode::Standby {
                self.touch(heater);
            }
        }
    }

    fn select_active(&mut self, heater: usize) {
        if heater >= self.mode.len() {
            return;
        }
        if self.mode[heater] != HeaterMode::Active {
            self.mode[heater] = HeaterMode::Active;
            self.touch(heater);
        }
    }

    fn select_standby(&mut self, heater: usize) {
        if heater >= self.mode.len() {
            return;
        }
        if self.mode[heater] != HeaterMode::Standby {
            self.mode[heater] = HeaterMode::Standby;
            self.touch(heater);
        }
    }

    fn current_temperature(&self, heater: usize) -> f64 {
        self.current.get(heater).copied().unwrap_or(0.0)
    }

    fn at_target(&self, heater: usize, tolerance: f64) -> bool {
        match self.current.get(heater) {
            Some(&c) => (c - self.target(heater)).abs() <= tolerance,
            None => false,
        }
    }

    fn faults(&self) -> &FaultFlags {
        &self.faults
    }
}

/// One simulated machine: interpreter, motion executor and heater bank,
/// pre-wired with a console source. One `tick()` is one pass of the control
/// loop plus one executor pump.
pub struct SimRig {
    pub interp: Interpreter,
    pub motion: SimMotion,
    pub heat: SimHeat,
    pub console: SourceId,
}

impl SimRig {
    pub fn new(config: &Config) -> Self {
        let mut interp = Interpreter::new(config);
        let console = interp.register_source("console");
        Self {
            interp,
            motion: SimMotion::new(config.drive_count()),
            heat: SimHeat::new(config.machine.heaters),
            console,
        }
    }

    pub fn send(&mut self, line: &str) {
        self.interp.push_line(self.console, line);
    }

    pub fn replies(&mut self) -> Vec<String> {
        self.interp.drain_replies(self.console)
    }

    pub fn tick(&mut self) {
        self.heat.step();
        self.interp.tick(&mut self.motion, &mut self.heat);
        self.motion.pump(&mut self.interp);
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until the machine is fully quiet (no protocol, no macro, no
    /// buffered input, no motion, no print in progress) or the budget runs
    /// out. Returns true if it went quiet.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> bool {
        for _ in 0..max_ticks {
            self.tick();
            if self.idle() {
                return true;
            }
        }
        false
    }

    pub fn idle(&self) -> bool {
        self.interp.state().is_normal()
            && !self.interp.doing_file_macro()
            && !self.interp.input_pending()
            && !self.interp.is_printing()
            && self.interp.staged_move().is_none()
            && self.motion.idle()
    }
}
