// src/gcode/mod.rs - the G-code state machine
//
// Interprets G-code from several command sources and turns it into staged
// moves, heater commands and tool changes. Everything runs inside a single
// non-blocking tick: a command that would have to wait leaves a transient
// state (or stays latched at the head of its source) and is re-entered on a
// later tick, so no command can stall the control loop.

pub mod parser;
pub mod source;
pub mod stack;
pub mod state;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{Config, RetractionConfig};
use crate::heat::HeatBackend;
use crate::machine::{AXES, AXIS_LETTERS, MINUTES_TO_SECONDS, MachineContext, PauseSnapshot};
use crate::motion::bed::{BedError, ProbeGrid};
use crate::motion::{EndstopCheck, EndstopSet, MotionBackend, MoveMailbox, StagedMove, StagingError};
use crate::tools::{ToolError, ToolRegistry};

use parser::{EXTRUDE_LETTER, FEEDRATE_LETTER, ParseError, ParsedCommand, parse_line};
use source::{SourceId, SourceSet};
use stack::{FileReader, FrameFile, MacroFrame, MacroStack, StackError};
use state::GCodeState;

#[derive(Debug, Error)]
pub enum GCodeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unsupported command {letter}{number}")]
    Unsupported { letter: char, number: i32 },
    #[error("missing parameter {0}")]
    MissingParameter(char),
    #[error("parameter {0} out of range")]
    ParameterOutOfRange(char),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("macro file {0} not found")]
    MacroMissing(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("no tool selected")]
    NoToolSelected,
    #[error(transparent)]
    Bed(#[from] BedError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("heater {0} fault")]
    HeaterFault(usize),
    #[error("axes must be homed before probing")]
    NotHomed,
    #[error("no print in progress")]
    NotPrinting,
    #[error("no file selected for printing")]
    NoFileSelected,
    #[error("cannot open {path}: {source}")]
    FileOpen {
        path: String,
        source: std::io::Error,
    },
    #[error("not executing a macro")]
    NotInMacro,
    #[error("fan {0} out of range")]
    BadFan(usize),
}

/// Outcome of dispatching one command. `Busy` leaves the command latched at
/// the head of its source so the same tick entry retries it later.
#[derive(Debug)]
enum CodeResult {
    Finished(Option<String>),
    Busy,
}

/// Where the line being executed came from.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Source(SourceId),
    Macro,
}

#[derive(Debug, Clone)]
struct Settings {
    macro_dir: PathBuf,
    gcode_dir: PathBuf,
    temp_tolerance: f64,
    bed_heater: usize,
    travel_feed_rate: f64,
    probe_feed_rate: f64,
    probe_dive_height: f64,
    probe_floor: f64,
    retraction: RetractionConfig,
}

/// The interpreter: dispatcher, macro stack, move staging and the
/// multi-tick protocol engine.
pub struct Interpreter {
    settings: Settings,
    state: GCodeState,
    sources: SourceSet,
    file_source: SourceId,
    machine: MachineContext,
    tools: ToolRegistry,
    mailbox: MoveMailbox,

    macro_stack: MacroStack,
    macro_file: Option<FileReader>,
    macro_line: Option<String>,
    macro_owner: Option<SourceId>,

    grid: ProbeGrid,

    print_file: Option<FileReader>,
    queued_file: Option<PathBuf>,

    // Multi-tick protocol scratch. Valid only while the matching state is
    // current.
    protocol_origin: Option<SourceId>,
    canned_resume: GCodeState,
    to_be_homed: [bool; AXES],
    homing_axis: Option<usize>,
    probe_index: usize,
    probe_step: u8,
    single_probe_step: u8,
    last_probed_z: f64,
    old_tool: Option<i32>,
    new_tool: i32,
    tool_wait: bool,
    tool_temps_commanded: bool,
    dwell_until: Option<Instant>,
    retracted: bool,
}

impl Interpreter {
    pub fn new(config: &Config) -> Self {
        let mut sources = SourceSet::new(config.source_policy(), config.interpreter.default_feed_rate);
        let file_source = sources.register("file");
        sources.set_file_source(file_source);

        let machine = MachineContext::new(config.drive_count(), config.machine.fans, config.machine.axis_scale);
        let tools = ToolRegistry::from_config(&config.tools, config.machine.extruders, config.machine.heaters);
        let grid = ProbeGrid::new(config.probe.points.iter().map(|p| (p[0], p[1])).collect());

        Self {
            settings: Settings {
                macro_dir: PathBuf::from(&config.interpreter.macro_dir),
                gcode_dir: PathBuf::from(&config.interpreter.gcode_dir),
                temp_tolerance: config.interpreter.temp_tolerance,
                bed_heater: config.machine.bed_heater,
                travel_feed_rate: config.interpreter.travel_feed_rate,
                probe_feed_rate: config.probe.feed_rate,
                probe_dive_height: config.probe.dive_height,
                probe_floor: config.probe.floor,
                retraction: config.retraction.clone(),
            },
            state: GCodeState::Normal,
            sources,
            file_source,
            machine,
            tools,
            mailbox: MoveMailbox::new(),
            macro_stack: MacroStack::new(),
            macro_file: None,
            macro_line: None,
            macro_owner: None,
            grid,
            print_file: None,
            queued_file: None,
            protocol_origin: None,
            canned_resume: GCodeState::Normal,
            to_be_homed: [false; AXES],
            homing_axis: None,
            probe_index: 0,
            probe_step: 0,
            single_probe_step: 0,
            last_probed_z: 0.0,
            old_tool: None,
            new_tool: 0,
            tool_wait: false,
            tool_temps_commanded: false,
            dwell_until: None,
            retracted: false,
        }
    }

    // ------------------------------------------------------------------
    // Host-facing surface

    pub fn register_source(&mut self, label: &str) -> SourceId {
        self.sources.register(label)
    }

    pub fn push_line(&mut self, id: SourceId, line: &str) {
        self.sources.push_line(id, line);
    }

    pub fn drain_replies(&mut self, id: SourceId) -> Vec<String> {
        self.sources.drain_replies(id)
    }

    /// Executor side of the staged-move mailbox: claim the move, clearing
    /// the slot so the interpreter may stage the next one.
    pub fn take_staged_move(&mut self) -> Option<StagedMove> {
        self.mailbox.take()
    }

    pub fn staged_move(&self) -> Option<&StagedMove> {
        self.mailbox.peek()
    }

    pub fn clear_staged_move(&mut self) {
        self.mailbox.clear();
    }

    pub fn state(&self) -> GCodeState {
        self.state
    }

    pub fn machine(&self) -> &MachineContext {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut MachineContext {
        &mut self.machine
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn stack_depth(&self) -> usize {
        self.macro_stack.depth()
    }

    pub fn doing_file_macro(&self) -> bool {
        self.macro_file.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.machine.paused
    }

    pub fn is_printing(&self) -> bool {
        self.print_file.is_some()
    }

    pub fn fraction_printed(&self) -> Option<f64> {
        self.print_file.as_ref().map(|f| f.fraction_read())
    }

    /// True if any source still has a buffered line.
    pub fn input_pending(&self) -> bool {
        self.sources.any_ready()
    }

    pub fn file_source_id(&self) -> SourceId {
        self.file_source
    }

    pub fn source_context(&self, id: SourceId) -> &source::ExecContext {
        &self.sources.source(id).ctx
    }

    /// Select a file for M24 to start printing.
    pub fn queue_file_to_print(&mut self, path: &Path) -> std::io::Result<()> {
        std::fs::metadata(path)?;
        self.queued_file = Some(path.to_path_buf());
        Ok(())
    }

    // ------------------------------------------------------------------
    // The tick entry point

    /// One pass of the control loop: advance the pending protocol, or
    /// dispatch at most one command. Never blocks.
    pub fn tick(&mut self, motion: &mut dyn MotionBackend, heat: &mut dyn HeatBackend) {
        self.fault_checkpoint(heat);
        match self.state {
            GCodeState::Normal => self.run_normal(motion, heat),
            GCodeState::WaitingForMoveToComplete => {
                if self.mailbox.is_empty() && motion.idle() {
                    self.state = self.canned_resume;
                }
            }
            GCodeState::Homing => self.advance_homing(),
            GCodeState::SetBed1 | GCodeState::SetBed2 | GCodeState::SetBed3 => {
                self.advance_set_bed(motion)
            }
            GCodeState::ToolChange1 | GCodeState::ToolChange2 | GCodeState::ToolChange3 => {
                self.advance_tool_change(motion, heat)
            }
            GCodeState::Pausing1 | GCodeState::Pausing2 => self.advance_pausing(motion),
            GCodeState::Resuming1 | GCodeState::Resuming2 | GCodeState::Resuming3 => {
                self.advance_resuming(motion)
            }
        }
    }

    /// Fault flags are raised from interrupt context; this is the defined
    /// checkpoint where the core observes them.
    fn fault_checkpoint(&mut self, heat: &mut dyn HeatBackend) {
        let Some(h) = heat.faults().first_set() else { return };
        for tool in self.tools.iter_mut() {
            if tool.heaters().contains(&h) && !tool.faulted() {
                tracing::error!("heater {} fault: tool {} marked unusable", h, tool.number());
                tool.flag_fault();
            }
        }
        if !self.state.is_normal() {
            self.abort_protocol(format!("Error: heater {h} fault"));
        }
    }

    // ------------------------------------------------------------------
    // Source arbitration and dispatch

    fn run_normal(&mut self, motion: &mut dyn MotionBackend, heat: &mut dyn HeatBackend) {
        // A running macro has exclusive priority: interactive sources are
        // starved until it returns, so macros cannot be interleaved with
        // manual input.
        if self.macro_file.is_some() {
            self.run_macro_line(motion, heat);
            return;
        }

        self.pump_print_file();

        let file_source = self.file_source;
        let paused = self.machine.paused;
        let Some(id) = self.sources.select(|src| src.id != file_source || !paused) else {
            return;
        };
        let line = match self.sources.source(id).peek_line() {
            Some(l) => l.to_string(),
            None => return,
        };
        match parse_line(&line) {
            Ok(None) => {
                self.sources.source_mut(id).pop_line();
            }
            Ok(Some(cmd)) => self.execute(Origin::Source(id), cmd, motion, heat),
            Err(e) => {
                tracing::warn!("parse error on {:?}: {}", line, e);
                self.sources.source_mut(id).pop_line();
                self.sources.reply(id, format!("Error: {e}"));
            }
        }
    }

    /// Keep one line of the file being printed buffered on the file source.
    fn pump_print_file(&mut self) {
        if self.machine.paused {
            return;
        }
        let Some(file) = self.print_file.as_mut() else { return };
        if self.sources.source(self.file_source).has_line() {
            return;
        }
        match file.read_line() {
            Ok(Some(line)) => self.sources.push_line(self.file_source, &line),
            Ok(None) => {
                tracing::info!("print finished: {}", file.path().display());
                self.print_file = None;
            }
            Err(e) => {
                tracing::error!("print file read error: {}", e);
                self.print_file = None;
            }
        }
    }

    fn run_macro_line(&mut self, motion: &mut dyn MotionBackend, heat: &mut dyn HeatBackend) {
        if self.macro_line.is_none() {
            let next = match self.macro_file.as_mut() {
                Some(f) => f.read_line(),
                None => return,
            };
            match next {
                Ok(Some(line)) => self.macro_line = Some(line),
                Ok(None) => {
                    self.end_macro();
                    return;
                }
                Err(e) => {
                    tracing::error!("macro read error: {}", e);
                    if let Some(owner) = self.macro_owner {
                        self.sources.reply(owner, format!("Error: macro read failed: {e}"));
                    }
                    self.end_macro();
                    return;
                }
            }
        }
        let Some(line) = self.macro_line.clone() else { return };
        match parse_line(&line) {
            Ok(None) => self.macro_line = None,
            Ok(Some(cmd)) => self.execute(Origin::Macro, cmd, motion, heat),
            Err(e) => {
                tracing::warn!("parse error in macro line {:?}: {}", line, e);
                self.macro_line = None;
                self.reply_to(Origin::Macro, format!("Error: {e}"));
            }
        }
    }

    fn execute(
        &mut self,
        origin: Origin,
        cmd: ParsedCommand,
        motion: &mut dyn MotionBackend,
        heat: &mut dyn HeatBackend,
    ) {
        let result = match cmd.letter {
            'G' => self.handle_gcode(origin, &cmd, motion, heat),
            'M' => self.handle_mcode(origin, &cmd, motion, heat),
            'T' => self.handle_tcode(origin, &cmd),
            _ => Err(GCodeError::Unsupported { letter: cmd.letter, number: cmd.number }),
        };
        match result {
            Ok(CodeResult::Busy) => {}
            Ok(CodeResult::Finished(reply)) => {
                self.finish_line(origin);
                if let Some(text) = reply {
                    self.reply_to(origin, text);
                }
            }
            Err(e) => {
                tracing::warn!("{} failed: {}", cmd, e);
                self.finish_line(origin);
                self.reply_to(origin, format!("Error: {e}"));
            }
        }
    }

    fn finish_line(&mut self, origin: Origin) {
        match origin {
            Origin::Source(id) => {
                self.sources.source_mut(id).pop_line();
            }
            Origin::Macro => self.macro_line = None,
        }
    }

    fn reply_to(&mut self, origin: Origin, text: String) {
        let id = self.origin_source(origin);
        self.sources.reply(id, text);
    }

    fn origin_source(&self, origin: Origin) -> SourceId {
        match origin {
            Origin::Source(id) => id,
            Origin::Macro => self.macro_owner.unwrap_or(self.file_source),
        }
    }

    // ------------------------------------------------------------------
    // G codes

    fn handle_gcode(
        &mut self,
        origin: Origin,
        cmd: &ParsedCommand,
        motion: &mut dyn MotionBackend,
        heat: &mut dyn HeatBackend,
    ) -> Result<CodeResult, GCodeError> {
        let ctx_id = self.origin_source(origin);
        match cmd.number {
            0 | 1 => self.stage_from_command(ctx_id, cmd),
            4 => self.do_dwell(cmd, motion),
            10 => {
                if cmd.has('P') {
                    self.set_tool_offsets(cmd, heat)
                } else {
                    self.retract(true)
                }
            }
            11 => self.retract(false),
            20 => {
                self.sources.source_mut(ctx_id).ctx.distance_scale = 25.4;
                Ok(CodeResult::Finished(None))
            }
            21 => {
                self.sources.source_mut(ctx_id).ctx.distance_scale = 1.0;
                Ok(CodeResult::Finished(None))
            }
            28 => self.start_homing(ctx_id, cmd),
            29 | 32 => self.start_bed_probing(ctx_id),
            30 => self.do_single_probe(cmd, motion),
            31 => Ok(CodeResult::Finished(Some(format!(
                "Z probe: {:.3}",
                motion.z_probe_reading()
            )))),
            90 => {
                let ctx = &mut self.sources.source_mut(ctx_id).ctx;
                ctx.axes_relative = false;
                ctx.drives_relative = false;
                Ok(CodeResult::Finished(None))
            }
            91 => {
                let ctx = &mut self.sources.source_mut(ctx_id).ctx;
                ctx.axes_relative = true;
                ctx.drives_relative = true;
                Ok(CodeResult::Finished(None))
            }
            92 => self.set_positions(ctx_id, cmd, motion),
            n => Err(GCodeError::Unsupported { letter: 'G', number: n }),
        }
    }

    /// Convert a G0/G1 into a staged move: resolve targets against the
    /// relative-mode flags, apply unit and axis scales, extrusion factors
    /// and the active tool's offset, convert the feed rate to units/sec and
    /// compute the endstop-check set. Fails (leaving the occupant intact)
    /// while the move slot is occupied.
    fn stage_from_command(&mut self, ctx_id: SourceId, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        if !self.mailbox.is_empty() {
            return Ok(CodeResult::Busy);
        }

        let mut ctx = self.sources.source(ctx_id).ctx.clone();
        let drive_count = self.machine.drive_count();
        let mut targets = vec![0.0; drive_count];
        targets[..AXES].copy_from_slice(&self.machine.last_target[..AXES]);

        let move_type = cmd.value('S').map(|s| s as u8).unwrap_or(0);
        let tool_offset = self.tools.active().map(|t| t.offset()).unwrap_or([0.0; AXES]);

        let mut endstops = EndstopSet::EMPTY;
        let mut axes_moved = false;
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            let Some(v) = cmd.value(*letter) else { continue };
            let scaled = v * ctx.distance_scale * self.machine.axis_scale[axis];
            targets[axis] = if ctx.axes_relative {
                self.machine.last_target[axis] + scaled
            } else {
                scaled + tool_offset[axis]
            };
            axes_moved = true;
            if move_type == 1 {
                endstops.insert(EndstopCheck::Drive(axis));
            }
        }

        let mut extruding = false;
        if let Some(e) = cmd.value(EXTRUDE_LETTER) {
            let raw = e * ctx.distance_scale;
            let Some(tool) = self.tools.active() else {
                return Err(GCodeError::NoToolSelected);
            };
            let drives: Vec<usize> = tool.drives().to_vec();
            let mix: Vec<f64> = tool.mix().to_vec();
            let mixing = tool.mixing();
            for (i, &extruder) in drives.iter().enumerate() {
                // A mixing tool apportions one commanded amount across its
                // drives by ratio.
                let commanded = if mixing { raw * mix[i] } else { raw };
                let delta = if ctx.drives_relative {
                    commanded
                } else {
                    commanded - self.machine.last_raw_extruder_pos[extruder]
                };
                if ctx.drives_relative {
                    self.machine.last_raw_extruder_pos[extruder] += commanded;
                } else {
                    self.machine.last_raw_extruder_pos[extruder] = commanded;
                }
                // Raw (pre-factor) totals, for reporting.
                self.machine.raw_extrusion_by_drive[extruder] += delta;
                self.machine.raw_extrusion_total += delta;
                targets[AXES + extruder] = delta * self.machine.extrusion_factors[extruder];
                if delta > 0.0 {
                    extruding = true;
                }
                if move_type == 1 {
                    endstops.insert(EndstopCheck::Drive(AXES + extruder));
                }
            }
        }

        if let Some(f) = cmd.value(FEEDRATE_LETTER) {
            ctx.feed_rate = f * ctx.distance_scale;
        }
        let feed_rate = ctx.feed_rate * self.machine.speed_factor / MINUTES_TO_SECONDS;

        let staged = StagedMove {
            targets,
            feed_rate,
            file_offset: self.print_file.as_ref().map(|f| f.offset()),
            endstops,
            move_type,
            retraction: false,
            use_pressure_advance: extruding && axes_moved,
        };
        self.machine.last_target[..AXES].copy_from_slice(&staged.targets[..AXES]);
        self.sources.source_mut(ctx_id).ctx = ctx;
        self.mailbox.stage(staged)?;
        Ok(CodeResult::Finished(None))
    }

    /// Stage an internally generated (canned-cycle) move. The mailbox must
    /// be empty; callers wait for the previous move first.
    fn stage_canned(
        &mut self,
        axis_targets: &[(usize, f64)],
        feed_per_min: f64,
        endstops: EndstopSet,
    ) -> Result<(), StagingError> {
        if !self.mailbox.is_empty() {
            return Err(StagingError::SlotOccupied);
        }
        let drive_count = self.machine.drive_count();
        let mut targets = vec![0.0; drive_count];
        targets[..AXES].copy_from_slice(&self.machine.last_target[..AXES]);
        for &(axis, value) in axis_targets {
            targets[axis] = value;
        }
        self.machine.last_target[..AXES].copy_from_slice(&targets[..AXES]);
        self.mailbox.stage(StagedMove {
            targets,
            feed_rate: feed_per_min / MINUTES_TO_SECONDS,
            file_offset: None,
            endstops,
            move_type: 0,
            retraction: false,
            use_pressure_advance: false,
        })
    }

    fn wait_for_canned(&mut self, resume: GCodeState) {
        self.canned_resume = resume;
        self.state = GCodeState::WaitingForMoveToComplete;
    }

    fn do_dwell(&mut self, cmd: &ParsedCommand, motion: &dyn MotionBackend) -> Result<CodeResult, GCodeError> {
        if !(self.mailbox.is_empty() && motion.idle()) {
            return Ok(CodeResult::Busy);
        }
        match self.dwell_until {
            None => {
                let seconds = cmd
                    .value('S')
                    .or_else(|| cmd.value('P').map(|ms| ms / 1000.0))
                    .unwrap_or(0.0)
                    .max(0.0);
                self.dwell_until = Some(Instant::now() + Duration::from_secs_f64(seconds));
                Ok(CodeResult::Busy)
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    self.dwell_until = None;
                    Ok(CodeResult::Finished(None))
                } else {
                    Ok(CodeResult::Busy)
                }
            }
        }
    }

    /// G10 with a P parameter: set a tool's offsets and temperatures.
    fn set_tool_offsets(&mut self, cmd: &ParsedCommand, heat: &mut dyn HeatBackend) -> Result<CodeResult, GCodeError> {
        let number = cmd.int_value('P').ok_or(GCodeError::MissingParameter('P'))?;
        let is_active = self.tools.active_id() == Some(number);
        let (heaters, active_temps, standby_temps) = {
            let tool = self.tools.get_mut(number).ok_or(ToolError::Unknown(number))?;
            for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
                if let Some(v) = cmd.value(*letter) {
                    tool.set_offset_component(axis, v);
                }
            }
            tool.set_temps(cmd.value('S'), cmd.value('R'));
            (
                tool.heaters().to_vec(),
                tool.active_temps().to_vec(),
                tool.standby_temps().to_vec(),
            )
        };
        if is_active {
            for (i, &h) in heaters.iter().enumerate() {
                heat.set_active_temperature(h, active_temps[i]);
                heat.set_standby_temperature(h, standby_temps[i]);
            }
        }
        Ok(CodeResult::Finished(None))
    }

    /// Firmware retraction (G10 bare / G11).
    fn retract(&mut self, retracting: bool) -> Result<CodeResult, GCodeError> {
        if retracting == self.retracted {
            return Ok(CodeResult::Finished(None));
        }
        if !self.mailbox.is_empty() {
            return Ok(CodeResult::Busy);
        }
        let Some(tool) = self.tools.active() else {
            return Err(GCodeError::NoToolSelected);
        };
        let drives: Vec<usize> = tool.drives().to_vec();
        let r = self.settings.retraction.clone();
        let drive_count = self.machine.drive_count();
        let mut targets = vec![0.0; drive_count];
        targets[..AXES].copy_from_slice(&self.machine.last_target[..AXES]);
        let amount = if retracting { -r.length } else { r.length + r.extra };
        for &e in &drives {
            targets[AXES + e] = amount;
        }
        if r.z_hop != 0.0 {
            let z = self.machine.last_target[2] + if retracting { r.z_hop } else { -r.z_hop };
            targets[2] = z;
            self.machine.last_target[2] = z;
        }
        self.mailbox.stage(StagedMove {
            targets,
            feed_rate: r.feed_rate / MINUTES_TO_SECONDS,
            file_offset: self.print_file.as_ref().map(|f| f.offset()),
            endstops: EndstopSet::EMPTY,
            move_type: 0,
            retraction: true,
            use_pressure_advance: false,
        })?;
        self.retracted = retracting;
        Ok(CodeResult::Finished(None))
    }

    fn set_positions(&mut self, ctx_id: SourceId, cmd: &ParsedCommand, motion: &mut dyn MotionBackend) -> Result<CodeResult, GCodeError> {
        let scale = self.sources.source(ctx_id).ctx.distance_scale;
        let mut changed = false;
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            if let Some(v) = cmd.value(*letter) {
                self.machine.last_target[axis] = v * scale;
                changed = true;
            }
        }
        if let Some(e) = cmd.value(EXTRUDE_LETTER) {
            let raw = e * scale;
            let drives: Vec<usize> = self.tools.active().map(|t| t.drives().to_vec()).unwrap_or_default();
            for &d in &drives {
                self.machine.last_raw_extruder_pos[d] = raw;
            }
            changed = true;
        }
        if changed {
            motion.set_position(&self.machine.position());
        }
        Ok(CodeResult::Finished(None))
    }

    // ------------------------------------------------------------------
    // Homing

    fn start_homing(&mut self, ctx_id: SourceId, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        let mut requested = [false; AXES];
        let mut any = false;
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            if cmd.has(*letter) {
                requested[axis] = true;
                any = true;
            }
        }
        if !any {
            requested = [true; AXES];
            self.machine.clear_all_homed();
        }
        tracing::info!(
            "homing {}",
            AXIS_LETTERS
                .iter()
                .enumerate()
                .filter(|(a, _)| requested[*a])
                .map(|(_, l)| *l)
                .collect::<String>()
        );
        self.to_be_homed = requested;
        self.homing_axis = None;
        self.protocol_origin = Some(ctx_id);
        self.state = GCodeState::Homing;
        Ok(CodeResult::Finished(None))
    }

    /// One homing step per tick: when an axis macro has run to completion
    /// the axis is marked homed, then the next requested axis's macro is
    /// launched. Re-entered between macros because entering a macro stacks
    /// this state and returning restores it.
    fn advance_homing(&mut self) {
        if let Some(axis) = self.homing_axis.take() {
            self.machine.axes_homed[axis] = true;
            self.to_be_homed[axis] = false;
        }
        let Some(axis) = (0..AXES).find(|&a| self.to_be_homed[a]) else {
            tracing::info!("homing complete");
            self.finish_protocol(None);
            return;
        };
        self.machine.axes_homed[axis] = false;
        let name = format!("home{}.g", AXIS_LETTERS[axis].to_ascii_lowercase());
        let origin = self.protocol_origin.unwrap_or(self.file_source);
        match self.do_file_macro(origin, &name, true) {
            Ok(_) => self.homing_axis = Some(axis),
            Err(e) => self.abort_protocol(format!("Error: homing failed: {e}")),
        }
    }

    // ------------------------------------------------------------------
    // Probing and bed compensation

    fn start_bed_probing(&mut self, ctx_id: SourceId) -> Result<CodeResult, GCodeError> {
        if !(self.machine.axes_homed[0] && self.machine.axes_homed[1]) {
            return Err(GCodeError::NotHomed);
        }
        self.grid.begin()?;
        self.protocol_origin = Some(ctx_id);
        self.state = GCodeState::SetBed1;
        Ok(CodeResult::Finished(None))
    }

    fn advance_set_bed(&mut self, motion: &mut dyn MotionBackend) {
        match self.state {
            GCodeState::SetBed1 => {
                motion.clear_bed_compensation();
                self.probe_index = 0;
                self.probe_step = 0;
                self.state = GCodeState::SetBed2;
            }
            GCodeState::SetBed2 => self.advance_probe_cycle(motion),
            GCodeState::SetBed3 => {
                let samples = self.grid.finish().to_vec();
                motion.apply_bed_compensation(&samples);
                tracing::info!("bed compensation set from {} probe points", samples.len());
                self.finish_protocol(Some(format!(
                    "{} points probed, bed compensation active",
                    samples.len()
                )));
            }
            _ => {}
        }
    }

    /// The canned probing cycle for one grid point: travel, probe down
    /// until the Z probe triggers, record, retract. Each staged move parks
    /// the machine in `WaitingForMoveToComplete` until it drains.
    fn advance_probe_cycle(&mut self, motion: &mut dyn MotionBackend) {
        let dive = self.settings.probe_dive_height;
        match self.probe_step {
            0 => {
                let Some((x, y)) = self.grid.point(self.probe_index) else {
                    self.abort_protocol("Error: probe point out of range".to_string());
                    return;
                };
                if self
                    .stage_canned(&[(0, x), (1, y), (2, dive)], self.settings.travel_feed_rate, EndstopSet::EMPTY)
                    .is_ok()
                {
                    self.probe_step = 1;
                    self.wait_for_canned(GCodeState::SetBed2);
                }
            }
            1 => {
                let mut endstops = EndstopSet::EMPTY;
                endstops.insert(EndstopCheck::ZProbe);
                if self
                    .stage_canned(&[(2, self.settings.probe_floor)], self.settings.probe_feed_rate, endstops)
                    .is_ok()
                {
                    self.probe_step = 2;
                    self.wait_for_canned(GCodeState::SetBed2);
                }
            }
            2 => {
                let height = motion.live_position()[2];
                self.machine.last_target[2] = height;
                self.last_probed_z = height;
                if let Err(e) = self.grid.record(self.probe_index, height) {
                    self.abort_protocol(format!("Error: {e}"));
                    return;
                }
                tracing::debug!("probe point {} height {:.3}", self.probe_index, height);
                if self
                    .stage_canned(&[(2, dive)], self.settings.travel_feed_rate, EndstopSet::EMPTY)
                    .is_ok()
                {
                    self.probe_step = 3;
                    self.wait_for_canned(GCodeState::SetBed2);
                }
            }
            _ => {
                self.probe_index += 1;
                self.probe_step = 0;
                if self.probe_index >= self.grid.len() {
                    self.state = GCodeState::SetBed3;
                }
            }
        }
    }

    /// G30: single probe where we are, reporting the stopped height. Stays
    /// latched at its source across ticks rather than owning a state.
    fn do_single_probe(&mut self, cmd: &ParsedCommand, motion: &mut dyn MotionBackend) -> Result<CodeResult, GCodeError> {
        match self.single_probe_step {
            0 => {
                if self.grid.in_progress() {
                    return Err(GCodeError::Bed(BedError::AlreadyProbing));
                }
                if !(self.mailbox.is_empty() && motion.idle()) {
                    return Ok(CodeResult::Busy);
                }
                let mut endstops = EndstopSet::EMPTY;
                endstops.insert(EndstopCheck::ZProbe);
                if self
                    .stage_canned(&[(2, self.settings.probe_floor)], self.settings.probe_feed_rate, endstops)
                    .is_err()
                {
                    return Ok(CodeResult::Busy);
                }
                self.single_probe_step = 1;
                Ok(CodeResult::Busy)
            }
            1 => {
                if !(self.mailbox.is_empty() && motion.idle()) {
                    return Ok(CodeResult::Busy);
                }
                let height = motion.live_position()[2];
                self.machine.last_target[2] = height;
                self.last_probed_z = height;
                if let Some(p) = cmd.int_value('P') {
                    let x = self.machine.last_target[0];
                    let y = self.machine.last_target[1];
                    if let Err(e) = self.grid.set_point(p.max(0) as usize, x, y) {
                        self.single_probe_step = 0;
                        return Err(e.into());
                    }
                }
                if self
                    .stage_canned(&[(2, self.settings.probe_dive_height)], self.settings.travel_feed_rate, EndstopSet::EMPTY)
                    .is_err()
                {
                    return Ok(CodeResult::Busy);
                }
                self.single_probe_step = 2;
                Ok(CodeResult::Busy)
            }
            _ => {
                if !(self.mailbox.is_empty() && motion.idle()) {
                    return Ok(CodeResult::Busy);
                }
                self.single_probe_step = 0;
                Ok(CodeResult::Finished(Some(format!(
                    "Z probe triggered at Z={:.3}",
                    self.last_probed_z
                ))))
            }
        }
    }

    // ------------------------------------------------------------------
    // M codes

    fn handle_mcode(
        &mut self,
        origin: Origin,
        cmd: &ParsedCommand,
        _motion: &mut dyn MotionBackend,
        heat: &mut dyn HeatBackend,
    ) -> Result<CodeResult, GCodeError> {
        let ctx_id = self.origin_source(origin);
        match cmd.number {
            0 => self.cancel_print(ctx_id),
            23 => self.select_file(cmd),
            24 => self.start_or_resume(ctx_id),
            25 => self.start_pause(ctx_id),
            82 => {
                self.sources.source_mut(ctx_id).ctx.drives_relative = false;
                Ok(CodeResult::Finished(None))
            }
            83 => {
                self.sources.source_mut(ctx_id).ctx.drives_relative = true;
                Ok(CodeResult::Finished(None))
            }
            98 => {
                let name = cmd.text('P').ok_or(GCodeError::MissingParameter('P'))?.to_string();
                self.do_file_macro(ctx_id, &name, true)?;
                Ok(CodeResult::Finished(None))
            }
            99 => {
                if self.macro_file.is_none() {
                    return Err(GCodeError::NotInMacro);
                }
                self.pop_frame()?;
                Ok(CodeResult::Finished(None))
            }
            104 => self.set_tool_temperature(cmd, heat, false),
            106 => self.set_fan(cmd),
            107 => {
                if let Some(v) = self.machine.fan_values.first_mut() {
                    *v = 0.0;
                }
                Ok(CodeResult::Finished(None))
            }
            109 => self.set_tool_temperature(cmd, heat, true),
            114 => Ok(CodeResult::Finished(Some(self.report_position()))),
            115 => Ok(CodeResult::Finished(Some(format!(
                "FIRMWARE_NAME: gantry FIRMWARE_VERSION: {}",
                env!("CARGO_PKG_VERSION")
            )))),
            120 => self.push_context(ctx_id),
            121 => {
                self.pop_frame()?;
                Ok(CodeResult::Finished(None))
            }
            140 => self.set_bed_temperature(cmd, heat, false),
            190 => self.set_bed_temperature(cmd, heat, true),
            207 => self.set_retraction(cmd),
            220 => {
                let Some(s) = cmd.value('S') else {
                    return Ok(CodeResult::Finished(Some(format!(
                        "Speed factor: {:.1}%",
                        self.machine.speed_factor * 100.0
                    ))));
                };
                if s <= 0.0 {
                    return Err(GCodeError::ParameterOutOfRange('S'));
                }
                self.machine.speed_factor = s / 100.0;
                Ok(CodeResult::Finished(None))
            }
            221 => {
                let extruder = cmd.int_value('D').unwrap_or(0);
                if extruder < 0 || extruder as usize >= self.machine.extruder_count() {
                    return Err(GCodeError::ParameterOutOfRange('D'));
                }
                let Some(s) = cmd.value('S') else {
                    return Ok(CodeResult::Finished(Some(format!(
                        "Extrusion factor for drive {}: {:.1}%",
                        extruder,
                        self.machine.extrusion_factors[extruder as usize] * 100.0
                    ))));
                };
                if s <= 0.0 {
                    return Err(GCodeError::ParameterOutOfRange('S'));
                }
                self.machine.extrusion_factors[extruder as usize] = s / 100.0;
                Ok(CodeResult::Finished(None))
            }
            562 => self.clear_faults(cmd, heat),
            n => Err(GCodeError::Unsupported { letter: 'M', number: n }),
        }
    }

    fn cancel_print(&mut self, ctx_id: SourceId) -> Result<CodeResult, GCodeError> {
        if let Some(f) = self.print_file.take() {
            tracing::info!("print cancelled: {}", f.path().display());
        }
        while self.sources.source_mut(self.file_source).pop_line().is_some() {}
        self.mailbox.clear();
        self.machine.reset_print_accumulators();
        self.machine.paused = false;
        self.machine.pause_snapshot = None;
        self.retracted = false;
        if let Err(e) = self.do_file_macro(ctx_id, "stop.g", false) {
            tracing::warn!("stop.g failed: {e}");
        }
        Ok(CodeResult::Finished(None))
    }

    fn select_file(&mut self, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        let name = cmd.text('P').ok_or(GCodeError::MissingParameter('P'))?;
        let path = self.settings.gcode_dir.join(name);
        std::fs::metadata(&path).map_err(|e| GCodeError::FileOpen {
            path: path.display().to_string(),
            source: e,
        })?;
        self.queued_file = Some(path);
        Ok(CodeResult::Finished(Some(format!("File {name} selected for printing"))))
    }

    fn start_or_resume(&mut self, ctx_id: SourceId) -> Result<CodeResult, GCodeError> {
        if self.machine.paused {
            self.protocol_origin = Some(ctx_id);
            self.state = GCodeState::Resuming1;
            return Ok(CodeResult::Finished(None));
        }
        if self.print_file.is_some() {
            return Ok(CodeResult::Finished(None));
        }
        let path = self.queued_file.clone().ok_or(GCodeError::NoFileSelected)?;
        let reader = FileReader::open(&path).map_err(|e| GCodeError::FileOpen {
            path: path.display().to_string(),
            source: e,
        })?;
        tracing::info!("printing {}", path.display());
        self.machine.reset_print_accumulators();
        self.print_file = Some(reader);
        Ok(CodeResult::Finished(None))
    }

    fn start_pause(&mut self, ctx_id: SourceId) -> Result<CodeResult, GCodeError> {
        if self.machine.paused {
            return Ok(CodeResult::Finished(None));
        }
        if self.print_file.is_none() {
            return Err(GCodeError::NotPrinting);
        }
        self.protocol_origin = Some(ctx_id);
        self.state = GCodeState::Pausing1;
        Ok(CodeResult::Finished(None))
    }

    fn advance_pausing(&mut self, motion: &mut dyn MotionBackend) {
        match self.state {
            GCodeState::Pausing1 => {
                if self.mailbox.is_empty() && motion.idle() {
                    self.state = GCodeState::Pausing2;
                }
            }
            GCodeState::Pausing2 => {
                let snapshot = PauseSnapshot {
                    position: self.machine.position(),
                    feed_rate: self.sources.source(self.file_source).ctx.feed_rate,
                    fan_values: self.machine.fan_values.clone(),
                    file_offset: self.print_file.as_ref().map(|f| f.offset()).unwrap_or(0),
                };
                tracing::info!("print paused at offset {}", snapshot.file_offset);
                self.machine.pause_snapshot = Some(snapshot);
                self.machine.paused = true;
                let origin = self.protocol_origin.unwrap_or(self.file_source);
                self.finish_protocol(None);
                if let Err(e) = self.do_file_macro(origin, "pause.g", false) {
                    tracing::warn!("pause.g failed: {e}");
                }
            }
            _ => {}
        }
    }

    fn advance_resuming(&mut self, motion: &mut dyn MotionBackend) {
        match self.state {
            GCodeState::Resuming1 => {
                if !(self.mailbox.is_empty() && motion.idle()) {
                    return;
                }
                let Some(snap) = self.machine.pause_snapshot.clone() else {
                    self.abort_protocol("Error: nothing to resume".to_string());
                    return;
                };
                if self
                    .stage_canned(
                        &[(0, snap.position[0]), (1, snap.position[1])],
                        self.settings.travel_feed_rate,
                        EndstopSet::EMPTY,
                    )
                    .is_ok()
                {
                    self.wait_for_canned(GCodeState::Resuming2);
                }
            }
            GCodeState::Resuming2 => {
                let Some(snap) = self.machine.pause_snapshot.clone() else {
                    self.abort_protocol("Error: nothing to resume".to_string());
                    return;
                };
                if self
                    .stage_canned(&[(2, snap.position[2])], self.settings.travel_feed_rate, EndstopSet::EMPTY)
                    .is_ok()
                {
                    self.wait_for_canned(GCodeState::Resuming3);
                }
            }
            GCodeState::Resuming3 => {
                if let Some(snap) = self.machine.pause_snapshot.take() {
                    self.machine.fan_values = snap.fan_values;
                    self.sources.source_mut(self.file_source).ctx.feed_rate = snap.feed_rate;
                    for (i, v) in snap.position[AXES..].iter().enumerate() {
                        self.machine.last_raw_extruder_pos[i] = *v;
                    }
                }
                self.machine.paused = false;
                tracing::info!("print resumed");
                let origin = self.protocol_origin.unwrap_or(self.file_source);
                self.finish_protocol(None);
                if let Err(e) = self.do_file_macro(origin, "resume.g", false) {
                    tracing::warn!("resume.g failed: {e}");
                }
            }
            _ => {}
        }
    }

    fn push_context(&mut self, ctx_id: SourceId) -> Result<CodeResult, GCodeError> {
        let ctx = self.sources.source(ctx_id).ctx.clone();
        let frame = MacroFrame {
            state: self.state,
            source: ctx_id,
            feed_rate: ctx.feed_rate,
            axes_relative: ctx.axes_relative,
            drives_relative: ctx.drives_relative,
            doing_macro: self.macro_file.is_some(),
            file: FrameFile::Inherit,
        };
        self.macro_stack
            .push(frame)
            .map_err(|_| GCodeError::Stack(StackError::Overflow))?;
        Ok(CodeResult::Finished(None))
    }

    fn set_tool_temperature(&mut self, cmd: &ParsedCommand, heat: &mut dyn HeatBackend, wait: bool) -> Result<CodeResult, GCodeError> {
        let number = match cmd.int_value('T') {
            Some(t) => t,
            None => self.tools.active_id().ok_or(GCodeError::NoToolSelected)?,
        };
        let (heaters, temps) = {
            let tool = self.tools.get_mut(number).ok_or(ToolError::Unknown(number))?;
            if let Some(s) = cmd.value('S') {
                tool.set_temps(Some(s), None);
            }
            (tool.heaters().to_vec(), tool.active_temps().to_vec())
        };
        for (i, &h) in heaters.iter().enumerate() {
            heat.set_active_temperature(h, temps[i]);
            heat.select_active(h);
        }
        if wait {
            for &h in &heaters {
                if heat.faults().is_set(h) {
                    return Err(GCodeError::HeaterFault(h));
                }
            }
            if heaters.iter().any(|&h| !heat.at_target(h, self.settings.temp_tolerance)) {
                return Ok(CodeResult::Busy);
            }
        }
        Ok(CodeResult::Finished(None))
    }

    fn set_bed_temperature(&mut self, cmd: &ParsedCommand, heat: &mut dyn HeatBackend, wait: bool) -> Result<CodeResult, GCodeError> {
        let s = cmd.value('S').ok_or(GCodeError::MissingParameter('S'))?;
        let bed = self.settings.bed_heater;
        heat.set_active_temperature(bed, s);
        heat.select_active(bed);
        if wait {
            if heat.faults().is_set(bed) {
                return Err(GCodeError::HeaterFault(bed));
            }
            if !heat.at_target(bed, self.settings.temp_tolerance) {
                return Ok(CodeResult::Busy);
            }
        }
        Ok(CodeResult::Finished(None))
    }

    fn set_fan(&mut self, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        let fan = cmd.int_value('P').unwrap_or(0).max(0) as usize;
        if fan >= self.machine.fan_values.len() {
            return Err(GCodeError::BadFan(fan));
        }
        let s = cmd.value('S').unwrap_or(255.0);
        // Accept both the 0-255 and 0.0-1.0 conventions.
        let value = if s > 1.0 { (s / 255.0).min(1.0) } else { s.max(0.0) };
        self.machine.fan_values[fan] = value;
        Ok(CodeResult::Finished(None))
    }

    fn set_retraction(&mut self, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        let r = &mut self.settings.retraction;
        if let Some(s) = cmd.value('S') {
            r.length = s.max(0.0);
        }
        if let Some(f) = cmd.value(FEEDRATE_LETTER) {
            r.feed_rate = f.max(1.0);
        }
        if let Some(extra) = cmd.value('R') {
            r.extra = extra;
        }
        if let Some(z) = cmd.value('Z') {
            r.z_hop = z.max(0.0);
        }
        Ok(CodeResult::Finished(None))
    }

    fn clear_faults(&mut self, cmd: &ParsedCommand, heat: &mut dyn HeatBackend) -> Result<CodeResult, GCodeError> {
        match cmd.int_value('P') {
            Some(number) => {
                let heaters = {
                    let tool = self.tools.get_mut(number).ok_or(ToolError::Unknown(number))?;
                    tool.clear_fault();
                    tool.heaters().to_vec()
                };
                for h in heaters {
                    heat.faults().clear(h);
                }
            }
            None => {
                for tool in self.tools.iter_mut() {
                    tool.clear_fault();
                }
                for h in 0..heat.heater_count() {
                    heat.faults().clear(h);
                }
            }
        }
        Ok(CodeResult::Finished(None))
    }

    fn report_position(&self) -> String {
        let mut out = String::new();
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            out.push_str(&format!("{}:{:.3} ", letter, self.machine.last_target[axis]));
        }
        for (i, e) in self.machine.last_raw_extruder_pos.iter().enumerate() {
            out.push_str(&format!("E{i}:{e:.1} "));
        }
        out.trim_end().to_string()
    }

    // ------------------------------------------------------------------
    // T codes and the tool-change protocol

    fn handle_tcode(&mut self, origin: Origin, cmd: &ParsedCommand) -> Result<CodeResult, GCodeError> {
        if cmd.number < 0 {
            return Ok(CodeResult::Finished(Some(match self.tools.active_id() {
                Some(n) => format!("Tool {n} is selected"),
                None => "No tool is selected".to_string(),
            })));
        }
        let number = cmd.number;
        let tool = self.tools.get(number).ok_or(ToolError::Unknown(number))?;
        if tool.faulted() {
            return Err(ToolError::Faulted(number).into());
        }
        if self.tools.active_id() == Some(number) {
            return Ok(CodeResult::Finished(None));
        }
        self.old_tool = self.tools.active_id();
        self.new_tool = number;
        self.tool_wait = cmd.value('S').map(|v| v != 0.0).unwrap_or(true) && !tool.heaters().is_empty();
        self.tool_temps_commanded = false;
        self.protocol_origin = Some(self.origin_source(origin));
        self.state = GCodeState::ToolChange1;
        Ok(CodeResult::Finished(None))
    }

    fn advance_tool_change(&mut self, motion: &mut dyn MotionBackend, heat: &mut dyn HeatBackend) {
        match self.state {
            GCodeState::ToolChange1 => {
                if !(self.mailbox.is_empty() && motion.idle()) {
                    return;
                }
                // Drop the outgoing tool's heaters to standby. The active
                // pointer does not move until the final step.
                if let Some(old) = self.old_tool {
                    if let Some(tool) = self.tools.get(old) {
                        let heaters = tool.heaters().to_vec();
                        let standby = tool.standby_temps().to_vec();
                        for (i, &h) in heaters.iter().enumerate() {
                            heat.set_standby_temperature(h, standby[i]);
                            heat.select_standby(h);
                        }
                    }
                }
                self.state = GCodeState::ToolChange2;
            }
            GCodeState::ToolChange2 => {
                let (heaters, temps) = match self.tools.get(self.new_tool) {
                    Some(t) => (t.heaters().to_vec(), t.active_temps().to_vec()),
                    None => {
                        self.abort_protocol(format!("Error: tool {} is not defined", self.new_tool));
                        return;
                    }
                };
                if !self.tool_temps_commanded {
                    for (i, &h) in heaters.iter().enumerate() {
                        heat.set_active_temperature(h, temps[i]);
                        heat.select_active(h);
                    }
                    self.tool_temps_commanded = true;
                }
                for &h in &heaters {
                    if heat.faults().is_set(h) {
                        if let Some(t) = self.tools.get_mut(self.new_tool) {
                            t.flag_fault();
                        }
                        self.abort_protocol(format!("Error: heater {h} fault during tool change"));
                        return;
                    }
                }
                if self.tool_wait
                    && heaters.iter().any(|&h| !heat.at_target(h, self.settings.temp_tolerance))
                {
                    return;
                }
                self.state = GCodeState::ToolChange3;
            }
            GCodeState::ToolChange3 => match self.tools.activate(self.new_tool) {
                Ok(()) => {
                    tracing::info!("tool {} selected", self.new_tool);
                    self.finish_protocol(None);
                }
                Err(e) => self.abort_protocol(format!("Error: {e}")),
            },
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Macro machinery

    /// Run a macro file. Saves the current context (including the top-level
    /// state, which is how protocols resume after their macros return) and
    /// switches execution to the file. `report_missing` selects whether an
    /// absent file is a visible error or a silent skip; mandatory system
    /// macros pass true, optional hooks pass false.
    fn do_file_macro(&mut self, origin: SourceId, name: &str, report_missing: bool) -> Result<bool, GCodeError> {
        let path = self.settings.macro_dir.join(name);
        let reader = match FileReader::open(&path) {
            Ok(r) => r,
            Err(_) => {
                if report_missing {
                    return Err(GCodeError::MacroMissing(name.to_string()));
                }
                tracing::debug!("optional macro {} not present", name);
                return Ok(false);
            }
        };
        let ctx = self.sources.source(origin).ctx.clone();
        let frame = MacroFrame {
            state: self.state,
            source: origin,
            feed_rate: ctx.feed_rate,
            axes_relative: ctx.axes_relative,
            drives_relative: ctx.drives_relative,
            doing_macro: self.macro_file.is_some(),
            file: FrameFile::Restore(self.macro_file.take()),
        };
        match self.macro_stack.push(frame) {
            Ok(()) => {}
            Err(frame) => {
                // Hand the caller's file context back untouched.
                if let FrameFile::Restore(parent) = frame.file {
                    self.macro_file = parent;
                }
                return Err(StackError::Overflow.into());
            }
        }
        tracing::debug!("macro {} (depth {})", name, self.macro_stack.depth());
        self.macro_file = Some(reader);
        self.macro_line = None;
        self.state = GCodeState::Normal;
        if self.macro_owner.is_none() {
            self.macro_owner = Some(origin);
        }
        Ok(true)
    }

    /// Restore the top saved context: feed rate, relative flags, state and
    /// (for macro-call frames) the caller's file position.
    fn pop_frame(&mut self) -> Result<(), StackError> {
        let frame = self.macro_stack.pop()?;
        self.state = frame.state;
        let src = self.sources.source_mut(frame.source);
        src.ctx.feed_rate = frame.feed_rate;
        src.ctx.axes_relative = frame.axes_relative;
        src.ctx.drives_relative = frame.drives_relative;
        match frame.file {
            FrameFile::Inherit => {}
            FrameFile::Restore(parent) => {
                self.macro_file = parent;
                self.macro_line = None;
            }
        }
        if self.macro_stack.is_empty() && self.macro_file.is_none() {
            self.macro_owner = None;
        }
        Ok(())
    }

    /// Macro file exhausted: return to the caller.
    fn end_macro(&mut self) {
        if let Err(e) = self.pop_frame() {
            // A macro file with no frame to return to; never corrupt state
            // over it.
            tracing::error!("macro return failed: {}", e);
            self.macro_file = None;
            self.macro_line = None;
            self.macro_owner = None;
        }
    }

    // ------------------------------------------------------------------
    // Protocol bookkeeping

    fn finish_protocol(&mut self, reply: Option<String>) {
        let origin = self.protocol_origin.take();
        if let (Some(src), Some(text)) = (origin, reply) {
            self.sources.reply(src, text);
        }
        self.state = GCodeState::Normal;
    }

    /// Hard-stop the in-flight protocol: error reply to its originator,
    /// scratch state cleared, back to `Normal`. The control loop keeps
    /// ticking; no error here is fatal.
    fn abort_protocol(&mut self, message: String) {
        tracing::warn!("aborting {:?}: {}", self.state, message);
        if let Some(src) = self.protocol_origin.take() {
            self.sources.reply(src, message);
        }
        self.mailbox.clear();
        self.grid.abort();
        self.to_be_homed = [false; AXES];
        self.homing_axis = None;
        self.probe_index = 0;
        self.probe_step = 0;
        self.single_probe_step = 0;
        self.tool_temps_commanded = false;
        self.state = GCodeState::Normal;
    }
}
