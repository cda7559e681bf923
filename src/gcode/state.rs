// src/gcode/state.rs

/// All the states the G-code processing machine may be in.
///
/// `Normal` is the only state in which a brand-new top-level command is
/// accepted; every other value is a private continuation that is re-entered
/// each tick until its exit condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GCodeState {
    Normal,
    WaitingForMoveToComplete,
    Homing,
    SetBed1,
    SetBed2,
    SetBed3,
    ToolChange1,
    ToolChange2,
    ToolChange3,
    Pausing1,
    Pausing2,
    Resuming1,
    Resuming2,
    Resuming3,
}

impl GCodeState {
    pub fn is_normal(self) -> bool {
        self == GCodeState::Normal
    }
}

impl Default for GCodeState {
    fn default() -> Self {
        GCodeState::Normal
    }
}
