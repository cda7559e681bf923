// src/tools.rs - the tool registry
//
// Tools are a fixed set created from configuration at startup: a grouping of
// extruder drives and heaters with temperatures, an XYZ offset and optional
// mixing ratios. Exactly one tool may be active at a time.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::ToolConfig;
use crate::machine::AXES;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("tool {0} is not defined")]
    Unknown(i32),
    #[error("tool {0} has a heater fault; clear it before selecting")]
    Faulted(i32),
    #[error("tool {tool}: mix ratio count {got} does not match drive count {want}")]
    BadMixLength { tool: i32, got: usize, want: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Active,
    Standby,
    Off,
}

#[derive(Debug)]
pub struct Tool {
    number: i32,
    /// Extruder drive indices (0 = first extruder).
    drives: Vec<usize>,
    /// Heater indices into the thermal subsystem.
    heaters: Vec<usize>,
    mix: Vec<f64>,
    mixing: bool,
    active_temps: Vec<f64>,
    standby_temps: Vec<f64>,
    offset: [f64; AXES],
    state: ToolState,
    fault: bool,
}

impl Tool {
    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn drives(&self) -> &[usize] {
        &self.drives
    }

    pub fn heaters(&self) -> &[usize] {
        &self.heaters
    }

    pub fn mix(&self) -> &[f64] {
        &self.mix
    }

    pub fn mixing(&self) -> bool {
        self.mixing
    }

    pub fn set_mixing(&mut self, on: bool) {
        self.mixing = on;
    }

    pub fn define_mix(&mut self, mix: Vec<f64>) -> Result<(), ToolError> {
        if mix.len() != self.drives.len() {
            return Err(ToolError::BadMixLength {
                tool: self.number,
                got: mix.len(),
                want: self.drives.len(),
            });
        }
        self.mix = mix;
        Ok(())
    }

    pub fn offset(&self) -> [f64; AXES] {
        self.offset
    }

    pub fn set_offset_component(&mut self, axis: usize, value: f64) {
        self.offset[axis] = value;
    }

    pub fn active_temps(&self) -> &[f64] {
        &self.active_temps
    }

    pub fn standby_temps(&self) -> &[f64] {
        &self.standby_temps
    }

    /// Set every associated heater's set-point (M104/G10 style).
    pub fn set_temps(&mut self, active: Option<f64>, standby: Option<f64>) {
        for t in &mut self.active_temps {
            if let Some(a) = active {
                *t = a;
            }
        }
        for t in &mut self.standby_temps {
            if let Some(s) = standby {
                *t = s;
            }
        }
    }

    pub fn state(&self) -> ToolState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ToolState::Active
    }

    pub fn faulted(&self) -> bool {
        self.fault
    }

    pub fn flag_fault(&mut self) {
        self.fault = true;
        self.state = ToolState::Off;
    }

    pub fn clear_fault(&mut self) {
        self.fault = false;
        if self.state == ToolState::Off {
            self.state = ToolState::Standby;
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<i32, Tool>,
    active: Option<i32>,
}

impl ToolRegistry {
    /// Build the registry from configuration. A tool with an out-of-range or
    /// already-claimed drive or heater index is a configuration error: it is
    /// logged and not created; the remaining tools still are.
    pub fn from_config(configs: &[ToolConfig], extruder_count: usize, heater_count: usize) -> Self {
        let mut tools = BTreeMap::new();
        let mut claimed_drives: BTreeMap<usize, i32> = BTreeMap::new();
        for cfg in configs {
            if tools.contains_key(&cfg.number) {
                tracing::error!("tool {} defined twice; keeping the first definition", cfg.number);
                continue;
            }
            if let Some(&bad) = cfg.drives.iter().find(|&&d| d >= extruder_count) {
                tracing::error!("tool {}: drive index {} out of range; tool not created", cfg.number, bad);
                continue;
            }
            if let Some(&bad) = cfg.heaters.iter().find(|&&h| h >= heater_count) {
                tracing::error!("tool {}: heater index {} out of range; tool not created", cfg.number, bad);
                continue;
            }
            if let Some((&d, &other)) = cfg.drives.iter().find_map(|d| claimed_drives.get_key_value(d).map(|kv| (kv.0, kv.1))) {
                tracing::error!("tool {}: drive {} already assigned to tool {}; tool not created", cfg.number, d, other);
                continue;
            }
            for &d in &cfg.drives {
                claimed_drives.insert(d, cfg.number);
            }
            let mix = match &cfg.mix {
                Some(m) if m.len() == cfg.drives.len() => m.clone(),
                Some(m) => {
                    tracing::warn!("tool {}: {} mix ratios for {} drives; using equal shares", cfg.number, m.len(), cfg.drives.len());
                    equal_mix(cfg.drives.len())
                }
                None => equal_mix(cfg.drives.len()),
            };
            tools.insert(
                cfg.number,
                Tool {
                    number: cfg.number,
                    drives: cfg.drives.clone(),
                    heaters: cfg.heaters.clone(),
                    mixing: cfg.mix.is_some(),
                    mix,
                    active_temps: vec![0.0; cfg.heaters.len()],
                    standby_temps: vec![0.0; cfg.heaters.len()],
                    offset: cfg.offset,
                    state: ToolState::Off,
                    fault: false,
                },
            );
        }
        tracing::info!("{} tool(s) defined", tools.len());
        Self { tools, active: None }
    }

    pub fn get(&self, number: i32) -> Option<&Tool> {
        self.tools.get(&number)
    }

    pub fn get_mut(&mut self, number: i32) -> Option<&mut Tool> {
        self.tools.get_mut(&number)
    }

    pub fn active_id(&self) -> Option<i32> {
        self.active
    }

    pub fn active(&self) -> Option<&Tool> {
        self.active.and_then(|n| self.tools.get(&n))
    }

    /// Switch the active tool. The outgoing tool drops to standby and the
    /// incoming one becomes active in the same call, so an observer never
    /// sees zero or two active tools.
    pub fn activate(&mut self, number: i32) -> Result<(), ToolError> {
        let incoming = self.tools.get(&number).ok_or(ToolError::Unknown(number))?;
        if incoming.faulted() {
            return Err(ToolError::Faulted(number));
        }
        if let Some(old) = self.active {
            if old != number {
                if let Some(t) = self.tools.get_mut(&old) {
                    t.state = ToolState::Standby;
                }
            }
        }
        if let Some(t) = self.tools.get_mut(&number) {
            t.state = ToolState::Active;
        }
        self.active = Some(number);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tool> {
        self.tools.values_mut()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count of tools currently marked active. The registry keeps this at
    /// zero (before first selection) or one.
    pub fn active_count(&self) -> usize {
        self.tools.values().filter(|t| t.is_active()).count()
    }
}

fn equal_mix(drives: usize) -> Vec<f64> {
    if drives == 0 {
        Vec::new()
    } else {
        vec![1.0 / drives as f64; drives]
    }
}
