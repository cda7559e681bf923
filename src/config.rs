// src/config.rs - machine configuration
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gcode::source::SourcePolicy;
use crate::machine::AXES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,

    #[serde(default)]
    pub interpreter: InterpreterConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub retraction: RetractionConfig,

    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub name: String,

    /// Number of extruder drives beyond the three axes.
    #[serde(default = "default_extruders")]
    pub extruders: usize,

    #[serde(default = "default_heaters")]
    pub heaters: usize,

    /// Heater index driven by M140/M190.
    #[serde(default)]
    pub bed_heater: usize,

    #[serde(default = "default_fans")]
    pub fans: usize,

    /// Per-axis scale factors; non-unity only in special kinematics.
    #[serde(default = "default_axis_scale")]
    pub axis_scale: [f64; AXES],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterpreterConfig {
    /// Directory holding macro files (homing macros, M98 targets).
    #[serde(default = "default_macro_dir")]
    pub macro_dir: String,

    /// Directory print files are selected from (M23).
    #[serde(default = "default_gcode_dir")]
    pub gcode_dir: String,

    /// "round-robin" or "file-last"; see SourcePolicy.
    #[serde(default = "default_source_policy")]
    pub source_policy: String,

    /// Heater settle tolerance in degrees, for M109/M190 and tool changes.
    #[serde(default = "default_temp_tolerance")]
    pub temp_tolerance: f64,

    /// Feed rate assumed before any F parameter is seen, units/min.
    #[serde(default = "default_feed_rate")]
    pub default_feed_rate: f64,

    /// Feed rate for internally generated travel moves, units/min.
    #[serde(default = "default_travel_feed_rate")]
    pub travel_feed_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// XY coordinates probed by G29/G32, in order.
    #[serde(default = "default_probe_points")]
    pub points: Vec<[f64; 2]>,

    /// Height the head travels at between probe points.
    #[serde(default = "default_dive_height")]
    pub dive_height: f64,

    /// Probing feed rate, units/min.
    #[serde(default = "default_probe_feed_rate")]
    pub feed_rate: f64,

    /// Lowest Z a probing move may command before giving up.
    #[serde(default = "default_probe_floor")]
    pub floor: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetractionConfig {
    #[serde(default = "default_retract_length")]
    pub length: f64,

    /// Extra length fed back on un-retract.
    #[serde(default)]
    pub extra: f64,

    /// Retraction feed rate, units/min.
    #[serde(default = "default_retract_feed_rate")]
    pub feed_rate: f64,

    #[serde(default)]
    pub z_hop: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    pub number: i32,

    /// Extruder drive indices this tool owns (0 = first extruder).
    #[serde(default)]
    pub drives: Vec<usize>,

    #[serde(default)]
    pub heaters: Vec<usize>,

    #[serde(default)]
    pub offset: [f64; AXES],

    /// Mixing ratios, one per drive; presence enables mixing.
    #[serde(default)]
    pub mix: Option<Vec<f64>>,
}

// Default value functions
fn default_extruders() -> usize { 1 }
fn default_heaters() -> usize { 2 }
fn default_fans() -> usize { 1 }
fn default_axis_scale() -> [f64; AXES] { [1.0; AXES] }
fn default_macro_dir() -> String { "macros".to_string() }
fn default_gcode_dir() -> String { "gcodes".to_string() }
fn default_source_policy() -> String { "round-robin".to_string() }
fn default_temp_tolerance() -> f64 { 2.5 }
fn default_feed_rate() -> f64 { 3000.0 }
fn default_travel_feed_rate() -> f64 { 6000.0 }
fn default_probe_points() -> Vec<[f64; 2]> {
    vec![[15.0, 15.0], [185.0, 15.0], [100.0, 185.0]]
}
fn default_dive_height() -> f64 { 5.0 }
fn default_probe_feed_rate() -> f64 { 120.0 }
fn default_probe_floor() -> f64 { -10.0 }
fn default_retract_length() -> f64 { 2.0 }
fn default_retract_feed_rate() -> f64 { 1200.0 }
fn default_tools() -> Vec<ToolConfig> {
    vec![ToolConfig {
        number: 0,
        drives: vec![0],
        heaters: vec![1],
        offset: [0.0; AXES],
        mix: None,
    }]
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            extruders: default_extruders(),
            heaters: default_heaters(),
            bed_heater: 0,
            fans: default_fans(),
            axis_scale: default_axis_scale(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            macro_dir: default_macro_dir(),
            gcode_dir: default_gcode_dir(),
            source_policy: default_source_policy(),
            temp_tolerance: default_temp_tolerance(),
            default_feed_rate: default_feed_rate(),
            travel_feed_rate: default_travel_feed_rate(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            points: default_probe_points(),
            dive_height: default_dive_height(),
            feed_rate: default_probe_feed_rate(),
            floor: default_probe_floor(),
        }
    }
}

impl Default for RetractionConfig {
    fn default() -> Self {
        Self {
            length: default_retract_length(),
            extra: 0.0,
            feed_rate: default_retract_feed_rate(),
            z_hop: 0.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            interpreter: InterpreterConfig::default(),
            probe: ProbeConfig::default(),
            retraction: RetractionConfig::default(),
            tools: default_tools(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Axes plus extruders.
    pub fn drive_count(&self) -> usize {
        AXES + self.machine.extruders
    }

    pub fn source_policy(&self) -> SourcePolicy {
        match self.interpreter.source_policy.as_str() {
            "round-robin" => SourcePolicy::RoundRobin,
            "file-last" => SourcePolicy::FileLast,
            other => {
                tracing::warn!("unknown source policy {:?}, using round-robin", other);
                SourcePolicy::RoundRobin
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.extruders == 0 && !self.tools.is_empty() {
            return Err(ConfigError::Invalid(
                "tools defined but no extruder drives configured".to_string(),
            ));
        }
        if self.machine.bed_heater >= self.machine.heaters {
            return Err(ConfigError::Invalid(format!(
                "bed_heater {} out of range ({} heaters)",
                self.machine.bed_heater, self.machine.heaters
            )));
        }
        if self.machine.axis_scale.iter().any(|&s| s <= 0.0) {
            return Err(ConfigError::Invalid("axis_scale entries must be positive".to_string()));
        }
        if self.interpreter.temp_tolerance <= 0.0 {
            return Err(ConfigError::Invalid("temp_tolerance must be positive".to_string()));
        }
        if self.interpreter.default_feed_rate <= 0.0 || self.interpreter.travel_feed_rate <= 0.0 {
            return Err(ConfigError::Invalid("feed rates must be positive".to_string()));
        }
        if self.probe.feed_rate <= 0.0 {
            return Err(ConfigError::Invalid("probe feed_rate must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drive_count(), 4);
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.source_policy(), SourcePolicy::RoundRobin);
    }

    #[test]
    fn parses_toml() {
        let toml_config = r#"
[machine]
name = "corexy-350"
extruders = 2
heaters = 3
bed_heater = 0
fans = 2

[interpreter]
source_policy = "file-last"
temp_tolerance = 1.5

[probe]
points = [[10.0, 10.0], [340.0, 10.0], [175.0, 340.0]]
dive_height = 3.0

[[tools]]
number = 0
drives = [0]
heaters = [1]

[[tools]]
number = 1
drives = [1]
heaters = [2]
offset = [12.5, 0.0, -0.2]
        "#;
        let config: Config = toml::from_str(toml_config).unwrap();
        config.validate().unwrap();
        assert_eq!(config.drive_count(), 5);
        assert_eq!(config.source_policy(), SourcePolicy::FileLast);
        assert_eq!(config.probe.points.len(), 3);
        assert_eq!(config.tools[1].offset[0], 12.5);
    }

    #[test]
    fn bad_bed_heater_is_rejected() {
        let mut config = Config::default();
        config.machine.bed_heater = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mixing_tool_round_trips() {
        let toml_config = r#"
[machine]
extruders = 3

[[tools]]
number = 0
drives = [0, 1, 2]
heaters = [1]
mix = [0.6, 0.3, 0.1]
        "#;
        let config: Config = toml::from_str(toml_config).unwrap();
        assert_eq!(config.tools[0].mix.as_deref(), Some(&[0.6, 0.3, 0.1][..]));
    }
}
