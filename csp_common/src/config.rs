//! Configuration loading and validation.
//!
//! The engine is configured from a single TOML file:
//!
//! ```toml
//! [engine]
//! cycle_period_ns = 1000000
//! bringup_timeout_cycles = 10000
//!
//! [clock]
//! enabled = true
//! measure_timing = false
//!
//! [[devices]]
//! name = "drive0"
//! position = 0
//! vendor_id = 0x00007595
//! product_code = 0x00000000
//! setpoint_offset = 5000
//! ```
//!
//! All numeric parameters have defaults; `[[devices]]` is required. PDO
//! layouts and startup SDO sequences default to the CSP servo profile.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::DcSettings;
use crate::consts::{
    CYCLE_PERIOD_NS_MAX, CYCLE_PERIOD_NS_MIN, DEFAULT_ASSIGN_ACTIVATE,
    DEFAULT_BRINGUP_TIMEOUT_CYCLES, DEFAULT_CYCLE_PERIOD_NS, DEFAULT_MAX_CONSECUTIVE_MISSED,
    MAX_DEVICES, NSEC_PER_SEC, OBJ_ACTUAL_POSITION, OBJ_CONTROL_WORD, OBJ_STATUS_WORD,
    OBJ_TARGET_POSITION,
};
use crate::device::{BusAddress, DeviceIdentity, ObjectId};
use crate::pdo::{
    Direction, SdoWrite, SyncManagerConfig, csp_default_layout, default_startup_sdos, find_entry,
    mapped_entries,
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `DeserializeOwned` type.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::FileNotFound` if the file does not exist
    /// - `ConfigError::ParseError` if it cannot be read or parsed
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(format!("{}: {e}", path.display()))
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Top-Level Config ───────────────────────────────────────────────

/// Complete engine configuration. Immutable once the engine is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub clock: ClockConfig,
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// `[engine]` section: scheduling and failure budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Log verbosity when not overridden on the command line.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Index of the bus master to reserve (default: 0).
    #[serde(default)]
    pub master_index: u32,

    /// Cycle period [ns] (default: 1_000_000 = 1 kHz). Must divide one second.
    #[serde(default = "default_cycle_period_ns")]
    pub cycle_period_ns: u64,

    /// Bring-up budget [cycles] before giving up (default: 10_000).
    #[serde(default = "default_bringup_timeout")]
    pub bringup_timeout_cycles: u64,

    /// Consecutive missed exchanges tolerated in the control phase (default: 10).
    #[serde(default = "default_max_missed")]
    pub max_consecutive_missed: u32,

    /// SCHED_FIFO priority; the policy maximum when absent.
    #[serde(default)]
    pub rt_priority: Option<i32>,

    /// CPU core to pin the loop to; unpinned when absent.
    #[serde(default)]
    pub cpu_core: Option<usize>,
}

fn default_cycle_period_ns() -> u64 {
    DEFAULT_CYCLE_PERIOD_NS
}
fn default_bringup_timeout() -> u64 {
    DEFAULT_BRINGUP_TIMEOUT_CYCLES
}
fn default_max_missed() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_MISSED
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            master_index: 0,
            cycle_period_ns: DEFAULT_CYCLE_PERIOD_NS,
            bringup_timeout_cycles: DEFAULT_BRINGUP_TIMEOUT_CYCLES,
            max_consecutive_missed: DEFAULT_MAX_CONSECUTIVE_MISSED,
            rt_priority: None,
            cpu_core: None,
        }
    }
}

/// `[clock]` section: distributed-clock synchronisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    /// Run DC synchronisation every cycle (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// AssignActivate word written to every slave (default: 0x0300).
    #[serde(default = "default_assign_activate")]
    pub assign_activate: u16,

    /// SYNC0 shift [ns]; half the cycle period when absent.
    #[serde(default)]
    pub sync0_shift_ns: Option<i32>,

    /// SYNC1 cycle [ns] (default: 0 = disabled).
    #[serde(default)]
    pub sync1_cycle_ns: u32,

    /// SYNC1 shift [ns] (default: 0).
    #[serde(default)]
    pub sync1_shift_ns: i32,

    /// Log the reference clock delta every cycle (default: false).
    #[serde(default)]
    pub measure_timing: bool,
}

fn default_true() -> bool {
    true
}
fn default_assign_activate() -> u16 {
    DEFAULT_ASSIGN_ACTIVATE
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            assign_activate: DEFAULT_ASSIGN_ACTIVATE,
            sync0_shift_ns: None,
            sync1_cycle_ns: 0,
            sync1_shift_ns: 0,
            measure_timing: false,
        }
    }
}

impl ClockConfig {
    /// DC parameters for a given cycle period. SYNC0 fires mid-cycle by default.
    pub fn dc_settings(&self, cycle_period_ns: u64) -> DcSettings {
        let period = cycle_period_ns as u32;
        DcSettings {
            assign_activate: self.assign_activate,
            sync0_cycle_ns: period,
            sync0_shift_ns: self.sync0_shift_ns.unwrap_or((period / 2) as i32),
            sync1_cycle_ns: self.sync1_cycle_ns,
            sync1_shift_ns: self.sync1_shift_ns,
        }
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub alias: u16,
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    /// Offset added to the measured position by the reference motion law.
    #[serde(default)]
    pub setpoint_offset: i32,
    /// Startup SDO writes; the CSP drive sequence when absent.
    #[serde(default)]
    pub startup_sdo: Option<Vec<SdoWrite>>,
    /// PDO layout; the CSP layout when absent.
    #[serde(default)]
    pub pdo: Option<Vec<SyncManagerConfig>>,
}

impl DeviceConfig {
    #[inline]
    pub const fn address(&self) -> BusAddress {
        BusAddress {
            alias: self.alias,
            position: self.position,
        }
    }

    #[inline]
    pub const fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id,
            product_code: self.product_code,
        }
    }

    pub fn layout(&self) -> Vec<SyncManagerConfig> {
        self.pdo.clone().unwrap_or_else(csp_default_layout)
    }

    pub fn startup_sdos(&self) -> Vec<SdoWrite> {
        self.startup_sdo.clone().unwrap_or_else(default_startup_sdos)
    }
}

/// `[simulation]` section, used by the simulated bus master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Exchanges each device spends in every state before advancing toward OP.
    #[serde(default = "default_op_after")]
    pub op_after_cycles: u32,
    /// Initial value of the 32-bit reference clock counter.
    #[serde(default)]
    pub reference_clock_start: u32,
}

fn default_op_after() -> u32 {
    3
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            op_after_cycles: default_op_after(),
            reference_clock_start: 0,
        }
    }
}

// ─── Loading & Validation ───────────────────────────────────────────

impl EngineConfig {
    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate parameter bounds and device uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let period = self.engine.cycle_period_ns;
        if !(CYCLE_PERIOD_NS_MIN..=CYCLE_PERIOD_NS_MAX).contains(&period) {
            return Err(invalid(format!(
                "cycle_period_ns {period} out of range [{CYCLE_PERIOD_NS_MIN}, {CYCLE_PERIOD_NS_MAX}]"
            )));
        }
        if NSEC_PER_SEC % period != 0 {
            return Err(invalid(format!(
                "cycle_period_ns {period} does not divide one second"
            )));
        }
        if self.engine.bringup_timeout_cycles == 0 {
            return Err(invalid("bringup_timeout_cycles must be > 0".to_string()));
        }
        if self.engine.max_consecutive_missed == 0 {
            return Err(invalid("max_consecutive_missed must be > 0".to_string()));
        }
        if let Some(shift) = self.clock.sync0_shift_ns {
            if shift < 0 || shift as u64 >= period {
                return Err(invalid(format!(
                    "sync0_shift_ns {shift} must be within [0, {period})"
                )));
            }
        }

        if self.devices.is_empty() {
            return Err(invalid("at least one device is required".to_string()));
        }
        if self.devices.len() > MAX_DEVICES {
            return Err(invalid(format!(
                "{} devices configured, at most {MAX_DEVICES} supported",
                self.devices.len()
            )));
        }

        let mut addresses = HashSet::new();
        for dev in &self.devices {
            if !addresses.insert(dev.address()) {
                return Err(invalid(format!(
                    "device '{}': duplicate bus address {}",
                    dev.name,
                    dev.address()
                )));
            }
            validate_device(dev)?;
        }
        Ok(())
    }
}

fn validate_device(dev: &DeviceConfig) -> Result<(), ConfigError> {
    for sdo in dev.startup_sdos() {
        sdo.payload()
            .map_err(|e| invalid(format!("device '{}': {e}", dev.name)))?;
    }

    let layout = dev.layout();
    let mut seen = HashSet::new();
    for (_, entry) in mapped_entries(&layout) {
        if !matches!(entry.bits, 8 | 16 | 32) {
            return Err(invalid(format!(
                "device '{}': entry {} has unsupported width {} bits",
                dev.name,
                entry.object(),
                entry.bits
            )));
        }
        if !seen.insert(entry.object()) {
            return Err(invalid(format!(
                "device '{}': entry {} mapped twice",
                dev.name,
                entry.object()
            )));
        }
    }

    let required = [
        (OBJ_CONTROL_WORD, Direction::Output),
        (OBJ_TARGET_POSITION, Direction::Output),
        (OBJ_STATUS_WORD, Direction::Input),
        (OBJ_ACTUAL_POSITION, Direction::Input),
    ];
    for (index, direction) in required {
        let object = ObjectId::new(index, 0);
        match find_entry(&layout, object) {
            Some((d, _)) if d == direction => {}
            Some(_) => {
                return Err(invalid(format!(
                    "device '{}': {object} mapped in the wrong direction",
                    dev.name
                )));
            }
            None => {
                return Err(invalid(format!(
                    "device '{}': required object {object} not mapped",
                    dev.name
                )));
            }
        }
    }
    Ok(())
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::ValidationError(msg)
}

/// Load and validate the engine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let config = EngineConfig::load(path)?;
    if let Err(e) = config.validate() {
        warn!("Rejected {}: {e}", path.display());
        return Err(e);
    }
    info!(
        "Loaded {}: {} device(s), cycle {}ns",
        path.display(),
        config.devices.len(),
        config.engine.cycle_period_ns
    );
    for dev in &config.devices {
        if dev.startup_sdo.is_none() {
            debug!("{}: default startup SDO sequence", dev.name);
        }
        if dev.pdo.is_none() {
            debug!("{}: default CSP PDO layout", dev.name);
        }
    }
    Ok(config)
}
