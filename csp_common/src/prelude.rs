//! Prelude module for common re-exports.
//!
//! ```rust
//! use csp_common::prelude::*;
//! ```

// ─── Bus Master ─────────────────────────────────────────────────────
pub use crate::bus::{
    BusError, BusMaster, DcSettings, DomainHandle, DomainState, PdoEntryRegistration,
    SlaveConfigHandle, WcState,
};

// ─── Devices & Mapping ──────────────────────────────────────────────
pub use crate::device::{BusAddress, DeviceIdentity, DeviceState, ObjectId, SlaveConfigState};
pub use crate::pdo::{Direction, PdoEntryInfo, PdoInfo, SdoPayloadError, SdoWrite, SyncManagerConfig, WatchdogMode};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, EngineConfig, LogLevel};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DEFAULT_CYCLE_PERIOD_NS, MAX_DEVICES, NSEC_PER_SEC};
