//! Device addressing, identity and application-layer state.
//!
//! A device is created once during configuration. Its address and identity
//! never change afterwards; only its observed [`DeviceState`] is refreshed,
//! once per cycle, by the engine's state tracker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    /// Alias address (0 = address by position only).
    pub alias: u16,
    /// Ring position relative to the alias.
    pub position: u16,
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alias, self.position)
    }
}

/// Expected vendor/product identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub product_code: u32,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}:0x{:08x}", self.vendor_id, self.product_code)
    }
}

/// Object dictionary entry address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub index: u16,
    #[serde(default)]
    pub subindex: u8,
}

impl ObjectId {
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}:{:02x}", self.index, self.subindex)
    }
}

/// Application-layer state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    Init,
    PreOp,
    SafeOp,
    Op,
    /// Offline, bootstrap, or a mixed/invalid AL status.
    #[default]
    Unknown,
}

impl DeviceState {
    /// Decode an AL status value (lower nibble; the error bit is ignored).
    pub const fn from_al_state(al_state: u8) -> Self {
        match al_state & 0x0F {
            0x1 => Self::Init,
            0x2 => Self::PreOp,
            0x4 => Self::SafeOp,
            0x8 => Self::Op,
            _ => Self::Unknown,
        }
    }

    /// AL status value for this state (0 for `Unknown`).
    pub const fn al_state(self) -> u8 {
        match self {
            Self::Init => 0x1,
            Self::PreOp => 0x2,
            Self::SafeOp => 0x4,
            Self::Op => 0x8,
            Self::Unknown => 0x0,
        }
    }

    #[inline]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Op)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::PreOp => "PREOP",
            Self::SafeOp => "SAFEOP",
            Self::Op => "OP",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Snapshot of a slave configuration as reported by the bus master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlaveConfigState {
    /// The slave is present on the bus.
    pub online: bool,
    /// The slave was brought into OP as configured.
    pub operational: bool,
    /// Raw AL status.
    pub al_state: u8,
}

impl SlaveConfigState {
    /// Resolve the observed device state. An offline slave is `Unknown`.
    pub const fn device_state(&self) -> DeviceState {
        if !self.online {
            return DeviceState::Unknown;
        }
        DeviceState::from_al_state(self.al_state)
    }
}
