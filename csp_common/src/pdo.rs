//! PDO mapping tables and startup SDO writes.
//!
//! A device's PDO layout is described per sync manager: direction, watchdog
//! policy and the ordered list of mapped objects. The layout is handed to the
//! bus master verbatim during configuration and also drives field
//! registration in the process image.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    MODE_CSP, OBJ_ACTUAL_POSITION, OBJ_CONTROL_WORD, OBJ_MODES_OF_OPERATION, OBJ_STATUS_WORD,
    OBJ_TARGET_POSITION, RX_PDO_MAPPING, TX_PDO_MAPPING,
};
use crate::device::ObjectId;

/// Data direction of a sync manager, seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Master → device (RxPDO).
    Output,
    /// Device → master (TxPDO).
    Input,
}

/// Sync manager watchdog policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogMode {
    /// Keep the device default.
    Default,
    Enable,
    #[default]
    Disable,
}

/// One mapped object inside a PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdoEntryInfo {
    pub index: u16,
    #[serde(default)]
    pub subindex: u8,
    /// Width in bits.
    pub bits: u8,
    /// Interpret the value as two's complement.
    #[serde(default)]
    pub signed: bool,
}

impl PdoEntryInfo {
    pub const fn new(index: u16, subindex: u8, bits: u8, signed: bool) -> Self {
        Self {
            index,
            subindex,
            bits,
            signed,
        }
    }

    #[inline]
    pub const fn object(&self) -> ObjectId {
        ObjectId::new(self.index, self.subindex)
    }
}

/// A PDO and its ordered entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoInfo {
    pub index: u16,
    #[serde(default)]
    pub entries: Vec<PdoEntryInfo>,
}

/// Sync manager slot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManagerConfig {
    pub index: u8,
    pub direction: Direction,
    #[serde(default)]
    pub watchdog: WatchdogMode,
    #[serde(default)]
    pub pdos: Vec<PdoInfo>,
}

/// Iterate over every mapped entry of a layout, in mapping order.
pub fn mapped_entries(
    layout: &[SyncManagerConfig],
) -> impl Iterator<Item = (Direction, &PdoEntryInfo)> + '_ {
    layout.iter().flat_map(|sm| {
        sm.pdos
            .iter()
            .flat_map(move |pdo| pdo.entries.iter().map(move |e| (sm.direction, e)))
    })
}

/// Find a mapped entry by object address.
pub fn find_entry(layout: &[SyncManagerConfig], object: ObjectId) -> Option<(Direction, PdoEntryInfo)> {
    mapped_entries(layout)
        .find(|(_, e)| e.object() == object)
        .map(|(d, e)| (d, *e))
}

/// Cyclic synchronous position layout used by servo drives.
///
/// SM0/SM1 are the mailbox, SM2 carries controlword + target position,
/// SM3 carries statusword + actual position. Watchdogs are disabled.
pub fn csp_default_layout() -> Vec<SyncManagerConfig> {
    vec![
        SyncManagerConfig {
            index: 0,
            direction: Direction::Output,
            watchdog: WatchdogMode::Disable,
            pdos: Vec::new(),
        },
        SyncManagerConfig {
            index: 1,
            direction: Direction::Input,
            watchdog: WatchdogMode::Disable,
            pdos: Vec::new(),
        },
        SyncManagerConfig {
            index: 2,
            direction: Direction::Output,
            watchdog: WatchdogMode::Disable,
            pdos: vec![PdoInfo {
                index: RX_PDO_MAPPING,
                entries: vec![
                    PdoEntryInfo::new(OBJ_CONTROL_WORD, 0, 16, false),
                    PdoEntryInfo::new(OBJ_TARGET_POSITION, 0, 32, true),
                ],
            }],
        },
        SyncManagerConfig {
            index: 3,
            direction: Direction::Input,
            watchdog: WatchdogMode::Disable,
            pdos: vec![PdoInfo {
                index: TX_PDO_MAPPING,
                entries: vec![
                    PdoEntryInfo::new(OBJ_STATUS_WORD, 0, 16, false),
                    PdoEntryInfo::new(OBJ_ACTUAL_POSITION, 0, 32, true),
                ],
            }],
        },
    ]
}

// ─── Startup SDO Writes ─────────────────────────────────────────────

/// Why a startup SDO write cannot be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SdoPayloadError {
    #[error("SDO 0x{index:04x}: unsupported size {size}")]
    UnsupportedSize { index: u16, size: u8 },

    #[error("SDO 0x{index:04x}: value {value} does not fit in {size} byte(s)")]
    ValueTooLarge { index: u16, value: u32, size: u8 },
}

/// A blocking object-dictionary write issued once during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdoWrite {
    pub index: u16,
    #[serde(default)]
    pub subindex: u8,
    pub value: u32,
    /// Payload size in bytes: 1, 2 or 4.
    pub size: u8,
}

impl SdoWrite {
    pub const fn new(index: u16, subindex: u8, value: u32, size: u8) -> Self {
        Self {
            index,
            subindex,
            value,
            size,
        }
    }

    /// Little-endian payload, or an error when `size` is unsupported or
    /// `value` does not fit in it.
    pub fn payload(&self) -> Result<heapless::Vec<u8, 4>, SdoPayloadError> {
        let max = match self.size {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            4 => u32::MAX,
            size => {
                return Err(SdoPayloadError::UnsupportedSize {
                    index: self.index,
                    size,
                });
            }
        };
        if self.value > max {
            return Err(SdoPayloadError::ValueTooLarge {
                index: self.index,
                value: self.value,
                size: self.size,
            });
        }
        let bytes = self.value.to_le_bytes();
        let mut out = heapless::Vec::new();
        for b in &bytes[..self.size as usize] {
            // Capacity is 4 and size <= 4.
            let _ = out.push(*b);
        }
        Ok(out)
    }
}

/// Drive initialisation sequence: fault reset, servo on, CSP mode.
pub fn default_startup_sdos() -> Vec<SdoWrite> {
    vec![
        SdoWrite::new(OBJ_CONTROL_WORD, 0, 0x80, 2),
        SdoWrite::new(OBJ_CONTROL_WORD, 0, 0x0F, 2),
        SdoWrite::new(OBJ_MODES_OF_OPERATION, 0, MODE_CSP as u32, 1),
    ]
}
