//! Per-cycle motion: measured inputs in, setpoints out.
//!
//! The engine does not know how setpoints are derived. It reads each
//! device's [`Measured`] values, asks the [`MotionPolicy`] for a
//! [`Setpoint`] and writes it back. [`OffsetPolicy`] is the reference law:
//! hold the drive enabled and command the measured position plus a fixed
//! per-device offset.

use bitflags::bitflags;
use csp_common::consts::{
    MAX_DEVICES, OBJ_ACTUAL_POSITION, OBJ_CONTROL_WORD, OBJ_STATUS_WORD, OBJ_TARGET_POSITION,
};
use csp_common::device::ObjectId;

use crate::image::{FieldDescriptor, FieldKind, ImageError, ProcessImage};
use crate::registry::{FieldRegistry, RegistryError};

bitflags! {
    /// CiA 402 controlword (0x6040).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlWord: u16 {
        const SWITCH_ON        = 0x0001;
        const ENABLE_VOLTAGE   = 0x0002;
        /// Active low: must be set for normal operation.
        const QUICK_STOP       = 0x0004;
        const ENABLE_OPERATION = 0x0008;
        /// Rising edge acknowledges a fault.
        const FAULT_RESET      = 0x0080;
        const HALT             = 0x0100;

        /// "Enable operation" command of the drive state machine (0x000F).
        const OPERATION = Self::SWITCH_ON.bits()
            | Self::ENABLE_VOLTAGE.bits()
            | Self::QUICK_STOP.bits()
            | Self::ENABLE_OPERATION.bits();
    }
}

bitflags! {
    /// CiA 402 statusword (0x6041).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        const READY_TO_SWITCH_ON = 0x0001;
        const SWITCHED_ON        = 0x0002;
        const OPERATION_ENABLED  = 0x0004;
        const FAULT              = 0x0008;
        const VOLTAGE_ENABLED    = 0x0010;
        const QUICK_STOP         = 0x0020;
        const SWITCH_ON_DISABLED = 0x0040;
        const WARNING            = 0x0080;
        const REMOTE             = 0x0200;
        const TARGET_REACHED     = 0x0400;
        const INTERNAL_LIMIT     = 0x0800;

        // Bits 12/13 are mode specific.
        const _ = !0;
    }
}

impl StatusWord {
    const STATE_MASK: u16 = 0x006F;
    const STATE_OPERATION_ENABLED: u16 = 0x0027;

    /// Drive state machine is in "Operation enabled".
    #[inline]
    pub const fn is_operation_enabled(&self) -> bool {
        self.bits() & Self::STATE_MASK == Self::STATE_OPERATION_ENABLED
    }

    #[inline]
    pub const fn has_fault(&self) -> bool {
        self.contains(Self::FAULT)
    }
}

/// Inputs of one device for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measured {
    pub status_word: StatusWord,
    pub actual_position: i32,
}

/// Outputs of one device for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setpoint {
    pub control_word: ControlWord,
    pub target_position: i32,
}

/// Derives setpoints from measurements. Called once per device per
/// control cycle, on the RT path: implementations must not block.
pub trait MotionPolicy {
    fn name(&self) -> &'static str;

    fn next_setpoint(&mut self, device: usize, measured: &Measured) -> Setpoint;
}

/// target = measured + offset, drive held in "Operation enabled".
#[derive(Debug, Clone, Default)]
pub struct OffsetPolicy {
    offsets: heapless::Vec<i32, MAX_DEVICES>,
}

impl OffsetPolicy {
    /// One offset per device index; extra entries beyond `MAX_DEVICES` are dropped.
    pub fn new(offsets: &[i32]) -> Self {
        Self {
            offsets: offsets.iter().copied().take(MAX_DEVICES).collect(),
        }
    }

    /// Offset for a device; devices without one hold position.
    pub fn offset(&self, device: usize) -> i32 {
        self.offsets.get(device).copied().unwrap_or(0)
    }
}

impl MotionPolicy for OffsetPolicy {
    fn name(&self) -> &'static str {
        "offset"
    }

    #[inline]
    fn next_setpoint(&mut self, device: usize, measured: &Measured) -> Setpoint {
        Setpoint {
            control_word: ControlWord::OPERATION,
            target_position: measured.actual_position.saturating_add(self.offset(device)),
        }
    }
}

/// The four CSP fields of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisFields {
    pub device: usize,
    pub control_word: FieldDescriptor,
    pub target_position: FieldDescriptor,
    pub status_word: FieldDescriptor,
    pub actual_position: FieldDescriptor,
}

impl AxisFields {
    /// Look up and type-check a device's CSP fields.
    pub fn bind(registry: &FieldRegistry, device: usize) -> Result<Self, RegistryError> {
        let word = |index| bind_field(registry, device, index, "unsigned 8/16-bit", is_word);
        let position = |index| bind_field(registry, device, index, "i32", is_position);
        Ok(Self {
            device,
            control_word: word(OBJ_CONTROL_WORD)?,
            target_position: position(OBJ_TARGET_POSITION)?,
            status_word: word(OBJ_STATUS_WORD)?,
            actual_position: position(OBJ_ACTUAL_POSITION)?,
        })
    }

    pub fn read_measured(&self, image: &ProcessImage) -> Result<Measured, ImageError> {
        Ok(Measured {
            status_word: StatusWord::from_bits_retain(image.read_u16(&self.status_word)?),
            actual_position: image.read_i32(&self.actual_position)?,
        })
    }

    /// Write control word and target position.
    pub fn write_setpoint(&self, image: &mut ProcessImage, sp: &Setpoint) -> Result<(), ImageError> {
        image.write(&self.control_word, sp.control_word.bits() as i64)?;
        image.write(&self.target_position, sp.target_position as i64)
    }
}

fn is_word(kind: FieldKind) -> bool {
    matches!(kind, FieldKind::U8 | FieldKind::U16)
}

fn is_position(kind: FieldKind) -> bool {
    kind == FieldKind::I32
}

fn bind_field(
    registry: &FieldRegistry,
    device: usize,
    index: u16,
    expected: &'static str,
    accept: fn(FieldKind) -> bool,
) -> Result<FieldDescriptor, RegistryError> {
    let object = ObjectId::new(index, 0);
    let field = registry.require(device, object)?;
    if !accept(field.kind()) {
        return Err(RegistryError::KindMismatch {
            device,
            object,
            expected,
            actual: field.kind(),
        });
    }
    Ok(field)
}
