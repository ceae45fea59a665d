//! Field registry: maps `(device, object)` to a validated location in the
//! process image.
//!
//! Offsets come from the bus master when PDO entries are registered in the
//! domain. The registry checks them once, before the image exists: no two
//! fields may share a byte and every `(device, object)` pair is unique.
//! After [`FieldRegistry::finalize_with_size`] the engine only holds
//! immutable descriptors.

use csp_common::device::ObjectId;
use csp_common::pdo::PdoEntryInfo;
use thiserror::Error;

use crate::image::{FieldDescriptor, FieldKind, ProcessImage};

/// Field registration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("device {device} object {object} registered twice")]
    Duplicate { device: usize, object: ObjectId },

    #[error(
        "device {device} object {object} at [{offset}, {end}) overlaps device {other_device} object {other_object}"
    )]
    Overlap {
        device: usize,
        object: ObjectId,
        offset: usize,
        end: usize,
        other_device: usize,
        other_object: ObjectId,
    },

    #[error("device {device} object {object}: unsupported width {bits} bits")]
    UnsupportedWidth {
        device: usize,
        object: ObjectId,
        bits: u8,
    },

    #[error("device {device} object {object}: offset {offset} overflows")]
    OffsetOverflow {
        device: usize,
        object: ObjectId,
        offset: usize,
    },

    #[error("process image of {size} bytes cannot hold fields ending at {required}")]
    ImageTooSmall { size: usize, required: usize },

    #[error("device {device} object {object} not registered")]
    MissingField { device: usize, object: ObjectId },

    #[error("device {device} object {object} is {actual}, expected {expected}")]
    KindMismatch {
        device: usize,
        object: ObjectId,
        expected: &'static str,
        actual: FieldKind,
    },
}

/// Registered fields, in registration order.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    fields: Vec<FieldDescriptor>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field at a byte offset.
    pub fn register(
        &mut self,
        device: usize,
        object: ObjectId,
        kind: FieldKind,
        byte_offset: usize,
    ) -> Result<FieldDescriptor, RegistryError> {
        if byte_offset.checked_add(kind.bytes()).is_none() {
            return Err(RegistryError::OffsetOverflow {
                device,
                object,
                offset: byte_offset,
            });
        }
        let field = FieldDescriptor::new(device, object, byte_offset, kind);

        for existing in &self.fields {
            if existing.device() == device && existing.object() == object {
                return Err(RegistryError::Duplicate { device, object });
            }
            if existing.overlaps(&field) {
                return Err(RegistryError::Overlap {
                    device,
                    object,
                    offset: field.byte_offset(),
                    end: field.end(),
                    other_device: existing.device(),
                    other_object: existing.object(),
                });
            }
        }

        self.fields.push(field);
        Ok(field)
    }

    /// Register a mapped PDO entry at the offset the bus assigned to it.
    pub fn register_entry(
        &mut self,
        device: usize,
        entry: &PdoEntryInfo,
        byte_offset: usize,
    ) -> Result<FieldDescriptor, RegistryError> {
        let kind = FieldKind::from_bits(entry.bits, entry.signed).ok_or(
            RegistryError::UnsupportedWidth {
                device,
                object: entry.object(),
                bits: entry.bits,
            },
        )?;
        self.register(device, entry.object(), kind, byte_offset)
    }

    pub fn lookup(&self, device: usize, object: ObjectId) -> Option<FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.device() == device && f.object() == object)
            .copied()
    }

    /// Like [`lookup`](Self::lookup), but a missing field is an error.
    pub fn require(&self, device: usize, object: ObjectId) -> Result<FieldDescriptor, RegistryError> {
        self.lookup(device, object)
            .ok_or(RegistryError::MissingField { device, object })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Smallest image size that holds every registered field.
    pub fn required_size(&self) -> usize {
        self.fields.iter().map(FieldDescriptor::end).max().unwrap_or(0)
    }

    /// Zeroed image sized to fit exactly the registered fields.
    pub fn finalize(&self) -> ProcessImage {
        ProcessImage::zeroed(self.required_size())
    }

    /// Zeroed image of the size the bus reports for the domain.
    ///
    /// The domain may carry padding beyond the registered fields, but never
    /// less than they need.
    pub fn finalize_with_size(&self, size: usize) -> Result<ProcessImage, RegistryError> {
        let required = self.required_size();
        if size < required {
            return Err(RegistryError::ImageTooSmall { size, required });
        }
        Ok(ProcessImage::zeroed(size))
    }
}
