//! Process image codec: typed access to fixed byte ranges of the shared
//! process-data buffer.
//!
//! Every access goes through a [`FieldDescriptor`] issued by the
//! [`FieldRegistry`](crate::registry::FieldRegistry), so offsets and widths
//! are validated once at registration and never computed by hand in the
//! cycle. Values are little-endian, as on the wire.
//!
//! ## RT Safety
//!
//! The buffer is allocated once at finalization and never resized. `read`
//! and `write` are allocation-free and bounds-checked.

use std::fmt;
use std::ops::Range;

use csp_common::device::ObjectId;
use thiserror::Error;

/// Width and signedness of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl FieldKind {
    /// Resolve a kind from a PDO entry width. Only byte-aligned widths up to
    /// 32 bits are mapped.
    pub const fn from_bits(bits: u8, signed: bool) -> Option<Self> {
        match (bits, signed) {
            (8, false) => Some(Self::U8),
            (8, true) => Some(Self::I8),
            (16, false) => Some(Self::U16),
            (16, true) => Some(Self::I16),
            (32, false) => Some(Self::U32),
            (32, true) => Some(Self::I32),
            _ => None,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Self::U8 | Self::I8 => 8,
            Self::U16 | Self::I16 => 16,
            Self::U32 | Self::I32 => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32)
    }

    /// Smallest representable value.
    pub const fn min(self) -> i64 {
        match self {
            Self::U8 | Self::U16 | Self::U32 => 0,
            Self::I8 => i8::MIN as i64,
            Self::I16 => i16::MIN as i64,
            Self::I32 => i32::MIN as i64,
        }
    }

    /// Largest representable value.
    pub const fn max(self) -> i64 {
        match self {
            Self::U8 => u8::MAX as i64,
            Self::I8 => i8::MAX as i64,
            Self::U16 => u16::MAX as i64,
            Self::I16 => i16::MAX as i64,
            Self::U32 => u32::MAX as i64,
            Self::I32 => i32::MAX as i64,
        }
    }

    #[inline]
    pub const fn contains(self, value: i64) -> bool {
        value >= self.min() && value <= self.max()
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
        };
        f.write_str(s)
    }
}

/// A registered field: which device object lives where in the image.
///
/// Only the registry constructs descriptors; they are immutable and `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    device: usize,
    object: ObjectId,
    byte_offset: usize,
    kind: FieldKind,
}

impl FieldDescriptor {
    pub(crate) const fn new(
        device: usize,
        object: ObjectId,
        byte_offset: usize,
        kind: FieldKind,
    ) -> Self {
        Self {
            device,
            object,
            byte_offset,
            kind,
        }
    }

    #[inline]
    pub const fn device(&self) -> usize {
        self.device
    }

    #[inline]
    pub const fn object(&self) -> ObjectId {
        self.object
    }

    #[inline]
    pub const fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    #[inline]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    #[inline]
    pub const fn bit_width(&self) -> u32 {
        self.kind.bits()
    }

    #[inline]
    pub const fn is_signed(&self) -> bool {
        self.kind.is_signed()
    }

    /// Exclusive end offset.
    #[inline]
    pub const fn end(&self) -> usize {
        self.byte_offset + self.kind.bytes()
    }

    #[inline]
    pub const fn byte_range(&self) -> Range<usize> {
        self.byte_offset..self.end()
    }

    /// True if the two byte ranges share at least one byte.
    #[inline]
    pub const fn overlaps(&self, other: &FieldDescriptor) -> bool {
        self.byte_offset < other.end() && other.byte_offset < self.end()
    }
}

/// Process image access error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Value does not fit the field's declared width/signedness.
    #[error("value {value} out of range for {kind} field {object}")]
    FieldRange {
        object: ObjectId,
        value: i64,
        kind: FieldKind,
    },

    /// Field lies (partly) outside the image.
    #[error("field {object} [{offset}, {end}) outside image of {len} bytes")]
    OutOfBounds {
        object: ObjectId,
        offset: usize,
        end: usize,
        len: usize,
    },
}

/// The shared process-data buffer exchanged once per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImage {
    buffer: Box<[u8]>,
}

impl ProcessImage {
    /// Zero-filled image of `size` bytes.
    pub(crate) fn zeroed(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn checked_range(&self, field: &FieldDescriptor) -> Result<Range<usize>, ImageError> {
        if field.end() > self.buffer.len() {
            return Err(ImageError::OutOfBounds {
                object: field.object(),
                offset: field.byte_offset(),
                end: field.end(),
                len: self.buffer.len(),
            });
        }
        Ok(field.byte_range())
    }

    /// Decode a field. Signed kinds are sign-extended.
    pub fn read(&self, field: &FieldDescriptor) -> Result<i64, ImageError> {
        let range = self.checked_range(field)?;
        let mut raw = 0u64;
        for (i, b) in self.buffer[range].iter().enumerate() {
            raw |= (*b as u64) << (8 * i);
        }
        let kind = field.kind();
        if kind.is_signed() {
            let shift = 64 - kind.bits();
            Ok(((raw << shift) as i64) >> shift)
        } else {
            Ok(raw as i64)
        }
    }

    /// Decode a field that must fit an `i32`.
    pub fn read_i32(&self, field: &FieldDescriptor) -> Result<i32, ImageError> {
        let value = self.read(field)?;
        i32::try_from(value).map_err(|_| ImageError::FieldRange {
            object: field.object(),
            value,
            kind: FieldKind::I32,
        })
    }

    /// Decode a field that must fit a `u16`.
    pub fn read_u16(&self, field: &FieldDescriptor) -> Result<u16, ImageError> {
        let value = self.read(field)?;
        u16::try_from(value).map_err(|_| ImageError::FieldRange {
            object: field.object(),
            value,
            kind: FieldKind::U16,
        })
    }

    /// Encode a field. Out-of-range values are rejected and leave the
    /// image untouched.
    pub fn write(&mut self, field: &FieldDescriptor, value: i64) -> Result<(), ImageError> {
        let kind = field.kind();
        if !kind.contains(value) {
            return Err(ImageError::FieldRange {
                object: field.object(),
                value,
                kind,
            });
        }
        let range = self.checked_range(field)?;
        // In-range values share their low bytes with the i64 encoding.
        let bytes = value.to_le_bytes();
        self.buffer[range].copy_from_slice(&bytes[..kind.bytes()]);
        Ok(())
    }
}
