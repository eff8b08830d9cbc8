//! Logical DALI frames.
//!
//! ```text
//! Backward (reply)      8 bits   [ data ]
//! Forward, control gear 16 bits  [ address | opcode ]
//! Forward, input device 24 bits  [ address | instance | opcode ]
//! ```
//!
//! Payload bits are right-aligned in a `u32`.

use crate::addressing::Target;
use crate::error::{DaliError, Result};

/// Valid frame lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameLength {
    Backward = 8,
    Forward16 = 16,
    Forward24 = 24,
}

impl FrameLength {
    /// Map a bit count to a frame length.
    #[inline]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::Backward),
            16 => Some(Self::Forward16),
            24 => Some(Self::Forward24),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    const fn mask(self) -> u32 {
        (1u32 << self as u8) - 1
    }
}

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Sent by a bus master (command or query)
    Forward,
    /// Sent by a device answering a query
    Backward,
}

/// A logical DALI frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    data: u32,
    length: FrameLength,
}

impl Frame {
    /// Build a frame from raw payload bits and a bit count.
    ///
    /// # Errors
    ///
    /// Returns a frame error unless `bits` is 8, 16 or 24 and `data`
    /// fits in that many bits.
    pub fn new(data: u32, bits: u8) -> Result<Self> {
        let length = FrameLength::from_bits(bits).ok_or_else(DaliError::invalid_frame_length)?;
        if data & !length.mask() != 0 {
            return Err(DaliError::invalid_frame_length());
        }
        Ok(Self { data, length })
    }

    #[inline]
    pub(crate) const fn from_parts(data: u32, length: FrameLength) -> Self {
        Self { data, length }
    }

    /// 8-bit backward frame.
    #[inline]
    pub const fn backward(value: u8) -> Self {
        Self {
            data: value as u32,
            length: FrameLength::Backward,
        }
    }

    /// 16-bit forward frame from address and opcode bytes.
    #[inline]
    pub const fn forward16(address: u8, opcode: u8) -> Self {
        Self {
            data: ((address as u32) << 8) | opcode as u32,
            length: FrameLength::Forward16,
        }
    }

    /// 24-bit forward frame (input device space).
    #[inline]
    pub const fn forward24(address: u8, instance: u8, opcode: u8) -> Self {
        Self {
            data: ((address as u32) << 16) | ((instance as u32) << 8) | opcode as u32,
            length: FrameLength::Forward24,
        }
    }

    /// Direct arc power control frame.
    #[inline]
    pub const fn arc_power(target: Target, level: u8) -> Self {
        Self::forward16(target.address_byte(false), level)
    }

    /// Standard command frame for control gear.
    #[inline]
    pub const fn command(target: Target, opcode: u8) -> Self {
        Self::forward16(target.address_byte(true), opcode)
    }

    #[inline(always)]
    pub const fn data(self) -> u32 {
        self.data
    }

    #[inline(always)]
    pub const fn length(self) -> FrameLength {
        self.length
    }

    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.length as u8
    }

    #[inline]
    pub const fn direction(self) -> Direction {
        match self.length {
            FrameLength::Backward => Direction::Backward,
            _ => Direction::Forward,
        }
    }

    #[inline]
    pub const fn is_backward(self) -> bool {
        matches!(self.length, FrameLength::Backward)
    }

    /// Payload bytes, most significant first, without leading padding.
    pub fn bytes(self) -> heapless::Vec<u8, 3> {
        let count = (self.bits() / 8) as usize;
        let all = self.data.to_be_bytes();
        let mut out = heapless::Vec::new();
        // capacity 3 always holds `count` bytes
        let _ = out.extend_from_slice(&all[4 - count..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupId, ShortAddress};

    #[test]
    fn test_new_validates_length() {
        assert!(Frame::new(0xFF, 8).is_ok());
        assert!(Frame::new(0x1234, 16).is_ok());
        assert!(Frame::new(0x12_3456, 24).is_ok());
        assert!(Frame::new(0, 12).is_err());
        assert!(Frame::new(0, 32).is_err());
    }

    #[test]
    fn test_new_rejects_overflowing_data() {
        assert!(Frame::new(0x100, 8).is_err());
        assert!(Frame::new(0x1_0000, 16).is_err());
    }

    #[test]
    fn test_direction() {
        assert_eq!(Frame::backward(0x42).direction(), Direction::Backward);
        assert_eq!(Frame::forward16(0xFF, 0x00).direction(), Direction::Forward);
        assert!(!Frame::forward24(0xC1, 0x00, 0x00).is_backward());
    }

    #[test]
    fn test_builders() {
        let sa = Target::Short(ShortAddress::new(1).unwrap());
        assert_eq!(Frame::arc_power(sa, 200).data(), 0x02C8);
        assert_eq!(Frame::command(sa, 0xA0).data(), 0x03A0);

        let group = Target::Group(GroupId::new(15).unwrap());
        assert_eq!(Frame::command(group, 0x05).data(), 0x9F05);

        assert_eq!(Frame::forward24(0xC1, 0x03, 0x00).data(), 0xC1_0300);
    }

    #[test]
    fn test_bytes() {
        assert_eq!(Frame::forward16(0xA3, 0x7F).bytes().as_slice(), &[0xA3, 0x7F]);
        assert_eq!(Frame::backward(0x10).bytes().as_slice(), &[0x10]);
        assert_eq!(
            Frame::forward24(0x01, 0xFE, 0x30).bytes().as_slice(),
            &[0x01, 0xFE, 0x30]
        );
    }
}
