//! Short addresses, groups, scenes and command targets.
//!
//! Forward frames select their recipients through the first byte:
//! - Short: `0AAAAAAS` (0-63)
//! - Group: `100GGGGS` (0-15)
//! - Broadcast: `1111111S`
//!
//! where `S` is 0 for direct arc power control and 1 for a command opcode.

use crate::error::{DaliError, Result};
use core::fmt;

/// Number of short addresses per address space
pub const SHORT_ADDRESS_COUNT: u8 = 64;
/// Number of DALI groups
pub const GROUP_COUNT: u8 = 16;
/// Number of DALI scenes
pub const SCENE_COUNT: u8 = 16;

/// Short address (0-63) assigned at commissioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShortAddress(u8);

impl ShortAddress {
    /// # Errors
    ///
    /// Returns an addressing error if `value` is 64 or above.
    pub fn new(value: u8) -> Result<Self> {
        if value >= SHORT_ADDRESS_COUNT {
            return Err(DaliError::short_out_of_range());
        }
        Ok(Self(value))
    }

    /// Iterate over all 64 short addresses.
    pub fn all() -> impl Iterator<Item = ShortAddress> {
        (0..SHORT_ADDRESS_COUNT).map(ShortAddress)
    }

    /// Construct from a value already known to be in range (masked to 6 bits).
    #[inline]
    pub(crate) const fn from_masked(value: u8) -> Self {
        Self(value & 0x3F)
    }

    #[inline(always)]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Bit for this address in a 64-bit occupancy mask.
    #[inline]
    pub const fn mask_bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group number (0-15)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GroupId(u8);

impl GroupId {
    /// # Errors
    ///
    /// Returns an addressing error if `value` is 16 or above.
    pub fn new(value: u8) -> Result<Self> {
        if value >= GROUP_COUNT {
            return Err(DaliError::group_out_of_range());
        }
        Ok(Self(value))
    }

    pub fn all() -> impl Iterator<Item = GroupId> {
        (0..GROUP_COUNT).map(GroupId)
    }

    #[inline]
    pub(crate) const fn from_masked(value: u8) -> Self {
        Self(value & 0x0F)
    }

    #[inline(always)]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Bit for this group in a 16-bit membership mask.
    #[inline]
    pub const fn mask_bit(self) -> u16 {
        1u16 << self.0
    }
}

/// Scene number (0-15)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SceneId(u8);

impl SceneId {
    /// # Errors
    ///
    /// Returns an addressing error if `value` is 16 or above.
    pub fn new(value: u8) -> Result<Self> {
        if value >= SCENE_COUNT {
            return Err(DaliError::scene_out_of_range());
        }
        Ok(Self(value))
    }

    #[inline(always)]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// The two disjoint short-address spaces on one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressSpace {
    /// IEC 62386-102 control gear (ballasts, LED drivers)
    ControlGear,
    /// IEC 62386-103 control devices (sensors, push buttons)
    InputDevice,
}

/// Recipient selector of a forward frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Target {
    Short(ShortAddress),
    Group(GroupId),
    Broadcast,
}

impl Target {
    /// Encode the address byte of a control gear forward frame.
    ///
    /// `command` selects the `S` bit: `false` for direct arc power control.
    #[inline]
    pub const fn address_byte(self, command: bool) -> u8 {
        let selector = command as u8;
        match self {
            Target::Short(a) => (a.0 << 1) | selector,
            Target::Group(g) => 0x80 | (g.0 << 1) | selector,
            Target::Broadcast => 0xFE | selector,
        }
    }

    /// Decode the address byte of a 16-bit control gear forward frame.
    ///
    /// Returns the target and whether the `S` bit selects a command.
    /// Special command bytes (`101xxxxx`, `110xxxxx`) and the unaddressed
    /// broadcast `1111110S` yield `None`.
    pub const fn from_address_byte(byte: u8) -> Option<(Target, bool)> {
        let command = byte & 0x01 == 1;
        if byte & 0x80 == 0 {
            Some((Target::Short(ShortAddress::from_masked(byte >> 1)), command))
        } else if byte & 0xE0 == 0x80 {
            Some((Target::Group(GroupId::from_masked(byte >> 1)), command))
        } else if byte & 0xFE == 0xFE {
            Some((Target::Broadcast, command))
        } else {
            None
        }
    }
}
