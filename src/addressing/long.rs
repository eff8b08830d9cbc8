//! DALI long (random) address.
//!
//! A 24-bit value each device generates on `RANDOMISE`. It only matters
//! during commissioning, but since it never changes afterwards the registry
//! uses it as the stable device identity.
//!
//! Textual form is exactly six uppercase hex digits (`0A1B2C`).

use crate::error::{DaliError, Result};
use core::fmt;

/// 24-bit DALI long address
///
/// # Examples
///
/// ```
/// use dali_bridge::LongAddress;
///
/// let addr = LongAddress::new(0x0A1B2C).unwrap();
/// assert_eq!(addr.to_hex().as_str(), "0A1B2C");
///
/// let parsed: LongAddress = "0a1b2c".parse().unwrap();
/// assert_eq!(parsed, addr);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LongAddress {
    raw: u32,
}

impl LongAddress {
    /// Largest valid long address, also the initial search address
    pub const MAX: u32 = 0x00FF_FFFF;

    /// Create a long address.
    ///
    /// # Errors
    ///
    /// Returns an addressing error if `raw` does not fit in 24 bits.
    pub fn new(raw: u32) -> Result<Self> {
        if raw > Self::MAX {
            return Err(DaliError::invalid_long_address());
        }
        Ok(Self { raw })
    }

    /// Assemble from the three bytes returned by the random address queries.
    #[inline]
    pub const fn from_bytes(high: u8, mid: u8, low: u8) -> Self {
        Self {
            raw: ((high as u32) << 16) | ((mid as u32) << 8) | low as u32,
        }
    }

    /// Get the raw 24-bit value.
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.raw
    }

    /// Split into `[high, mid, low]` search address bytes.
    #[inline]
    pub const fn bytes(self) -> [u8; 3] {
        [(self.raw >> 16) as u8, (self.raw >> 8) as u8, self.raw as u8]
    }

    /// Format as six uppercase hex digits.
    pub fn to_hex(&self) -> heapless::String<6> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        let _ = write!(s, "{:06X}", self.raw);
        s
    }
}

impl From<LongAddress> for u32 {
    #[inline(always)]
    fn from(addr: LongAddress) -> u32 {
        addr.raw
    }
}

impl fmt::Display for LongAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}", self.raw)
    }
}

impl core::str::FromStr for LongAddress {
    type Err = DaliError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 6 {
            return Err(DaliError::invalid_long_address());
        }
        // from_str_radix accepts a leading '+', which is not a hex digit
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DaliError::invalid_long_address());
        }
        let raw = u32::from_str_radix(s, 16).map_err(|_| DaliError::invalid_long_address())?;
        Ok(Self { raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_new_rejects_25_bits() {
        assert!(LongAddress::new(0x0100_0000).is_err());
        assert!(LongAddress::new(LongAddress::MAX).is_ok());
    }

    #[test]
    fn test_to_hex_pads_and_uppercases() {
        assert_eq!(LongAddress::new(0x0A1B2C).unwrap().to_hex().as_str(), "0A1B2C");
        assert_eq!(LongAddress::new(0x2C).unwrap().to_hex().as_str(), "00002C");
        assert_eq!(format!("{}", LongAddress::new(0xABCDEF).unwrap()), "ABCDEF");
    }

    #[test]
    fn test_bytes_split() {
        let addr = LongAddress::from_bytes(0x0A, 0x1B, 0x2C);
        assert_eq!(addr.raw(), 0x0A1B2C);
        assert_eq!(addr.bytes(), [0x0A, 0x1B, 0x2C]);
    }

    #[test]
    fn test_from_str_invalid() {
        assert!("".parse::<LongAddress>().is_err());
        assert!("1234567".parse::<LongAddress>().is_err());
        assert!("00FFFFFF".parse::<LongAddress>().is_err());
        assert!("XYZ".parse::<LongAddress>().is_err());
        assert!("+12".parse::<LongAddress>().is_err());
    }

    #[test]
    fn test_from_str_short_form() {
        let addr: LongAddress = "2c".parse().unwrap();
        assert_eq!(addr.raw(), 0x2C);
    }

    #[quickcheck]
    fn long_address_string_roundtrip(raw: u32) -> bool {
        let addr = LongAddress::new(raw & LongAddress::MAX).unwrap();
        addr.to_hex().parse::<LongAddress>().ok() == Some(addr)
    }
}
