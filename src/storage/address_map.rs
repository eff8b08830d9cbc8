//! Fixed-layout address map record.
//!
//! ```text
//! offset size field
//!      0    4 long address (u32 LE)
//!      4    1 short address (0xFF = none)
//!      5    1 device type (0xFF = none)
//!      6   16 product id, NUL padded
//!     22    1 device class (0 = control gear, 1 = input device)
//!     23    1 colour flags (bit0 tunable white, bit1 RGB, bit7 known)
//!     24    1 min level
//!     25    1 max level
//!     26    1 power-on level
//!     27    1 system-failure level
//!     28    2 reserved
//! ```

use crate::adapter::ColourCapability;
use crate::addressing::{AddressSpace, LongAddress, ShortAddress};
use crate::device::{ColorState, ControlGear, Device, InputDevice, PRODUCT_ID_LEN};
use crate::error::{DaliError, Result};
use crate::registry::DEVICE_CAPACITY;

/// Size of one encoded record
pub const RECORD_LEN: usize = 30;

/// Largest address map blob
pub const ADDRESS_MAP_LEN: usize = RECORD_LEN * DEVICE_CAPACITY;

const NONE: u8 = 0xFF;
const CLASS_GEAR: u8 = 0;
const CLASS_INPUT: u8 = 1;
const COLOUR_TC: u8 = 0x01;
const COLOUR_RGB: u8 = 0x02;
const COLOUR_KNOWN: u8 = 0x80;

/// Persisted identity and static attributes of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub space: AddressSpace,
    pub long: LongAddress,
    pub short: Option<ShortAddress>,
    pub device_type: Option<u8>,
    pub product_id: heapless::String<PRODUCT_ID_LEN>,
    /// DT8 capability, when it has been queried
    pub colour: Option<ColourCapability>,
    pub min_level: u8,
    pub max_level: u8,
    pub power_on_level: u8,
    pub system_failure_level: u8,
}

impl AddressRecord {
    pub fn from_device(device: &Device) -> Self {
        let identity = device.identity();
        let mut record = Self {
            space: device.space(),
            long: identity.long,
            short: identity.short,
            device_type: None,
            product_id: identity.product_id.clone(),
            colour: None,
            min_level: 1,
            max_level: 254,
            power_on_level: 254,
            system_failure_level: 254,
        };
        if let Device::ControlGear(gear) = device {
            record.device_type = gear.device_type;
            record.colour = gear
                .colour
                .filter(|colour| colour.capability_known)
                .map(|colour| ColourCapability {
                    tunable_white: colour.supports_tc,
                    rgb: colour.supports_rgb,
                });
            record.min_level = gear.min_level;
            record.max_level = gear.max_level;
            record.power_on_level = gear.power_on_level;
            record.system_failure_level = gear.system_failure_level;
        }
        record
    }

    /// Rebuild a registry entry.
    ///
    /// Dynamic state (level, status) starts from defaults; a record with a
    /// device type counts as having its static attributes loaded.
    pub fn into_device(self) -> Device {
        match self.space {
            AddressSpace::ControlGear => {
                let mut gear = ControlGear::new(self.long, self.short);
                gear.identity.product_id = self.product_id;
                gear.identity.static_loaded = self.device_type.is_some();
                gear.device_type = self.device_type;
                gear.colour = self.colour.map(ColorState::from_capability);
                gear.min_level = self.min_level;
                gear.max_level = self.max_level;
                gear.power_on_level = self.power_on_level;
                gear.system_failure_level = self.system_failure_level;
                Device::ControlGear(gear)
            }
            AddressSpace::InputDevice => {
                let mut input = InputDevice::new(self.long, self.short);
                input.identity.product_id = self.product_id;
                Device::InputDevice(input)
            }
        }
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.long.raw().to_le_bytes());
        out[4] = self.short.map_or(NONE, ShortAddress::value);
        out[5] = self.device_type.unwrap_or(NONE);
        let id = self.product_id.as_bytes();
        out[6..6 + id.len()].copy_from_slice(id);
        out[22] = match self.space {
            AddressSpace::ControlGear => CLASS_GEAR,
            AddressSpace::InputDevice => CLASS_INPUT,
        };
        out[23] = self.colour.map_or(0, |colour| {
            let mut flags = COLOUR_KNOWN;
            if colour.tunable_white {
                flags |= COLOUR_TC;
            }
            if colour.rgb {
                flags |= COLOUR_RGB;
            }
            flags
        });
        out[24] = self.min_level;
        out[25] = self.max_level;
        out[26] = self.power_on_level;
        out[27] = self.system_failure_level;
        out
    }

    /// Decode one record.
    ///
    /// # Errors
    ///
    /// Returns a corrupt-storage error for an unknown device class, an
    /// out-of-range address or a product id that is not UTF-8.
    pub fn decode(raw: &[u8; RECORD_LEN]) -> Result<Self> {
        let long = LongAddress::new(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .map_err(|_| DaliError::storage_corrupt())?;
        let short = match raw[4] {
            NONE => None,
            value => Some(ShortAddress::new(value).map_err(|_| DaliError::storage_corrupt())?),
        };
        let device_type = (raw[5] != NONE).then_some(raw[5]);

        let id = &raw[6..6 + PRODUCT_ID_LEN];
        let id_len = id.iter().position(|b| *b == 0).unwrap_or(PRODUCT_ID_LEN);
        let id = core::str::from_utf8(&id[..id_len]).map_err(|_| DaliError::storage_corrupt())?;
        let product_id = heapless::String::try_from(id).map_err(|_| DaliError::storage_corrupt())?;

        let space = match raw[22] {
            CLASS_GEAR => AddressSpace::ControlGear,
            CLASS_INPUT => AddressSpace::InputDevice,
            _ => return Err(DaliError::storage_corrupt()),
        };
        let flags = raw[23];
        let colour = (flags & COLOUR_KNOWN != 0).then_some(ColourCapability {
            tunable_white: flags & COLOUR_TC != 0,
            rgb: flags & COLOUR_RGB != 0,
        });

        Ok(Self {
            space,
            long,
            short,
            device_type,
            product_id,
            colour,
            min_level: raw[24],
            max_level: raw[25],
            power_on_level: raw[26],
            system_failure_level: raw[27],
        })
    }
}

/// Encode records back to back into `buf`, returning the blob length.
///
/// # Errors
///
/// Returns a storage error if `buf` cannot hold every record.
pub fn encode_all<'r>(records: impl IntoIterator<Item = &'r AddressRecord>, buf: &mut [u8]) -> Result<usize> {
    let mut len = 0;
    for record in records {
        let slot = buf
            .get_mut(len..len + RECORD_LEN)
            .ok_or_else(DaliError::buffer_too_small)?;
        slot.copy_from_slice(&record.encode());
        len += RECORD_LEN;
    }
    Ok(len)
}

/// Decode a complete address map blob.
///
/// # Errors
///
/// Returns a corrupt-storage error if the blob length is not a multiple of
/// the record size or any record is invalid.
pub fn decode_all(blob: &[u8]) -> Result<heapless::Vec<AddressRecord, DEVICE_CAPACITY>> {
    if blob.len() % RECORD_LEN != 0 {
        return Err(DaliError::storage_corrupt());
    }
    let mut records = heapless::Vec::new();
    for chunk in blob.chunks_exact(RECORD_LEN) {
        let raw: &[u8; RECORD_LEN] = chunk.try_into().map_err(|_| DaliError::storage_corrupt())?;
        records
            .push(AddressRecord::decode(raw)?)
            .map_err(|_| DaliError::storage_corrupt())?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gear_record() -> AddressRecord {
        let mut gear = ControlGear::new(LongAddress::new(0x0A1B2C).unwrap(), Some(ShortAddress::new(5).unwrap()));
        gear.device_type = Some(8);
        gear.identity.product_id = heapless::String::try_from("040123456789").unwrap();
        gear.colour = Some(ColorState::from_capability(ColourCapability {
            tunable_white: true,
            rgb: false,
        }));
        gear.min_level = 85;
        AddressRecord::from_device(&Device::ControlGear(gear))
    }

    #[test]
    fn test_record_layout() {
        let raw = gear_record().encode();
        assert_eq!(&raw[0..4], &[0x2C, 0x1B, 0x0A, 0x00]);
        assert_eq!(raw[4], 5);
        assert_eq!(raw[5], 8);
        assert_eq!(&raw[6..18], b"040123456789");
        assert_eq!(&raw[18..22], &[0; 4]);
        assert_eq!(raw[22], CLASS_GEAR);
        assert_eq!(raw[23], COLOUR_KNOWN | COLOUR_TC);
        assert_eq!(&raw[24..28], &[85, 254, 254, 254]);
        assert_eq!(&raw[28..30], &[0, 0]);
    }

    #[test]
    fn test_blob_round_trip_restores_device() {
        let input = AddressRecord::from_device(&Device::new(
            AddressSpace::InputDevice,
            LongAddress::new(0x123).unwrap(),
            None,
        ));
        let records = [gear_record(), input];
        let mut buf = [0u8; 2 * RECORD_LEN];
        let len = encode_all(&records, &mut buf).unwrap();
        assert_eq!(len, 60);

        let decoded = decode_all(&buf[..len]).unwrap();
        assert_eq!(decoded.as_slice(), &records);

        let device = decoded[0].clone().into_device();
        let gear = device.as_gear().unwrap();
        assert!(gear.identity.static_loaded);
        assert!(gear.colour.unwrap().supports_tc);
        assert_eq!(gear.current_level, 0);
        assert_eq!(decoded[1].short, None);
    }

    #[test]
    fn test_corrupt_blobs_rejected() {
        assert!(decode_all(&[0u8; RECORD_LEN + 1]).is_err());

        let mut raw = gear_record().encode();
        raw[22] = 7;
        assert!(decode_all(&raw).is_err());

        let mut raw = gear_record().encode();
        raw[4] = 64;
        assert!(decode_all(&raw).is_err());

        let mut raw = gear_record().encode();
        raw[3] = 0x01;
        assert!(decode_all(&raw).is_err());

        let mut raw = gear_record().encode();
        raw[6] = 0xC3;
        assert!(decode_all(&raw).is_err());
    }

    #[test]
    fn test_empty_blob_is_empty_map() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let mut buf = [0u8; RECORD_LEN - 1];
        assert!(encode_all(&[gear_record()], &mut buf).is_err());
    }
}
