//! Device records kept by the registry.

use embassy_time::Instant;

use crate::adapter::ColourCapability;
use crate::addressing::{AddressSpace, LongAddress, ShortAddress};
use crate::protocol::commands::MASK;

/// Maximum product id length (12 GTIN hex digits fit)
pub const PRODUCT_ID_LEN: usize = 16;

/// Level value meaning "not known yet"
pub const LEVEL_UNKNOWN: u8 = MASK;

/// Registry key: the two address spaces never share an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceKey {
    pub space: AddressSpace,
    pub long: LongAddress,
}

impl DeviceKey {
    pub const fn gear(long: LongAddress) -> Self {
        Self {
            space: AddressSpace::ControlGear,
            long,
        }
    }

    pub const fn input(long: LongAddress) -> Self {
        Self {
            space: AddressSpace::InputDevice,
            long,
        }
    }
}

/// Fields shared by every device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub long: LongAddress,
    pub short: Option<ShortAddress>,
    /// GTIN as read from memory bank 0
    pub product_id: heapless::String<PRODUCT_ID_LEN>,
    pub available: bool,
    /// Device type, GTIN and level limits have been read
    pub static_loaded: bool,
}

impl DeviceIdentity {
    pub fn new(long: LongAddress, short: Option<ShortAddress>) -> Self {
        Self {
            long,
            short,
            product_id: heapless::String::new(),
            available: true,
            static_loaded: false,
        }
    }
}

/// DT8 colour state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorState {
    pub supports_tc: bool,
    pub supports_rgb: bool,
    pub capability_known: bool,
    /// Colour temperature in mirek
    pub mirek: Option<u16>,
    pub rgb: Option<(u8, u8, u8)>,
    pub last_poll: Option<Instant>,
}

impl ColorState {
    pub fn from_capability(capability: ColourCapability) -> Self {
        Self {
            supports_tc: capability.tunable_white,
            supports_rgb: capability.rgb,
            capability_known: true,
            ..Self::default()
        }
    }

    /// Reported colour, for notifications
    pub fn snapshot(&self) -> ColourSnapshot {
        ColourSnapshot {
            mirek: self.mirek,
            rgb: self.rgb,
        }
    }
}

/// Colour as published in notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ColourSnapshot {
    pub mirek: Option<u16>,
    pub rgb: Option<(u8, u8, u8)>,
}

/// IEC 62386-102 control gear
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlGear {
    pub identity: DeviceIdentity,
    pub current_level: u8,
    /// Last non-zero level, restored by `On`
    pub last_level: u8,
    pub status: Option<u8>,
    pub min_level: u8,
    pub max_level: u8,
    pub power_on_level: u8,
    pub system_failure_level: u8,
    pub device_type: Option<u8>,
    pub colour: Option<ColorState>,
}

impl ControlGear {
    pub fn new(long: LongAddress, short: Option<ShortAddress>) -> Self {
        Self {
            identity: DeviceIdentity::new(long, short),
            current_level: 0,
            last_level: 254,
            status: None,
            min_level: 1,
            max_level: 254,
            power_on_level: 254,
            system_failure_level: 254,
            device_type: None,
            colour: None,
        }
    }

    /// Record a new level; returns `true` if it changed.
    pub fn apply_level(&mut self, level: u8) -> bool {
        if level != LEVEL_UNKNOWN && level > 0 {
            self.last_level = level;
        }
        let changed = self.current_level != level;
        self.current_level = level;
        changed
    }

    pub fn is_on(&self) -> bool {
        self.current_level > 0 && self.current_level != LEVEL_UNKNOWN
    }
}

/// IEC 62386-103 control device (sensor, push button)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub identity: DeviceIdentity,
    pub instance: u8,
    pub status: Option<u8>,
}

impl InputDevice {
    pub fn new(long: LongAddress, short: Option<ShortAddress>) -> Self {
        Self {
            identity: DeviceIdentity::new(long, short),
            instance: 0,
            status: None,
        }
    }
}

/// A registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    ControlGear(ControlGear),
    InputDevice(InputDevice),
}

impl Device {
    pub fn new(space: AddressSpace, long: LongAddress, short: Option<ShortAddress>) -> Self {
        match space {
            AddressSpace::ControlGear => Device::ControlGear(ControlGear::new(long, short)),
            AddressSpace::InputDevice => Device::InputDevice(InputDevice::new(long, short)),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            Device::ControlGear(gear) => &gear.identity,
            Device::InputDevice(input) => &input.identity,
        }
    }

    pub fn identity_mut(&mut self) -> &mut DeviceIdentity {
        match self {
            Device::ControlGear(gear) => &mut gear.identity,
            Device::InputDevice(input) => &mut input.identity,
        }
    }

    pub fn space(&self) -> AddressSpace {
        match self {
            Device::ControlGear(_) => AddressSpace::ControlGear,
            Device::InputDevice(_) => AddressSpace::InputDevice,
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            space: self.space(),
            long: self.identity().long,
        }
    }

    pub fn as_gear(&self) -> Option<&ControlGear> {
        match self {
            Device::ControlGear(gear) => Some(gear),
            Device::InputDevice(_) => None,
        }
    }

    pub fn as_gear_mut(&mut self) -> Option<&mut ControlGear> {
        match self {
            Device::ControlGear(gear) => Some(gear),
            Device::InputDevice(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gear_defaults() {
        let gear = ControlGear::new(LongAddress::new(1).unwrap(), None);
        assert_eq!(gear.current_level, 0);
        assert_eq!(gear.last_level, 254);
        assert_eq!((gear.min_level, gear.max_level), (1, 254));
        assert!(gear.identity.available);
        assert!(!gear.identity.static_loaded);
    }

    #[test]
    fn test_apply_level_tracks_last_non_zero() {
        let mut gear = ControlGear::new(LongAddress::new(1).unwrap(), None);
        assert!(gear.apply_level(120));
        assert!(gear.apply_level(0));
        assert_eq!(gear.last_level, 120);
        assert!(!gear.apply_level(0));
        assert!(!gear.is_on());
    }

    #[test]
    fn test_device_key_by_space() {
        let long = LongAddress::new(0x42).unwrap();
        let gear = Device::new(AddressSpace::ControlGear, long, None);
        let input = Device::new(AddressSpace::InputDevice, long, None);
        assert_ne!(gear.key(), input.key());
        assert_eq!(input.key(), DeviceKey::input(long));
        assert!(input.as_gear().is_none());
    }
}
