//! Simulated DALI bus for testing without hardware.
//!
//! [`MockBus`] implements [`BusTransport`] by interpreting every forward
//! frame against a set of simulated devices:
//!
//! - control gear ([`SimGear`]) with levels, DTRs, groups, scenes, memory
//!   bank 0 and optional DT8 colour support
//! - input devices with a device status and the commissioning state machine
//!
//! Both address spaces implement `INITIALISE` / `COMPARE` / `WITHDRAW`
//! semantics faithfully enough for the binary search to run unchanged.
//!
//! ## Example
//!
//! ```rust
//! use dali_bridge::adapter::mock_bus::{MockBus, SimGear};
//! use dali_bridge::addressing::LongAddress;
//!
//! let mut bus = MockBus::new();
//! bus.add_gear(SimGear::new(LongAddress::new(0x00_1234).unwrap()).with_short(0));
//! assert_eq!(bus.sent().count(), 0);
//! ```

use crate::adapter::BusTransport;
use crate::addressing::{AddressSpace, LongAddress, Target};
use crate::error::{DaliError, Result};
use crate::protocol::commands::{
    colour_selector, Command, Dt8, InputCommand, InputSpecial, Special, ADD_TO_GROUP,
    DEVICE_TYPE_COLOUR, GO_TO_SCENE, INITIALISE_ALL, INITIALISE_UNADDRESSED, INPUT_INITIALISE_ALL,
    INPUT_INITIALISE_UNADDRESSED, INPUT_SPECIAL, INSTANCE_DEVICE, MASK, QUERY_SCENE_LEVEL,
    REMOVE_FROM_GROUP, REMOVE_FROM_SCENE, SET_SCENE,
};
use crate::protocol::frame::{Frame, FrameLength};

const MAX_SIM_DEVICES: usize = 64;
const SENT_LOG_DEPTH: usize = 1024;
const YES: u8 = 0xFF;

/// Lamp arc power on
const STATUS_LAMP_ON: u8 = 0x04;
/// No short address assigned
const STATUS_MISSING_SHORT: u8 = 0x40;

/// Simulated control gear
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimGear {
    pub long: LongAddress,
    pub short: Option<u8>,
    pub level: u8,
    /// Status bits other than lamp-on and missing-short
    pub status: u8,
    pub device_type: u8,
    pub min_level: u8,
    pub max_level: u8,
    pub power_on_level: u8,
    pub system_failure_level: u8,
    pub groups: u16,
    /// Scene levels, `MASK` when not part of the scene
    pub scenes: [u8; 16],
    pub gtin: [u8; 6],
    /// DT8 colour type features, `None` for non-colour gear
    pub colour_features: Option<u8>,
    pub mirek: u16,
    pub rgb: (u8, u8, u8),
    /// Ignores every frame while `false`
    pub responsive: bool,
    /// Answer to `QUERY STATUS` as is, instead of deriving it
    pub reported_status: Option<u8>,
    dtr: [u8; 3],
    temp_mirek: Option<u16>,
    temp_rgb: Option<(u8, u8, u8)>,
    dt8_enabled: bool,
    selected: bool,
    withdrawn: bool,
}

impl SimGear {
    pub fn new(long: LongAddress) -> Self {
        Self {
            long,
            short: None,
            level: 0,
            status: 0,
            device_type: 6,
            min_level: 1,
            max_level: 254,
            power_on_level: 254,
            system_failure_level: 254,
            groups: 0,
            scenes: [MASK; 16],
            gtin: [0; 6],
            colour_features: None,
            mirek: 370,
            rgb: (0, 0, 0),
            responsive: true,
            reported_status: None,
            dtr: [0; 3],
            temp_mirek: None,
            temp_rgb: None,
            dt8_enabled: false,
            selected: false,
            withdrawn: false,
        }
    }

    #[must_use]
    pub fn with_short(mut self, short: u8) -> Self {
        self.short = Some(short);
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_gtin(mut self, gtin: [u8; 6]) -> Self {
        self.gtin = gtin;
        self
    }

    /// Turn the gear into DT8 colour gear with the given feature byte.
    #[must_use]
    pub fn with_colour(mut self, features: u8) -> Self {
        self.device_type = DEVICE_TYPE_COLOUR;
        self.colour_features = Some(features);
        self
    }

    /// Gear that reports a fixed status byte, like firmware that leaves the
    /// lamp bit clear.
    pub fn with_reported_status(mut self, status: u8) -> Self {
        self.reported_status = Some(status);
        self
    }

    fn status_byte(&self) -> u8 {
        if let Some(status) = self.reported_status {
            return status;
        }
        let mut status = self.status;
        if self.level > 0 {
            status |= STATUS_LAMP_ON;
        }
        if self.short.is_none() {
            status |= STATUS_MISSING_SHORT;
        }
        status
    }

    fn addressed_by(&self, target: Target) -> bool {
        match target {
            Target::Short(short) => self.short == Some(short.value()),
            Target::Group(group) => self.groups & group.mask_bit() != 0,
            Target::Broadcast => true,
        }
    }

    fn clamp(&self, level: u8) -> u8 {
        if level == 0 {
            0
        } else {
            level.clamp(self.min_level, self.max_level)
        }
    }

    fn memory(&self, bank: u8, offset: u8) -> Option<u8> {
        match (bank, offset) {
            // Last accessible location of bank 0
            (0, 0) => Some(0x0E),
            (0, 3..=8) => Some(self.gtin[usize::from(offset - 3)]),
            (0, 1..=0x0E) => Some(0),
            _ => None,
        }
    }

    /// Apply an addressed command; returns the answer for queries.
    fn execute(&mut self, opcode: u8) -> Option<u8> {
        if self.dt8_enabled {
            self.dt8_enabled = false;
            if opcode >= 0xE0 {
                return self.execute_colour(opcode);
            }
        }

        match opcode {
            0x00 => self.level = 0,
            0x01 | 0x03 => {
                if self.level > 0 && self.level < self.max_level {
                    self.level += 1;
                }
            }
            0x02 | 0x04 => {
                if self.level > self.min_level {
                    self.level -= 1;
                }
            }
            0x05 => self.level = self.max_level,
            0x06 => self.level = self.min_level,
            0x07 => {
                self.level = if self.level <= self.min_level { 0 } else { self.level - 1 };
            }
            0x08 => {
                self.level = if self.level == 0 {
                    self.min_level
                } else {
                    self.level.saturating_add(1).min(self.max_level)
                };
            }
            op if (GO_TO_SCENE..GO_TO_SCENE + 16).contains(&op) => {
                let level = self.scenes[usize::from(op - GO_TO_SCENE)];
                if level != MASK {
                    self.level = self.clamp(level);
                }
            }
            0x20 => {
                self.level = 254;
                self.groups = 0;
                self.scenes = [MASK; 16];
            }
            0x21 => self.dtr[0] = self.level,
            0x2A => self.max_level = self.dtr[0],
            0x2B => self.min_level = self.dtr[0],
            0x2C => self.system_failure_level = self.dtr[0],
            0x2D => self.power_on_level = self.dtr[0],
            op if (SET_SCENE..SET_SCENE + 16).contains(&op) => {
                self.scenes[usize::from(op - SET_SCENE)] = self.dtr[0];
            }
            op if (REMOVE_FROM_SCENE..REMOVE_FROM_SCENE + 16).contains(&op) => {
                self.scenes[usize::from(op - REMOVE_FROM_SCENE)] = MASK;
            }
            op if (ADD_TO_GROUP..ADD_TO_GROUP + 16).contains(&op) => {
                self.groups |= 1 << (op - ADD_TO_GROUP);
            }
            op if (REMOVE_FROM_GROUP..REMOVE_FROM_GROUP + 16).contains(&op) => {
                self.groups &= !(1 << (op - REMOVE_FROM_GROUP));
            }
            op if op == Command::QueryStatus as u8 => return Some(self.status_byte()),
            op if op == Command::QueryControlGearPresent as u8 => return Some(YES),
            op if op == Command::QueryContentDtr0 as u8 => return Some(self.dtr[0]),
            op if op == Command::QueryDeviceType as u8 => return Some(self.device_type),
            op if op == Command::QueryContentDtr1 as u8 => return Some(self.dtr[1]),
            op if op == Command::QueryActualLevel as u8 => return Some(self.level),
            op if op == Command::QueryMaxLevel as u8 => return Some(self.max_level),
            op if op == Command::QueryMinLevel as u8 => return Some(self.min_level),
            op if op == Command::QueryPowerOnLevel as u8 => return Some(self.power_on_level),
            op if op == Command::QuerySystemFailureLevel as u8 => {
                return Some(self.system_failure_level)
            }
            op if (QUERY_SCENE_LEVEL..QUERY_SCENE_LEVEL + 16).contains(&op) => {
                return Some(self.scenes[usize::from(op - QUERY_SCENE_LEVEL)]);
            }
            op if op == Command::QueryGroups0To7 as u8 => return Some(self.groups as u8),
            op if op == Command::QueryGroups8To15 as u8 => return Some((self.groups >> 8) as u8),
            op if op == Command::QueryRandomAddressH as u8 => return Some(self.long.bytes()[0]),
            op if op == Command::QueryRandomAddressM as u8 => return Some(self.long.bytes()[1]),
            op if op == Command::QueryRandomAddressL as u8 => return Some(self.long.bytes()[2]),
            op if op == Command::ReadMemoryLocation as u8 => {
                let value = self.memory(self.dtr[1], self.dtr[0]);
                self.dtr[0] = self.dtr[0].wrapping_add(1);
                return value;
            }
            _ => {}
        }
        None
    }

    fn execute_colour(&mut self, opcode: u8) -> Option<u8> {
        let features = self.colour_features?;
        match opcode {
            op if op == Dt8::SetTemporaryColourTemperature as u8 => {
                self.temp_mirek = Some(u16::from_be_bytes([self.dtr[1], self.dtr[0]]));
            }
            op if op == Dt8::SetTemporaryRgbDimLevel as u8 => {
                self.temp_rgb = Some((self.dtr[0], self.dtr[1], self.dtr[2]));
            }
            op if op == Dt8::Activate as u8 => {
                if let Some(mirek) = self.temp_mirek.take() {
                    self.mirek = mirek;
                }
                if let Some(rgb) = self.temp_rgb.take() {
                    self.rgb = rgb;
                }
            }
            op if op == Dt8::QueryColourStatus as u8 => return Some(0),
            op if op == Dt8::QueryColourTypeFeatures as u8 => return Some(features),
            op if op == Dt8::QueryColourValue as u8 => {
                return match self.dtr[0] {
                    colour_selector::COLOUR_TEMPERATURE => {
                        let [msb, lsb] = self.mirek.to_be_bytes();
                        self.dtr[0] = lsb;
                        Some(msb)
                    }
                    colour_selector::RED => Some(self.rgb.0),
                    colour_selector::GREEN => Some(self.rgb.1),
                    colour_selector::BLUE => Some(self.rgb.2),
                    _ => Some(MASK),
                };
            }
            _ => {}
        }
        None
    }
}

/// Simulated IEC 62386-103 control device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInput {
    pub long: LongAddress,
    pub short: Option<u8>,
    pub status: u8,
    pub responsive: bool,
    selected: bool,
    withdrawn: bool,
}

impl SimInput {
    pub fn new(long: LongAddress) -> Self {
        Self {
            long,
            short: None,
            status: 0,
            responsive: true,
            selected: false,
            withdrawn: false,
        }
    }
}

/// Commissioning state shared by the devices of one address space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SearchState {
    address: u32,
}

impl SearchState {
    fn set_byte(&mut self, shift: u32, value: u8) {
        self.address = (self.address & !(0xFF << shift)) | (u32::from(value) << shift);
    }
}

/// Simulated bus with control gear and input devices
#[derive(Debug, Default)]
pub struct MockBus {
    gear: heapless::Vec<SimGear, MAX_SIM_DEVICES>,
    inputs: heapless::Vec<SimInput, MAX_SIM_DEVICES>,
    gear_search: SearchState,
    input_search: SearchState,
    sent: heapless::Deque<Frame, SENT_LOG_DEPTH>,
    failures: usize,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_gear(&mut self, gear: SimGear) {
        if self.gear.push(gear).is_err() {
            dali_log!(warn, "MockBus: control gear table full");
        }
    }

    pub fn add_input(&mut self, long: LongAddress, short: Option<u8>) {
        let mut input = SimInput::new(long);
        input.short = short;
        if self.inputs.push(input).is_err() {
            dali_log!(warn, "MockBus: input device table full");
        }
    }

    pub fn gear(&self, long: LongAddress) -> Option<&SimGear> {
        self.gear.iter().find(|g| g.long == long)
    }

    pub fn gear_mut(&mut self, long: LongAddress) -> Option<&mut SimGear> {
        self.gear.iter_mut().find(|g| g.long == long)
    }

    pub fn gear_by_short(&self, short: u8) -> Option<&SimGear> {
        self.gear.iter().find(|g| g.short == Some(short))
    }

    pub fn input(&self, long: LongAddress) -> Option<&SimInput> {
        self.inputs.iter().find(|i| i.long == long)
    }

    pub fn input_mut(&mut self, long: LongAddress) -> Option<&mut SimInput> {
        self.inputs.iter_mut().find(|i| i.long == long)
    }

    pub fn device_count(&self, space: AddressSpace) -> usize {
        match space {
            AddressSpace::ControlGear => self.gear.len(),
            AddressSpace::InputDevice => self.inputs.len(),
        }
    }

    /// Frames transmitted so far, oldest first (bounded log).
    pub fn sent(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.sent.iter()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Fail the next `count` transmissions with a collision error.
    pub fn inject_failures(&mut self, count: usize) {
        self.failures = count;
    }

    fn log(&mut self, frame: Frame) {
        if self.sent.is_full() {
            self.sent.pop_front();
        }
        // Room was made above
        let _ = self.sent.push_back(frame);
    }

    fn dispatch(&mut self, frame: Frame) -> Option<u8> {
        let bytes = frame.bytes();
        match (frame.length(), bytes.as_slice()) {
            (FrameLength::Forward16, &[address, opcode]) => self.dispatch_gear(address, opcode),
            (FrameLength::Forward24, &[INPUT_SPECIAL, opcode, data]) => self.input_special(opcode, data),
            (FrameLength::Forward24, &[address, INSTANCE_DEVICE, opcode]) => {
                self.input_command(address, opcode)
            }
            _ => None,
        }
    }

    fn dispatch_gear(&mut self, address: u8, opcode: u8) -> Option<u8> {
        if let Some((target, command)) = Target::from_address_byte(address) {
            let mut answer = None;
            for gear in self.gear.iter_mut().filter(|g| g.responsive) {
                if !gear.addressed_by(target) {
                    // Enable device type only covers the next command on the bus
                    gear.dt8_enabled = false;
                    continue;
                }
                let reply = if command {
                    gear.execute(opcode)
                } else {
                    gear.dt8_enabled = false;
                    if opcode != MASK {
                        gear.level = gear.clamp(opcode);
                    }
                    None
                };
                answer = answer.or(reply);
            }
            return answer;
        }
        self.gear_special(address, opcode)
    }

    fn gear_special(&mut self, address: u8, data: u8) -> Option<u8> {
        let search = self.gear_search.address;
        let mut answer = None;
        let gear = self.gear.iter_mut().filter(|g| g.responsive);

        match address {
            a if a == Special::Terminate as u8 => gear.for_each(|g| g.selected = false),
            a if a == Special::Dtr0 as u8 => gear.for_each(|g| g.dtr[0] = data),
            a if a == Special::Dtr1 as u8 => gear.for_each(|g| g.dtr[1] = data),
            a if a == Special::Dtr2 as u8 => gear.for_each(|g| g.dtr[2] = data),
            a if a == Special::EnableDeviceType as u8 => {
                gear.for_each(|g| g.dt8_enabled = data == DEVICE_TYPE_COLOUR);
            }
            a if a == Special::Initialise as u8 => {
                for g in gear {
                    let selected = match data {
                        INITIALISE_ALL => true,
                        INITIALISE_UNADDRESSED => g.short.is_none(),
                        d => g.short == Some(d >> 1),
                    };
                    if selected {
                        g.selected = true;
                        g.withdrawn = false;
                    }
                }
            }
            a if a == Special::SearchAddrH as u8 => self.gear_search.set_byte(16, data),
            a if a == Special::SearchAddrM as u8 => self.gear_search.set_byte(8, data),
            a if a == Special::SearchAddrL as u8 => self.gear_search.set_byte(0, data),
            a if a == Special::Compare as u8 => {
                if gear.into_iter().any(|g| g.selected && !g.withdrawn && g.long.raw() <= search) {
                    answer = Some(YES);
                }
            }
            a if a == Special::Withdraw as u8 => {
                gear.filter(|g| g.selected && g.long.raw() == search)
                    .for_each(|g| g.withdrawn = true);
            }
            a if a == Special::ProgramShortAddress as u8 => {
                gear.filter(|g| g.selected && g.long.raw() == search)
                    .for_each(|g| g.short = (data != MASK).then_some(data >> 1));
            }
            a if a == Special::VerifyShortAddress as u8 => {
                if gear.into_iter().any(|g| g.selected && g.short == Some(data >> 1)) {
                    answer = Some(YES);
                }
            }
            a if a == Special::QueryShortAddress as u8 => {
                answer = gear
                    .into_iter()
                    .find(|g| g.selected && !g.withdrawn && g.long.raw() == search)
                    .map(|g| g.short.map_or(MASK, |s| (s << 1) | 1));
            }
            _ => {}
        }
        answer
    }

    fn input_special(&mut self, opcode: u8, data: u8) -> Option<u8> {
        let search = self.input_search.address;
        let inputs = self.inputs.iter_mut().filter(|i| i.responsive);

        match opcode {
            op if op == InputSpecial::Terminate as u8 => inputs.for_each(|i| i.selected = false),
            op if op == InputSpecial::Initialise as u8 => {
                for i in inputs {
                    let selected = match data {
                        INPUT_INITIALISE_ALL => true,
                        INPUT_INITIALISE_UNADDRESSED => i.short.is_none(),
                        d => i.short == Some(d),
                    };
                    if selected {
                        i.selected = true;
                        i.withdrawn = false;
                    }
                }
            }
            op if op == InputSpecial::SearchAddrH as u8 => self.input_search.set_byte(16, data),
            op if op == InputSpecial::SearchAddrM as u8 => self.input_search.set_byte(8, data),
            op if op == InputSpecial::SearchAddrL as u8 => self.input_search.set_byte(0, data),
            op if op == InputSpecial::Compare as u8 => {
                let mut inputs = inputs;
                return inputs
                    .any(|i| i.selected && !i.withdrawn && i.long.raw() <= search)
                    .then_some(YES);
            }
            op if op == InputSpecial::Withdraw as u8 => {
                inputs
                    .filter(|i| i.selected && i.long.raw() == search)
                    .for_each(|i| i.withdrawn = true);
            }
            op if op == InputSpecial::ProgramShortAddress as u8 => {
                inputs
                    .filter(|i| i.selected && i.long.raw() == search)
                    .for_each(|i| i.short = (data != MASK).then_some(data));
            }
            op if op == InputSpecial::VerifyShortAddress as u8 => {
                let mut inputs = inputs;
                return inputs.any(|i| i.selected && i.short == Some(data)).then_some(YES);
            }
            _ => {}
        }
        None
    }

    fn input_command(&mut self, address: u8, opcode: u8) -> Option<u8> {
        let Some((Target::Short(short), true)) = Target::from_address_byte(address) else {
            return None;
        };
        let input = self
            .inputs
            .iter()
            .find(|i| i.responsive && i.short == Some(short.value()))?;
        match opcode {
            op if op == InputCommand::QueryDeviceStatus as u8 => {
                Some(input.status | if input.short.is_none() { STATUS_MISSING_SHORT } else { 0 })
            }
            op if op == InputCommand::QueryRandomAddressH as u8 => Some(input.long.bytes()[0]),
            op if op == InputCommand::QueryRandomAddressM as u8 => Some(input.long.bytes()[1]),
            op if op == InputCommand::QueryRandomAddressL as u8 => Some(input.long.bytes()[2]),
            _ => None,
        }
    }

    fn transmit(&mut self, frame: Frame) -> Result<Option<u8>> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(DaliError::collision());
        }
        self.log(frame);
        Ok(self.dispatch(frame))
    }
}

impl BusTransport for MockBus {
    async fn send_raw(&mut self, frame: Frame) -> Result<()> {
        self.transmit(frame).map(|_| ())
    }

    async fn send_query(&mut self, frame: Frame) -> Result<Option<u8>> {
        self.transmit(frame)
    }
}
