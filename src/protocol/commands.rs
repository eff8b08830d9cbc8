//! DALI command opcodes.
//!
//! - [`Command`]: IEC 62386-102 control gear commands (second byte of an
//!   addressed 16-bit frame)
//! - [`Special`]: special commands, encoded in the first byte
//! - [`Dt8`]: IEC 62386-209 colour extensions, preceded by
//!   `ENABLE DEVICE TYPE 8`
//! - [`InputCommand`] / [`InputSpecial`]: IEC 62386-103 control device
//!   commands in the 24-bit frame space

/// Control gear commands and queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Off = 0x00,
    Up = 0x01,
    Down = 0x02,
    StepUp = 0x03,
    StepDown = 0x04,
    RecallMaxLevel = 0x05,
    RecallMinLevel = 0x06,
    StepDownAndOff = 0x07,
    OnAndStepUp = 0x08,
    GoToLastActiveLevel = 0x0A,
    Reset = 0x20,
    StoreActualLevelInDtr0 = 0x21,
    SetMaxLevel = 0x2A,
    SetMinLevel = 0x2B,
    SetSystemFailureLevel = 0x2C,
    SetPowerOnLevel = 0x2D,
    QueryStatus = 0x90,
    QueryControlGearPresent = 0x91,
    QueryLampFailure = 0x92,
    QueryContentDtr0 = 0x98,
    QueryDeviceType = 0x99,
    QueryContentDtr1 = 0x9C,
    QueryActualLevel = 0xA0,
    QueryMaxLevel = 0xA1,
    QueryMinLevel = 0xA2,
    QueryPowerOnLevel = 0xA3,
    QuerySystemFailureLevel = 0xA4,
    QueryGroups0To7 = 0xC0,
    QueryGroups8To15 = 0xC1,
    QueryRandomAddressH = 0xC2,
    QueryRandomAddressM = 0xC3,
    QueryRandomAddressL = 0xC4,
    ReadMemoryLocation = 0xC5,
}

impl Command {
    /// Configuration commands must be received twice within 100 ms.
    pub const fn needs_repeat(self) -> bool {
        matches!(
            self,
            Command::Reset
                | Command::StoreActualLevelInDtr0
                | Command::SetMaxLevel
                | Command::SetMinLevel
                | Command::SetSystemFailureLevel
                | Command::SetPowerOnLevel
        )
    }
}

/// Opcode base for `GO TO SCENE n`
pub const GO_TO_SCENE: u8 = 0x10;
/// Opcode base for `SET SCENE n` (stores DTR0 as scene level)
pub const SET_SCENE: u8 = 0x40;
/// Opcode base for `REMOVE FROM SCENE n`
pub const REMOVE_FROM_SCENE: u8 = 0x50;
/// Opcode base for `ADD TO GROUP g`
pub const ADD_TO_GROUP: u8 = 0x60;
/// Opcode base for `REMOVE FROM GROUP g`
pub const REMOVE_FROM_GROUP: u8 = 0x70;
/// Opcode base for `QUERY SCENE LEVEL n`
pub const QUERY_SCENE_LEVEL: u8 = 0xB0;

/// Level value meaning "no change" / "unknown"
pub const MASK: u8 = 0xFF;

/// Special commands (first byte, data in second byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Special {
    Terminate = 0xA1,
    Dtr0 = 0xA3,
    Initialise = 0xA5,
    Randomise = 0xA7,
    Compare = 0xA9,
    Withdraw = 0xAB,
    Ping = 0xAD,
    SearchAddrH = 0xB1,
    SearchAddrM = 0xB3,
    SearchAddrL = 0xB5,
    ProgramShortAddress = 0xB7,
    VerifyShortAddress = 0xB9,
    QueryShortAddress = 0xBB,
    EnableDeviceType = 0xC1,
    Dtr1 = 0xC3,
    Dtr2 = 0xC5,
}

/// Argument of `INITIALISE`: every device
pub const INITIALISE_ALL: u8 = 0x00;
/// Argument of `INITIALISE`: only devices without a short address
pub const INITIALISE_UNADDRESSED: u8 = 0xFF;
/// Control device `INITIALISE` argument: every device
pub const INPUT_INITIALISE_ALL: u8 = 0xFF;
/// Control device `INITIALISE` argument: only devices without a short address
pub const INPUT_INITIALISE_UNADDRESSED: u8 = 0x7F;

/// Device type code of colour control gear
pub const DEVICE_TYPE_COLOUR: u8 = 8;

/// IEC 62386-209 colour commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Dt8 {
    Activate = 0xE2,
    SetTemporaryColourTemperature = 0xE7,
    SetTemporaryRgbDimLevel = 0xEB,
    QueryColourStatus = 0xF8,
    QueryColourTypeFeatures = 0xF9,
    QueryColourValue = 0xFA,
}

/// `QUERY COLOUR VALUE` selectors written to DTR0
pub mod colour_selector {
    pub const COLOUR_TEMPERATURE: u8 = 2;
    pub const RED: u8 = 9;
    pub const GREEN: u8 = 10;
    pub const BLUE: u8 = 11;
    pub const COOLEST_TEMPERATURE: u8 = 128;
    pub const WARMEST_TEMPERATURE: u8 = 130;
}

/// Colour type features: tunable white capable
pub const FEATURE_TC: u8 = 0x02;
/// Colour type features: number of RGBWAF channels
pub const FEATURE_RGBWAF_MASK: u8 = 0xE0;

/// Instance byte addressing the control device itself
pub const INSTANCE_DEVICE: u8 = 0xFE;
/// First byte of a control device special command
pub const INPUT_SPECIAL: u8 = 0xC1;

/// Control device instructions (third byte, instance byte `0xFE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum InputCommand {
    Identify = 0x00,
    ResetPowerCycleSeen = 0x01,
    QueryDeviceStatus = 0x30,
    QueryRandomAddressH = 0x42,
    QueryRandomAddressM = 0x43,
    QueryRandomAddressL = 0x44,
}

/// Control device special commands (`0xC1, opcode, data`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum InputSpecial {
    Terminate = 0x00,
    Initialise = 0x01,
    Randomise = 0x02,
    Compare = 0x03,
    Withdraw = 0x04,
    SearchAddrH = 0x05,
    SearchAddrM = 0x06,
    SearchAddrL = 0x07,
    ProgramShortAddress = 0x08,
    VerifyShortAddress = 0x09,
}

/// Commissioning operations as they map onto each address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AddressingOp {
    Terminate,
    Initialise,
    Randomise,
    Compare,
    Withdraw,
    SearchH,
    SearchM,
    SearchL,
    ProgramShort,
    VerifyShort,
}

impl AddressingOp {
    pub(crate) const fn gear(self) -> Special {
        match self {
            AddressingOp::Terminate => Special::Terminate,
            AddressingOp::Initialise => Special::Initialise,
            AddressingOp::Randomise => Special::Randomise,
            AddressingOp::Compare => Special::Compare,
            AddressingOp::Withdraw => Special::Withdraw,
            AddressingOp::SearchH => Special::SearchAddrH,
            AddressingOp::SearchM => Special::SearchAddrM,
            AddressingOp::SearchL => Special::SearchAddrL,
            AddressingOp::ProgramShort => Special::ProgramShortAddress,
            AddressingOp::VerifyShort => Special::VerifyShortAddress,
        }
    }

    pub(crate) const fn input(self) -> InputSpecial {
        match self {
            AddressingOp::Terminate => InputSpecial::Terminate,
            AddressingOp::Initialise => InputSpecial::Initialise,
            AddressingOp::Randomise => InputSpecial::Randomise,
            AddressingOp::Compare => InputSpecial::Compare,
            AddressingOp::Withdraw => InputSpecial::Withdraw,
            AddressingOp::SearchH => InputSpecial::SearchAddrH,
            AddressingOp::SearchM => InputSpecial::SearchAddrM,
            AddressingOp::SearchL => InputSpecial::SearchAddrL,
            AddressingOp::ProgramShort => InputSpecial::ProgramShortAddress,
            AddressingOp::VerifyShort => InputSpecial::VerifyShortAddress,
        }
    }
}
