//! Decoding of frames sent by other bus masters.
//!
//! Wall switches and other controllers talk to the gear directly; the
//! bridge watches their forward frames and either applies the level
//! they set or schedules a poll when the effect can't be known.

use crate::addressing::{ShortAddress, Target};
use crate::protocol::commands::{Command, Dt8, GO_TO_SCENE, MASK};
use crate::protocol::{Frame, FrameLength};

/// Effect of an observed command on its targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SniffedAction {
    /// Level is known from the frame itself
    SetLevel(u8),
    /// Level changed by an amount only the gear knows
    Resync,
}

/// A decoded control gear command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sniffed {
    pub target: Target,
    pub action: SniffedAction,
}

/// An input device event message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SniffedEvent {
    pub short: ShortAddress,
    pub instance: u8,
    /// 10-bit event information
    pub event: u16,
}

/// Decode a 16-bit control gear forward frame.
///
/// Special commands, queries and configuration commands return `None`.
pub fn interpret(frame: Frame) -> Option<Sniffed> {
    if frame.length() != FrameLength::Forward16 {
        return None;
    }
    let data = frame.data();
    let address = (data >> 8) as u8;
    let opcode = data as u8;
    let (target, command) = Target::from_address_byte(address)?;

    let action = if !command {
        // Direct arc power
        if opcode == MASK {
            return None;
        }
        SniffedAction::SetLevel(opcode)
    } else {
        command_action(opcode)?
    };
    Some(Sniffed { target, action })
}

fn command_action(opcode: u8) -> Option<SniffedAction> {
    const OFF: u8 = Command::Off as u8;
    const STEP_DOWN_AND_OFF: u8 = Command::StepDownAndOff as u8;
    const UP: u8 = Command::Up as u8;
    const GO_TO_LAST_ACTIVE: u8 = Command::GoToLastActiveLevel as u8;
    const ON_AND_STEP_UP: u8 = Command::OnAndStepUp as u8;
    const SCENE_FIRST: u8 = GO_TO_SCENE;
    const SCENE_LAST: u8 = GO_TO_SCENE + 0x0F;
    const ACTIVATE: u8 = Dt8::Activate as u8;

    match opcode {
        OFF | STEP_DOWN_AND_OFF => Some(SniffedAction::SetLevel(0)),
        UP..=ON_AND_STEP_UP | GO_TO_LAST_ACTIVE => Some(SniffedAction::Resync),
        SCENE_FIRST..=SCENE_LAST => Some(SniffedAction::Resync),
        ACTIVATE => Some(SniffedAction::Resync),
        _ => None,
    }
}

/// Decode a 24-bit event message sent by an input device.
///
/// Only short-address event frames are recognised: address byte
/// `0AAAAAA0`, then 5 bits of instance number and 10 bits of event
/// information.
pub fn interpret_event(frame: Frame) -> Option<SniffedEvent> {
    if frame.length() != FrameLength::Forward24 {
        return None;
    }
    let data = frame.data();
    let address = (data >> 16) as u8;
    if address & 0x81 != 0 {
        return None;
    }
    let payload = (data & 0xFFFF) as u16;
    Some(SniffedEvent {
        short: ShortAddress::from_masked(address >> 1),
        instance: ((payload >> 10) & 0x1F) as u8,
        event: payload & 0x03FF,
    })
}
