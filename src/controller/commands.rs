//! Inbound commands from the messaging side.

use crate::addressing::{GroupId, LongAddress, SceneId, ShortAddress};
use crate::commissioning::InitialiseScope;
use crate::protocol::Frame;

/// Devices with a stored level in one `SaveScene` command
pub const MAX_SCENE_ENTRIES: usize = 64;

/// Recipient of a lighting command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandTarget {
    /// One control gear, by its stable identity
    Device(LongAddress),
    Group(GroupId),
    Broadcast,
}

/// Command accepted by [`Controller::handle_command`]
///
/// [`Controller::handle_command`]: super::Controller::handle_command
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeCommand {
    SetLevel {
        target: CommandTarget,
        level: u8,
    },
    /// Restore the last non-zero level
    On {
        target: CommandTarget,
    },
    Off {
        target: CommandTarget,
    },
    SetColourTemperature {
        target: CommandTarget,
        mirek: u16,
    },
    SetRgb {
        target: CommandTarget,
        red: u8,
        green: u8,
        blue: u8,
    },
    GroupMembership {
        long: LongAddress,
        group: GroupId,
        member: bool,
    },
    /// Replace the complete membership mask of one device
    SetGroups {
        long: LongAddress,
        mask: u16,
    },
    ActivateScene {
        target: CommandTarget,
        scene: SceneId,
    },
    SaveScene {
        scene: SceneId,
        levels: heapless::Vec<(LongAddress, u8), MAX_SCENE_ENTRIES>,
    },
    /// Put a frame on the bus as is; `query` waits for a backward frame
    SendRaw {
        frame: Frame,
        query: bool,
    },
    /// Rediscover devices without changing any address
    Scan,
    Initialize {
        scope: InitialiseScope,
    },
    /// Poll one short address (or every known device) as soon as possible
    Sync {
        short: Option<ShortAddress>,
    },
}
