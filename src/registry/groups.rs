//! Group membership and aggregated group state.

use crate::addressing::short::GROUP_COUNT;
use crate::addressing::{GroupId, LongAddress};
use crate::device::{ColourSnapshot, LEVEL_UNKNOWN};
use crate::error::{DaliError, Result};

/// Devices with a membership entry
pub const MAX_ASSIGNMENTS: usize = 64;

/// Level change applied by one group step command
pub const GROUP_STEP: u8 = 10;

/// Membership mask per device (bit n = group n)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupAssignments {
    masks: heapless::index_map::FnvIndexMap<LongAddress, u16, MAX_ASSIGNMENTS>,
}

impl GroupAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership mask of `long`, zero when unknown.
    pub fn get(&self, long: LongAddress) -> u16 {
        self.masks.get(&long).copied().unwrap_or(0)
    }

    /// Replace the mask of `long`; a zero mask removes the entry.
    ///
    /// Returns whether anything changed.
    pub fn set(&mut self, long: LongAddress, mask: u16) -> Result<bool> {
        if mask == 0 {
            return Ok(self.masks.remove(&long).is_some());
        }
        match self.masks.insert(long, mask) {
            Ok(previous) => Ok(previous != Some(mask)),
            Err(_) => Err(DaliError::buffer_too_small()),
        }
    }

    pub fn update(&mut self, long: LongAddress, group: GroupId, member: bool) -> Result<bool> {
        let mask = self.get(long);
        let mask = if member {
            mask | group.mask_bit()
        } else {
            mask & !group.mask_bit()
        };
        self.set(long, mask)
    }

    pub fn remove(&mut self, long: LongAddress) {
        self.masks.remove(&long);
    }

    pub fn is_member(&self, long: LongAddress, group: GroupId) -> bool {
        self.get(long) & group.mask_bit() != 0
    }

    pub fn members(&self, group: GroupId) -> impl Iterator<Item = LongAddress> + '_ {
        self.masks
            .iter()
            .filter(move |(_, mask)| **mask & group.mask_bit() != 0)
            .map(|(long, _)| *long)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LongAddress, u16)> + '_ {
        self.masks.iter().map(|(long, mask)| (*long, *mask))
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// Membership changes needed to go from one mask to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDiff {
    pub added: u16,
    pub removed: u16,
}

impl GroupDiff {
    pub const fn between(current: u16, wanted: u16) -> Self {
        Self {
            added: wanted & !current,
            removed: current & !wanted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }

    /// `(group, member)` pairs, additions first.
    pub fn changes(self) -> impl Iterator<Item = (GroupId, bool)> {
        let added = GroupId::all().filter(move |g| self.added & g.mask_bit() != 0).map(|g| (g, true));
        let removed = GroupId::all()
            .filter(move |g| self.removed & g.mask_bit() != 0)
            .map(|g| (g, false));
        added.chain(removed)
    }
}

/// Aggregated state of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupState {
    pub id: GroupId,
    pub current_level: u8,
    /// Last non-zero level, restored by `On`
    pub last_level: u8,
    pub mirek: Option<u16>,
    pub rgb: Option<(u8, u8, u8)>,
}

impl GroupState {
    pub const fn new(id: GroupId) -> Self {
        Self {
            id,
            current_level: 0,
            last_level: 254,
            mirek: None,
            rgb: None,
        }
    }

    /// Record a level; returns `true` when it changed.
    pub fn apply_level(&mut self, level: u8) -> bool {
        if level > 0 && level != LEVEL_UNKNOWN {
            self.last_level = level;
        }
        let changed = self.current_level != level;
        self.current_level = level;
        changed
    }

    /// Record aggregated colour values; returns `true` when either channel
    /// changed.
    pub fn apply_colour(&mut self, mirek: Consensus<u16>, rgb: Consensus<(u8, u8, u8)>) -> bool {
        let before = (self.mirek, self.rgb);
        mirek.apply(&mut self.mirek);
        rgb.apply(&mut self.rgb);
        before != (self.mirek, self.rgb)
    }

    pub fn colour(&self) -> Option<ColourSnapshot> {
        (self.mirek.is_some() || self.rgb.is_some()).then_some(ColourSnapshot {
            mirek: self.mirek,
            rgb: self.rgb,
        })
    }
}

/// Initial state of all 16 groups.
pub fn initial_group_states() -> [GroupState; GROUP_COUNT as usize] {
    core::array::from_fn(|n| GroupState::new(GroupId::from_masked(n as u8)))
}

/// Group level from member levels: the brightest member wins.
///
/// Members with an unknown level are ignored; `None` if no member has a
/// known level.
pub fn aggregate_level(levels: impl IntoIterator<Item = u8>) -> Option<u8> {
    levels.into_iter().filter(|level| *level != LEVEL_UNKNOWN).max()
}

/// Aggregate of one colour channel over the members that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consensus<T> {
    /// No member supports the channel; the group keeps its value
    Absent,
    Agreed(T),
    /// Members disagree, or one has not reported yet
    Mixed,
}

impl<T> Consensus<T> {
    fn apply(self, slot: &mut Option<T>) {
        match self {
            Consensus::Absent => {}
            Consensus::Agreed(value) => *slot = Some(value),
            Consensus::Mixed => *slot = None,
        }
    }
}

/// Colour channel values of the capable members, reduced to a [`Consensus`].
pub fn aggregate_channel<T: Copy + PartialEq>(values: impl IntoIterator<Item = Option<T>>) -> Consensus<T> {
    let mut values = values.into_iter();
    let Some(first) = values.next() else {
        return Consensus::Absent;
    };
    match values.try_fold(first, |common, value| (value == common).then_some(common)) {
        Some(Some(common)) => Consensus::Agreed(common),
        _ => Consensus::Mixed,
    }
}

/// Level after one step up or down, kept within `1..=254`.
pub fn step_level(current: u8, up: bool) -> u8 {
    let stepped = if up {
        current.saturating_add(GROUP_STEP)
    } else {
        current.saturating_sub(GROUP_STEP)
    };
    stepped.clamp(1, 254)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(raw: u32) -> LongAddress {
        LongAddress::new(raw).unwrap()
    }

    fn group(n: u8) -> GroupId {
        GroupId::new(n).unwrap()
    }

    #[test]
    fn test_membership_updates() {
        let mut groups = GroupAssignments::new();
        assert!(groups.update(long(1), group(3), true).unwrap());
        assert!(!groups.update(long(1), group(3), true).unwrap());
        assert!(groups.update(long(2), group(3), true).unwrap());
        assert_eq!(groups.members(group(3)).count(), 2);

        assert!(groups.update(long(1), group(3), false).unwrap());
        // Empty masks are not kept
        assert_eq!(groups.len(), 1);
        assert!(!groups.is_member(long(1), group(3)));
    }

    #[test]
    fn test_diff_changes() {
        let diff = GroupDiff::between(0b0110, 0b0011);
        assert_eq!(diff.added, 0b0001);
        assert_eq!(diff.removed, 0b0100);
        let changes: std::vec::Vec<(u8, bool)> = diff.changes().map(|(g, m)| (g.value(), m)).collect();
        assert_eq!(changes, [(0, true), (2, false)]);
        assert!(GroupDiff::between(0xFF, 0xFF).is_empty());
    }

    #[test]
    fn test_aggregate_ignores_unknown() {
        assert_eq!(aggregate_level([0, 120, LEVEL_UNKNOWN, 80]), Some(120));
        assert_eq!(aggregate_level([LEVEL_UNKNOWN]), None);
        assert_eq!(aggregate_level([]), None);
    }

    #[test]
    fn test_group_state_last_level() {
        let mut state = GroupState::new(group(0));
        assert!(state.apply_level(90));
        assert!(state.apply_level(0));
        assert_eq!(state.last_level, 90);
        assert!(state.colour().is_none());
    }

    #[test]
    fn test_aggregate_channel_needs_agreement() {
        assert_eq!(aggregate_channel::<u16>([]), Consensus::Absent);
        assert_eq!(aggregate_channel([Some(300), Some(300)]), Consensus::Agreed(300));
        assert_eq!(aggregate_channel([Some(300), Some(250)]), Consensus::Mixed);
        assert_eq!(aggregate_channel([None, None::<u16>]), Consensus::Mixed);
    }

    #[test]
    fn test_group_colour_untouched_without_capable_members() {
        let mut state = GroupState::new(group(1));
        state.mirek = Some(200);
        assert!(!state.apply_colour(Consensus::Absent, Consensus::Absent));
        assert_eq!(state.mirek, Some(200));
        assert!(state.apply_colour(Consensus::Mixed, Consensus::Agreed((1, 2, 3))));
        assert_eq!(state.mirek, None);
        assert_eq!(state.rgb, Some((1, 2, 3)));
    }

    #[test]
    fn test_step_level_clamps() {
        assert_eq!(step_level(250, true), 254);
        assert_eq!(step_level(5, false), 1);
        assert_eq!(step_level(100, true), 110);
        assert_eq!(step_level(0, true), 10);
    }
}
