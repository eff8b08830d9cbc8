//! Device registry.
//!
//! Holds every known device, the short address indices of both address
//! spaces, group membership and aggregated group state, and the polling
//! scheduler. All of it sits behind one blocking mutex that is only held
//! for in-memory work; bus I/O always happens outside of it.
//!
//! State changes are published as [`Notification`]s on a bounded queue
//! consumed by the messaging side. When the queue is full the newest
//! notification is dropped with a warning: the next poll publishes the
//! state again.

pub mod groups;
pub mod scheduler;
pub mod sniffer;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};

use crate::addressing::short::{GROUP_COUNT, SHORT_ADDRESS_COUNT};
use crate::addressing::{AddressSpace, GroupId, LongAddress, ShortAddress, Target};
use crate::device::{ColorState, ColourSnapshot, ControlGear, Device, DeviceKey};
use crate::error::{DaliError, Result};

pub use groups::{Consensus, GroupAssignments, GroupDiff, GroupState};
pub use scheduler::{PollStep, Scheduler};
pub use sniffer::{Sniffed, SniffedAction, SniffedEvent};

/// Maximum number of devices over both address spaces
pub const DEVICE_CAPACITY: usize = 128;
/// Depth of the outbound notification queue
pub const NOTIFICATION_QUEUE_DEPTH: usize = 32;
/// Spacing of staggered polls after a relative command
pub const RESYNC_STAGGER_MS: u64 = 5;

const SHORTS: usize = SHORT_ADDRESS_COUNT as usize;

/// State change published to the messaging collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Notification {
    DeviceState {
        long: LongAddress,
        space: AddressSpace,
        /// Arc power level, `None` for input devices
        level: Option<u8>,
        status: Option<u8>,
        colour: Option<ColourSnapshot>,
    },
    Availability {
        long: LongAddress,
        space: AddressSpace,
        available: bool,
    },
    GroupState {
        group: GroupId,
        level: u8,
        colour: Option<ColourSnapshot>,
    },
    DiscoveryComplete {
        control_gear: usize,
        input_devices: usize,
    },
    CommissioningComplete {
        space: AddressSpace,
        assigned: usize,
    },
    InputEvent {
        long: LongAddress,
        instance: u8,
        event: u16,
    },
}

impl Notification {
    /// Current state of a control gear.
    pub fn gear_state(gear: &ControlGear) -> Self {
        Notification::DeviceState {
            long: gear.identity.long,
            space: AddressSpace::ControlGear,
            level: Some(gear.current_level),
            status: gear.status,
            colour: gear.colour.map(|colour| colour.snapshot()),
        }
    }
}

/// Registry contents, accessed through [`Registry::with`]
#[derive(Debug)]
pub struct RegistryState {
    devices: heapless::index_map::FnvIndexMap<DeviceKey, Device, DEVICE_CAPACITY>,
    gear_index: [Option<LongAddress>; SHORTS],
    input_index: [Option<LongAddress>; SHORTS],
    groups: GroupAssignments,
    group_states: [GroupState; GROUP_COUNT as usize],
    scheduler: Scheduler,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    pub fn new() -> Self {
        Self {
            devices: heapless::index_map::FnvIndexMap::new(),
            gear_index: [None; SHORTS],
            input_index: [None; SHORTS],
            groups: GroupAssignments::new(),
            group_states: groups::initial_group_states(),
            scheduler: Scheduler::new(),
        }
    }

    fn index(&self, space: AddressSpace) -> &[Option<LongAddress>; SHORTS] {
        match space {
            AddressSpace::ControlGear => &self.gear_index,
            AddressSpace::InputDevice => &self.input_index,
        }
    }

    /// Rebuild both short address indices from the device table.
    ///
    /// A short address claimed by two devices of the same space keeps the
    /// first one.
    pub fn rebuild_indices(&mut self) {
        self.gear_index = [None; SHORTS];
        self.input_index = [None; SHORTS];
        for (key, device) in self.devices.iter() {
            let Some(short) = device.identity().short else {
                continue;
            };
            let slot = match key.space {
                AddressSpace::ControlGear => &mut self.gear_index[short.value() as usize],
                AddressSpace::InputDevice => &mut self.input_index[short.value() as usize],
            };
            if let Some(existing) = slot {
                dali_log!(
                    warn,
                    "Short address {} claimed by {} and {}",
                    short.value(),
                    existing.raw(),
                    key.long.raw()
                );
                continue;
            }
            *slot = Some(key.long);
        }
    }

    pub fn device(&self, key: DeviceKey) -> Option<&Device> {
        self.devices.get(&key)
    }

    pub fn device_mut(&mut self, key: DeviceKey) -> Option<&mut Device> {
        self.devices.get_mut(&key)
    }

    pub fn long_at(&self, space: AddressSpace, short: ShortAddress) -> Option<LongAddress> {
        self.index(space)[short.value() as usize]
    }

    pub fn device_at(&self, space: AddressSpace, short: ShortAddress) -> Option<&Device> {
        let long = self.long_at(space, short)?;
        self.devices.get(&DeviceKey { space, long })
    }

    pub fn device_at_mut(&mut self, space: AddressSpace, short: ShortAddress) -> Option<&mut Device> {
        let long = self.long_at(space, short)?;
        self.devices.get_mut(&DeviceKey { space, long })
    }

    pub fn gear_at_mut(&mut self, short: ShortAddress) -> Option<&mut ControlGear> {
        self.device_at_mut(AddressSpace::ControlGear, short)?.as_gear_mut()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of devices in `space`.
    pub fn count(&self, space: AddressSpace) -> usize {
        self.devices.keys().filter(|key| key.space == space).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Mask of short addresses in use in `space` (bit n = short n).
    pub fn occupied(&self, space: AddressSpace) -> u64 {
        self.index(space)
            .iter()
            .enumerate()
            .filter(|(_, long)| long.is_some())
            .fold(0, |mask, (n, _)| mask | (1u64 << n))
    }

    /// Insert a device, or update the short address of a known one.
    ///
    /// Indices are not rebuilt; call [`rebuild_indices`] afterwards.
    ///
    /// [`rebuild_indices`]: RegistryState::rebuild_indices
    pub fn upsert(&mut self, space: AddressSpace, long: LongAddress, short: Option<ShortAddress>) -> Result<()> {
        let key = DeviceKey { space, long };
        if let Some(device) = self.devices.get_mut(&key) {
            let identity = device.identity_mut();
            identity.short = short;
            identity.available = true;
            return Ok(());
        }
        self.insert(Device::new(space, long, short))
    }

    /// Insert or replace a complete device record.
    pub fn insert(&mut self, device: Device) -> Result<()> {
        self.devices
            .insert(device.key(), device)
            .map(|_| ())
            .map_err(|_| DaliError::buffer_too_small())
    }

    pub fn remove(&mut self, key: DeviceKey) -> Option<Device> {
        self.devices.remove(&key)
    }

    /// Keep only the devices for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&DeviceKey) -> bool) {
        self.devices.retain(|key, _| keep(key));
    }

    /// Forget every device and index entry.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.gear_index = [None; SHORTS];
        self.input_index = [None; SHORTS];
    }

    pub fn groups(&self) -> &GroupAssignments {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupAssignments {
        &mut self.groups
    }

    pub fn group_state(&self, group: GroupId) -> &GroupState {
        &self.group_states[group.value() as usize]
    }

    pub fn group_state_mut(&mut self, group: GroupId) -> &mut GroupState {
        &mut self.group_states[group.value() as usize]
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Short addresses of the control gear addressed by `target`.
    pub fn gear_shorts(&self, target: Target) -> heapless::Vec<ShortAddress, SHORTS> {
        let mut shorts = heapless::Vec::new();
        for short in ShortAddress::all() {
            let Some(long) = self.gear_index[short.value() as usize] else {
                continue;
            };
            let selected = match target {
                Target::Short(wanted) => wanted == short,
                Target::Group(group) => self.groups.is_member(long, group),
                Target::Broadcast => true,
            };
            if selected {
                // 64 entries at most
                let _ = shorts.push(short);
            }
        }
        shorts
    }

    /// Level aggregate of `group`, from the gear currently in the registry.
    pub fn aggregate(&self, group: GroupId) -> Option<u8> {
        groups::aggregate_level(
            self.groups
                .members(group)
                .filter_map(|long| self.devices.get(&DeviceKey::gear(long)))
                .filter_map(Device::as_gear)
                .map(|gear| gear.current_level),
        )
    }

    /// Colour aggregate of `group` as `(mirek, rgb)`.
    pub fn aggregate_colour(&self, group: GroupId) -> (Consensus<u16>, Consensus<(u8, u8, u8)>) {
        let mirek = groups::aggregate_channel(
            self.member_colours(group)
                .filter(|colour| colour.supports_tc)
                .map(|colour| colour.mirek),
        );
        let rgb = groups::aggregate_channel(
            self.member_colours(group)
                .filter(|colour| colour.supports_rgb)
                .map(|colour| colour.rgb),
        );
        (mirek, rgb)
    }

    fn member_colours(&self, group: GroupId) -> impl Iterator<Item = ColorState> + '_ {
        self.groups
            .members(group)
            .filter_map(move |long| self.devices.get(&DeviceKey::gear(long)))
            .filter_map(Device::as_gear)
            .filter_map(|gear| gear.colour)
    }
}

/// Shared device registry
pub struct Registry<M: RawMutex> {
    state: BlockingMutex<M, RefCell<RegistryState>>,
    notifications: Channel<M, Notification, NOTIFICATION_QUEUE_DEPTH>,
    dirty: Signal<M, ()>,
    sync_requested: Signal<M, ()>,
}

impl<M: RawMutex> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> core::fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl<M: RawMutex> Registry<M> {
    pub fn new() -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(RegistryState::new())),
            notifications: Channel::new(),
            dirty: Signal::new(),
            sync_requested: Signal::new(),
        }
    }

    /// Run `f` with the registry locked.
    ///
    /// `f` must not call back into the registry.
    pub fn with<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    // -------------------------------------------------------------------------
    // Notifications and persistence flag
    // -------------------------------------------------------------------------

    pub fn notify(&self, notification: Notification) {
        if self.notifications.try_send(notification).is_err() {
            dali_log!(warn, "Notification queue full, dropping {:?}", notification);
        }
    }

    pub async fn next_notification(&self) -> Notification {
        self.notifications.receive().await
    }

    pub fn try_next_notification(&self) -> Option<Notification> {
        self.notifications.try_receive().ok()
    }

    /// Flag the address map and group assignments for saving.
    pub fn mark_dirty(&self) {
        self.dirty.signal(());
    }

    pub async fn wait_dirty(&self) {
        self.dirty.wait().await;
    }

    /// Consume a pending dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.try_take().is_some()
    }

    // -------------------------------------------------------------------------
    // Table maintenance
    // -------------------------------------------------------------------------

    /// Replace the registry contents with the result of a bus scan.
    ///
    /// Devices seen again keep their state; devices not found are removed.
    pub fn replace_devices(&self, found: &[(DeviceKey, ShortAddress)]) -> Result<()> {
        self.with(|state| {
            state.retain(|key| found.iter().any(|(seen, _)| seen == key));
            for (key, short) in found {
                state.upsert(key.space, key.long, Some(*short))?;
            }
            state.rebuild_indices();
            Ok(())
        })
    }

    /// Replace the registry contents with devices loaded from storage.
    pub fn load_devices(&self, devices: impl IntoIterator<Item = Device>) -> Result<()> {
        self.with(|state| {
            state.clear();
            for device in devices {
                state.insert(device)?;
            }
            state.rebuild_indices();
            Ok(())
        })
    }

    pub fn clear(&self) {
        self.with(RegistryState::clear);
    }

    pub fn counts(&self) -> (usize, usize) {
        self.with(|state| {
            (
                state.count(AddressSpace::ControlGear),
                state.count(AddressSpace::InputDevice),
            )
        })
    }

    pub fn device(&self, key: DeviceKey) -> Option<Device> {
        self.with(|state| state.device(key).cloned())
    }

    pub fn device_at(&self, space: AddressSpace, short: ShortAddress) -> Option<Device> {
        self.with(|state| state.device_at(space, short).cloned())
    }

    pub fn long_at(&self, space: AddressSpace, short: ShortAddress) -> Option<LongAddress> {
        self.with(|state| state.long_at(space, short))
    }

    /// Record device availability, notifying on change.
    pub fn set_available(&self, key: DeviceKey, available: bool) -> bool {
        let changed = self.with(|state| {
            let Some(device) = state.device_mut(key) else {
                return false;
            };
            let identity = device.identity_mut();
            let changed = identity.available != available;
            identity.available = available;
            changed
        });
        if changed {
            dali_log!(info, "Device {} available: {}", key.long.raw(), available);
            self.notify(Notification::Availability {
                long: key.long,
                space: key.space,
                available,
            });
        }
        changed
    }

    // -------------------------------------------------------------------------
    // Level tracking
    // -------------------------------------------------------------------------

    /// Apply a level the bus is known to have set on `target`.
    ///
    /// Every affected gear that changed is published, then group
    /// aggregates are refreshed.
    pub fn apply_level(&self, target: Target, level: u8) {
        let changed = self.with(|state| {
            let mut changed: heapless::Vec<Notification, SHORTS> = heapless::Vec::new();
            for short in state.gear_shorts(target) {
                if let Some(gear) = state.gear_at_mut(short) {
                    if gear.apply_level(level) {
                        let _ = changed.push(Notification::gear_state(gear));
                    }
                }
            }
            changed
        });
        for notification in changed {
            self.notify(notification);
        }
        if let Target::Group(group) = target {
            self.set_group_level(group, level);
        }
        self.recompute_groups();
    }

    /// Schedule polls of every gear addressed by `target`, staggered so
    /// they do not all land in the same scheduler step.
    pub fn schedule_resync(&self, target: Target, now: Instant) {
        self.with(|state| {
            let shorts = state.gear_shorts(target);
            for (index, short) in shorts.into_iter().enumerate() {
                let delay = Duration::from_millis(RESYNC_STAGGER_MS * (index as u64 + 1));
                state.scheduler.request_sync(short, delay, now);
            }
        });
        self.sync_requested.signal(());
    }

    pub fn request_sync(&self, short: ShortAddress, delay: Duration, now: Instant) {
        self.with(|state| state.scheduler.request_sync(short, delay, now));
        self.sync_requested.signal(());
    }

    pub fn next_step(&self, now: Instant) -> PollStep {
        self.with(|state| state.scheduler.next_step(now))
    }

    pub fn next_priority(&self, now: Instant) -> Option<ShortAddress> {
        self.with(|state| state.scheduler.next_priority(now))
    }

    pub fn next_round_robin(&self) -> PollStep {
        self.with(|state| state.scheduler.next_round_robin())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.with(|state| state.scheduler.next_deadline())
    }

    /// Wait for a new sync request.
    pub async fn wait_sync_request(&self) {
        self.sync_requested.wait().await;
    }

    /// Record a colour sent to `target`, notifying every colour gear that
    /// changed.
    pub fn apply_colour(&self, target: Target, mirek: Option<u16>, rgb: Option<(u8, u8, u8)>) {
        let changed = self.with(|state| {
            let mut changed: heapless::Vec<Notification, SHORTS> = heapless::Vec::new();
            for short in state.gear_shorts(target) {
                let Some(gear) = state.gear_at_mut(short) else {
                    continue;
                };
                let Some(colour) = gear.colour.as_mut() else {
                    continue;
                };
                let before = colour.snapshot();
                if colour.supports_tc && mirek.is_some() {
                    colour.mirek = mirek;
                }
                if colour.supports_rgb && rgb.is_some() {
                    colour.rgb = rgb;
                }
                if colour.snapshot() != before {
                    let _ = changed.push(Notification::gear_state(gear));
                }
            }
            changed
        });
        for notification in changed {
            self.notify(notification);
        }
        if let Target::Group(group) = target {
            self.set_group_colour(group, mirek, rgb);
        }
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    pub fn group_state(&self, group: GroupId) -> GroupState {
        self.with(|state| *state.group_state(group))
    }

    pub fn group_assignments(&self) -> GroupAssignments {
        self.with(|state| state.groups().clone())
    }

    /// Record a group level, notifying on change.
    pub fn set_group_level(&self, group: GroupId, level: u8) {
        let changed = self.with(|state| {
            let group_state = state.group_state_mut(group);
            group_state.apply_level(level).then(|| group_notification(group_state))
        });
        if let Some(notification) = changed {
            self.notify(notification);
        }
    }

    /// Record a colour sent to a whole group.
    pub fn set_group_colour(&self, group: GroupId, mirek: Option<u16>, rgb: Option<(u8, u8, u8)>) {
        let notification = self.with(|state| {
            let group_state = state.group_state_mut(group);
            if mirek.is_some() {
                group_state.mirek = mirek;
            }
            if rgb.is_some() {
                group_state.rgb = rgb;
            }
            group_notification(group_state)
        });
        self.notify(notification);
    }

    /// Recompute every group level and colour from its members.
    ///
    /// Groups without a member of known level keep their level; groups
    /// without a colour capable member keep their colour.
    pub fn recompute_groups(&self) {
        let changed = self.with(|state| {
            let mut changed: heapless::Vec<Notification, { GROUP_COUNT as usize }> = heapless::Vec::new();
            for group in GroupId::all() {
                let level = state.aggregate(group);
                let (mirek, rgb) = state.aggregate_colour(group);
                let group_state = state.group_state_mut(group);
                let level_changed = level.is_some_and(|level| group_state.apply_level(level));
                let colour_changed = group_state.apply_colour(mirek, rgb);
                if level_changed || colour_changed {
                    let _ = changed.push(group_notification(group_state));
                }
            }
            changed
        });
        for notification in changed {
            self.notify(notification);
        }
    }

    /// Update the membership of one device in one group.
    pub fn update_membership(&self, long: LongAddress, group: GroupId, member: bool) -> Result<()> {
        let changed = self.with(|state| state.groups_mut().update(long, group, member))?;
        if changed {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Replace the membership mask of one device.
    pub fn set_membership(&self, long: LongAddress, mask: u16) -> Result<()> {
        let changed = self.with(|state| state.groups_mut().set(long, mask))?;
        if changed {
            self.mark_dirty();
        }
        Ok(())
    }

    pub fn load_group_assignments(&self, assignments: GroupAssignments) {
        self.with(|state| *state.groups_mut() = assignments);
    }
}

fn group_notification(state: &GroupState) -> Notification {
    Notification::GroupState {
        group: state.id,
        level: state.current_level,
        colour: state.colour(),
    }
}
