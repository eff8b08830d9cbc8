//! Bus-driving registry operations and the long-running bridge tasks.
//!
//! The [`Controller`] owns nothing but a storage port and an inbound
//! command queue; the adapter and registry are shared with the rest of
//! the firmware. Every operation follows the same pattern: read what it
//! needs from the registry, release it, talk to the bus through one
//! adapter transaction, then apply the results to the registry.
//!
//! ## Tasks
//!
//! | task | purpose |
//! |------|---------|
//! | [`run_scheduler`] | adaptive polling (priority + round-robin) |
//! | [`run_sniffer`] | optimistic updates from other masters' frames |
//! | [`run_persistence`] | debounced saving of address map and groups |
//! | [`run_commands`] | inbound [`BridgeCommand`]s |
//!
//! [`run_scheduler`]: Controller::run_scheduler
//! [`run_sniffer`]: Controller::run_sniffer
//! [`run_persistence`]: Controller::run_persistence
//! [`run_commands`]: Controller::run_commands

pub mod commands;

use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};

use crate::adapter::{BusTransport, DaliAdapter, Transaction};
use crate::addressing::{AddressSpace, GroupId, LongAddress, SceneId, ShortAddress, Target};
use crate::bus::BusChannels;
use crate::commissioning::{Commissioner, CommissioningReport, InitialiseScope};
use crate::configuration::BridgeConfig;
use crate::device::{ColorState, ColourSnapshot, ControlGear, Device, DeviceKey, PRODUCT_ID_LEN};
use crate::error::{DaliError, Result};
use crate::protocol::commands::{Command, InputCommand, DEVICE_TYPE_COLOUR};
use crate::protocol::Frame;
use crate::registry::{groups, sniffer, GroupDiff, Notification, PollStep, Registry, SniffedAction, DEVICE_CAPACITY};
use crate::storage::address_map::{self, AddressRecord, ADDRESS_MAP_LEN};
use crate::storage::groups::GROUPS_JSON_LEN;
use crate::storage::{GroupsDocument, KeyValueStore, ADDRESS_MAP_KEY, GROUPS_KEY};

pub use commands::{BridgeCommand, CommandTarget};

/// Depth of the inbound command queue
pub const COMMAND_QUEUE_DEPTH: usize = 8;
/// Pause after a priority poll
pub const PRIORITY_POLL_DELAY_MS: u64 = 50;
/// Shortest pause between two round-robin polls
pub const MIN_ROUND_ROBIN_DELAY_MS: u64 = 10;
/// Colour values of a lit DT8 gear are re-read at most this often
pub const COLOUR_POLL_INTERVAL_S: u64 = 60;

/// Static attributes read once per device
#[derive(Debug, Clone, Default)]
struct StaticAttributes {
    device_type: Option<u8>,
    product_id: Option<heapless::String<PRODUCT_ID_LEN>>,
    min_level: Option<u8>,
    max_level: Option<u8>,
    power_on_level: Option<u8>,
    system_failure_level: Option<u8>,
}

impl StaticAttributes {
    fn apply(self, gear: &mut ControlGear) {
        if let Some(product_id) = self.product_id {
            gear.identity.product_id = product_id;
        }
        gear.min_level = self.min_level.unwrap_or(gear.min_level);
        gear.max_level = self.max_level.unwrap_or(gear.max_level);
        gear.power_on_level = self.power_on_level.unwrap_or(gear.power_on_level);
        gear.system_failure_level = self.system_failure_level.unwrap_or(gear.system_failure_level);
        // Without a device type the read is retried on the next poll
        if self.device_type.is_some() {
            gear.device_type = self.device_type;
            gear.identity.static_loaded = true;
        }
    }
}

/// Results of one control gear poll
#[derive(Debug)]
struct GearReading {
    level: u8,
    status: Option<u8>,
    statics: Option<StaticAttributes>,
    colour: Option<ColorState>,
    colour_values: Option<ColourSnapshot>,
}

/// DALI side of the bridge
pub struct Controller<'a, M: RawMutex, T: BusTransport, S: KeyValueStore> {
    adapter: &'a DaliAdapter<M, T>,
    registry: &'a Registry<M>,
    config: BridgeConfig,
    store: Mutex<M, S>,
    commands: Channel<M, BridgeCommand, COMMAND_QUEUE_DEPTH>,
}

impl<M: RawMutex, T: BusTransport, S: KeyValueStore> core::fmt::Debug for Controller<'_, M, T, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a, M: RawMutex, T: BusTransport, S: KeyValueStore> Controller<'a, M, T, S> {
    pub fn new(adapter: &'a DaliAdapter<M, T>, registry: &'a Registry<M>, store: S, config: BridgeConfig) -> Self {
        Self {
            adapter,
            registry,
            config,
            store: Mutex::new(store),
            commands: Channel::new(),
        }
    }

    pub fn registry(&self) -> &'a Registry<M> {
        self.registry
    }

    pub fn adapter(&self) -> &'a DaliAdapter<M, T> {
        self.adapter
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Exclusive access to the storage port.
    pub async fn store(&self) -> embassy_sync::mutex::MutexGuard<'_, M, S> {
        self.store.lock().await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Bring the registry up to date with the bus.
    ///
    /// Loads the stored address map and group assignments, checks the map
    /// against the bus and falls back to a full discovery when the map is
    /// empty or wrong.
    pub async fn init(&self) -> Result<()> {
        let loaded = self.load_address_map().await;
        self.load_group_assignments().await;

        let valid = loaded > 0 && self.validate_address_map().await?;
        if valid {
            dali_log!(info, "Address map with {} devices confirmed", loaded);
        } else {
            if loaded > 0 {
                dali_log!(warn, "Stored address map does not match the bus, rediscovering");
                self.registry.clear();
            }
            self.discover_and_map().await?;
        }
        self.sync_all();
        Ok(())
    }

    /// Load the address map into the registry, returning the device count.
    ///
    /// A missing, unreadable or corrupt map leaves the registry empty.
    async fn load_address_map(&self) -> usize {
        let mut buf = [0u8; ADDRESS_MAP_LEN];
        let read = self.store.lock().await.read(ADDRESS_MAP_KEY, &mut buf).await;
        let len = match read {
            Ok(Some(len)) => len,
            Ok(None) => return 0,
            Err(e) => {
                dali_log!(warn, "Reading address map failed: {:?}", e);
                return 0;
            }
        };
        let records = match address_map::decode_all(&buf[..len]) {
            Ok(records) => records,
            Err(e) => {
                dali_log!(warn, "Discarding corrupt address map: {:?}", e);
                return 0;
            }
        };
        let count = records.len();
        if let Err(e) = self.registry.load_devices(records.into_iter().map(AddressRecord::into_device)) {
            dali_log!(warn, "Address map does not fit the registry: {:?}", e);
            self.registry.clear();
            return 0;
        }
        count
    }

    async fn load_group_assignments(&self) {
        let mut buf = [0u8; GROUPS_JSON_LEN];
        let read = self.store.lock().await.read(GROUPS_KEY, &mut buf).await;
        match read {
            Ok(Some(len)) => match GroupsDocument::decode(&buf[..len]) {
                Ok(document) => self.registry.load_group_assignments(document.to_assignments()),
                Err(e) => dali_log!(warn, "Discarding corrupt group assignments: {:?}", e),
            },
            Ok(None) => {}
            Err(e) => dali_log!(warn, "Reading group assignments failed: {:?}", e),
        }
    }

    /// Scan all 64 short addresses of both spaces and rebuild the registry.
    ///
    /// Returns the number of control gear and input devices found.
    pub async fn discover_and_map(&self) -> Result<(usize, usize)> {
        dali_log!(info, "Discovering devices");
        let mut found: heapless::Vec<(DeviceKey, ShortAddress), DEVICE_CAPACITY> = heapless::Vec::new();

        for short in ShortAddress::all() {
            let probe = self.probe_short(short).await;
            let (gear, input) = match probe {
                Ok(result) => result,
                Err(e) if e.is_transient() => {
                    dali_log!(warn, "Probing short address {} failed: {:?}", short.value(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for key in [gear.map(DeviceKey::gear), input.map(DeviceKey::input)].into_iter().flatten() {
                // Two entries per short address at most
                let _ = found.push((key, short));
            }
        }

        self.registry.replace_devices(&found)?;
        let (control_gear, input_devices) = self.registry.counts();
        dali_log!(
            info,
            "Discovery found {} control gear and {} input devices",
            control_gear,
            input_devices
        );
        self.registry.notify(Notification::DiscoveryComplete {
            control_gear,
            input_devices,
        });
        self.registry.mark_dirty();
        Ok((control_gear, input_devices))
    }

    /// Long addresses answering at `short` in each address space.
    async fn probe_short(&self, short: ShortAddress) -> Result<(Option<LongAddress>, Option<LongAddress>)> {
        let mut tx = self.adapter.transaction().await;
        let mut gear = None;
        if tx.query(short, Command::QueryStatus).await?.is_some() {
            gear = tx.query_long_address(short).await?;
            if gear.is_none() {
                dali_log!(warn, "Gear at {} did not report its long address", short.value());
            }
        }
        let mut input = None;
        if tx.input_query(short, InputCommand::QueryDeviceStatus).await?.is_some() {
            input = tx.query_input_long_address(short).await?;
        }
        Ok((gear, input))
    }

    /// Check every loaded device against the bus.
    ///
    /// Returns `false` as soon as a short address answers with a different
    /// long address. Devices that don't answer are marked unavailable.
    pub async fn validate_address_map(&self) -> Result<bool> {
        let entries: heapless::Vec<(DeviceKey, ShortAddress), DEVICE_CAPACITY> = self.registry.with(|state| {
            state
                .devices()
                .filter_map(|device| device.identity().short.map(|short| (device.key(), short)))
                .collect()
        });

        for (key, short) in entries {
            let answer = match self.read_long_address(key.space, short).await {
                Ok(answer) => answer,
                Err(e) if e.is_transient() => {
                    dali_log!(debug, "Validation of {} failed: {:?}", short.value(), e);
                    None
                }
                Err(e) => return Err(e),
            };
            match answer {
                Some(long) if long == key.long => {
                    self.registry.set_available(key, true);
                }
                Some(long) => {
                    dali_log!(
                        warn,
                        "Short address {} now belongs to {}, expected {}",
                        short.value(),
                        long.raw(),
                        key.long.raw()
                    );
                    return Ok(false);
                }
                None => {
                    self.registry.set_available(key, false);
                }
            }
        }
        Ok(true)
    }

    async fn read_long_address(&self, space: AddressSpace, short: ShortAddress) -> Result<Option<LongAddress>> {
        let mut tx = self.adapter.transaction().await;
        match space {
            AddressSpace::ControlGear => {
                if tx.query(short, Command::QueryStatus).await?.is_none() {
                    return Ok(None);
                }
                tx.query_long_address(short).await
            }
            AddressSpace::InputDevice => {
                if tx.input_query(short, InputCommand::QueryDeviceStatus).await?.is_none() {
                    return Ok(None);
                }
                tx.query_input_long_address(short).await
            }
        }
    }

    /// Assign short addresses in one address space.
    pub async fn commission(&self, scope: InitialiseScope, space: AddressSpace) -> Result<CommissioningReport> {
        let occupied = match scope {
            InitialiseScope::All => 0,
            InitialiseScope::Unaddressed => self.registry.with(|state| state.occupied(space)),
        };
        let report = Commissioner::new(self.adapter).run(scope, space, occupied).await?;
        if report.overflow > 0 {
            dali_log!(
                warn,
                "{} devices left without short address: {:?} space is full",
                report.overflow,
                space
            );
        }
        self.registry.notify(Notification::CommissioningComplete {
            space,
            assigned: report.assigned.len(),
        });
        Ok(report)
    }

    /// Commission both address spaces, then rediscover.
    pub async fn initialize(&self, scope: InitialiseScope) -> Result<()> {
        for space in [AddressSpace::ControlGear, AddressSpace::InputDevice] {
            self.commission(scope, space).await?;
        }
        self.discover_and_map().await?;
        self.sync_all();
        Ok(())
    }

    /// Ask for an immediate poll of every known device.
    pub fn sync_all(&self) {
        let now = Instant::now();
        let shorts: heapless::Vec<ShortAddress, DEVICE_CAPACITY> = self
            .registry
            .with(|state| state.devices().filter_map(|device| device.identity().short).collect());
        for short in shorts {
            self.registry.request_sync(short, Duration::from_ticks(0), now);
        }
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// Poll whatever lives at `short` in both address spaces.
    pub async fn poll_short(&self, short: ShortAddress) -> Result<()> {
        if let Some(long) = self.registry.long_at(AddressSpace::ControlGear, short) {
            self.poll_gear(DeviceKey::gear(long), short).await?;
        }
        if let Some(long) = self.registry.long_at(AddressSpace::InputDevice, short) {
            self.poll_input(DeviceKey::input(long), short).await?;
        }
        Ok(())
    }

    async fn poll_gear(&self, key: DeviceKey, short: ShortAddress) -> Result<()> {
        let Some(Device::ControlGear(known)) = self.registry.device(key) else {
            return Ok(());
        };

        let reading = {
            let mut tx = self.adapter.transaction().await;
            Self::read_gear(&mut tx, short, &known).await?
        };
        let Some(reading) = reading else {
            self.registry.set_available(key, false);
            return Ok(());
        };
        self.registry.set_available(key, true);

        let now = Instant::now();
        let outcome = self.registry.with(|state| {
            let gear = state.device_mut(key)?.as_gear_mut()?;
            let mut changed = gear.apply_level(reading.level);
            let mut dirty = false;
            if reading.status.is_some() && gear.status != reading.status {
                gear.status = reading.status;
                changed = true;
            }
            if let Some(statics) = reading.statics {
                statics.apply(gear);
                dirty = true;
            }
            if let Some(colour) = reading.colour {
                gear.colour = Some(colour);
                dirty = true;
            }
            if let (Some(values), Some(colour)) = (reading.colour_values, gear.colour.as_mut()) {
                colour.last_poll = Some(now);
                if colour.snapshot() != values {
                    colour.mirek = values.mirek;
                    colour.rgb = values.rgb;
                    changed = true;
                }
            }
            Some((changed.then(|| Notification::gear_state(gear)), dirty))
        });

        if let Some((notification, dirty)) = outcome {
            if let Some(notification) = notification {
                self.registry.notify(notification);
                self.registry.recompute_groups();
            }
            if dirty {
                self.registry.mark_dirty();
            }
        }
        Ok(())
    }

    /// Query one control gear; `None` if it does not answer.
    async fn read_gear(tx: &mut Transaction<'_, M, T>, short: ShortAddress, known: &ControlGear) -> Result<Option<GearReading>> {
        let Some(level) = tx.query(short, Command::QueryActualLevel).await? else {
            return Ok(None);
        };
        let status = tx.query(short, Command::QueryStatus).await?;

        let statics = if known.identity.static_loaded {
            None
        } else {
            Some(Self::read_static(tx, short).await?)
        };
        let device_type = statics.as_ref().map_or(known.device_type, |s| s.device_type);

        let capability_known = known.colour.is_some_and(|c| c.capability_known);
        let colour = if device_type == Some(DEVICE_TYPE_COLOUR) && !capability_known {
            tx.query_colour_capability(short).await?.map(ColorState::from_capability)
        } else {
            None
        };

        let mut colour_values = None;
        let lit = level > 0 && level != crate::device::LEVEL_UNKNOWN;
        if let Some(state) = colour.or(known.colour) {
            let due = state.last_poll.map_or(true, |last| {
                Instant::now()
                    .checked_duration_since(last)
                    .map_or(false, |age| age >= Duration::from_secs(COLOUR_POLL_INTERVAL_S))
            });
            if lit && due && (state.supports_tc || state.supports_rgb) {
                let mirek = if state.supports_tc {
                    tx.query_colour_temperature(short).await?
                } else {
                    None
                };
                let rgb = if state.supports_rgb { tx.query_rgb(short).await? } else { None };
                colour_values = Some(ColourSnapshot { mirek, rgb });
            }
        }

        Ok(Some(GearReading {
            level,
            status,
            statics,
            colour,
            colour_values,
        }))
    }

    async fn read_static(tx: &mut Transaction<'_, M, T>, short: ShortAddress) -> Result<StaticAttributes> {
        Ok(StaticAttributes {
            device_type: tx.query(short, Command::QueryDeviceType).await?,
            product_id: tx.query_gtin(short).await?,
            min_level: tx.query(short, Command::QueryMinLevel).await?,
            max_level: tx.query(short, Command::QueryMaxLevel).await?,
            power_on_level: tx.query(short, Command::QueryPowerOnLevel).await?,
            system_failure_level: tx.query(short, Command::QuerySystemFailureLevel).await?,
        })
    }

    async fn poll_input(&self, key: DeviceKey, short: ShortAddress) -> Result<()> {
        let status = self
            .adapter
            .transaction()
            .await
            .input_query(short, InputCommand::QueryDeviceStatus)
            .await?;
        let Some(status) = status else {
            self.registry.set_available(key, false);
            return Ok(());
        };
        self.registry.set_available(key, true);

        let changed = self.registry.with(|state| match state.device_mut(key) {
            Some(Device::InputDevice(input)) => {
                let changed = input.status != Some(status);
                input.status = Some(status);
                input.identity.static_loaded = true;
                changed
            }
            _ => false,
        });
        if changed {
            self.registry.notify(Notification::DeviceState {
                long: key.long,
                space: AddressSpace::InputDevice,
                level: None,
                status: Some(status),
                colour: None,
            });
        }
        Ok(())
    }

    fn round_robin_delay(&self) -> Duration {
        let per_device = u64::from(self.config.poll_interval_ms) / 64;
        Duration::from_millis(per_device.max(MIN_ROUND_ROBIN_DELAY_MS))
    }

    async fn poll_logged(&self, short: ShortAddress) {
        if let Err(e) = self.poll_short(short).await {
            dali_log!(debug, "Poll of short address {} failed: {:?}", short.value(), e);
        }
    }

    /// Poll the next round-robin address, recomputing group aggregates at
    /// the end of a pass.
    pub async fn round_robin_step(&self) -> PollStep {
        let step = self.registry.next_round_robin();
        self.poll_logged(step.short()).await;
        if matches!(step, PollStep::RoundRobin { wrapped: true, .. }) {
            self.registry.recompute_groups();
        }
        step
    }

    /// Polling task.
    ///
    /// Priority requests are served first with a short pause after each;
    /// otherwise one round-robin step is taken per `poll_interval / 64`.
    /// Group aggregates are recomputed after every full pass.
    pub async fn run_scheduler(&self) -> ! {
        let mut next_round = Instant::now();
        loop {
            let now = Instant::now();
            if let Some(short) = self.registry.next_priority(now) {
                self.poll_logged(short).await;
                Timer::after(Duration::from_millis(PRIORITY_POLL_DELAY_MS)).await;
                continue;
            }
            if now >= next_round {
                self.round_robin_step().await;
                next_round = Instant::now() + self.round_robin_delay();
                continue;
            }
            let wake_at = self
                .registry
                .next_deadline()
                .map_or(next_round, |due| due.min(next_round));
            select(Timer::at(wake_at), self.registry.wait_sync_request()).await;
        }
    }

    // -------------------------------------------------------------------------
    // Sniffer
    // -------------------------------------------------------------------------

    /// Apply one frame sent by another bus master.
    pub fn handle_sniffed(&self, frame: Frame) {
        if let Some(sniffed) = sniffer::interpret(frame) {
            dali_log!(debug, "Sniffed {:?}", sniffed);
            match sniffed.action {
                SniffedAction::SetLevel(level) => self.registry.apply_level(sniffed.target, level),
                SniffedAction::Resync => self.registry.schedule_resync(sniffed.target, Instant::now()),
            }
            return;
        }
        if let Some(event) = sniffer::interpret_event(frame) {
            match self.registry.long_at(AddressSpace::InputDevice, event.short) {
                Some(long) => self.registry.notify(Notification::InputEvent {
                    long,
                    instance: event.instance,
                    event: event.event,
                }),
                None => dali_log!(debug, "Event from unknown input device {}", event.short.value()),
            }
        }
    }

    /// Sniffer task: consume forward frames seen on the bus.
    pub async fn run_sniffer(&self, channels: &BusChannels<M>) -> ! {
        loop {
            let frame = channels.next_sniffed_frame().await;
            self.handle_sniffed(frame);
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write the address map and group assignments now.
    pub async fn persist(&self) -> Result<()> {
        let records: heapless::Vec<AddressRecord, DEVICE_CAPACITY> = self
            .registry
            .with(|state| state.devices().map(AddressRecord::from_device).collect());
        let document = GroupsDocument::from_assignments(&self.registry.group_assignments())?;

        let mut buf = [0u8; ADDRESS_MAP_LEN];
        let len = address_map::encode_all(&records, &mut buf)?;
        let mut store = self.store.lock().await;
        store.write(ADDRESS_MAP_KEY, &buf[..len]).await?;

        let len = document.encode(&mut buf)?;
        store.write(GROUPS_KEY, &buf[..len]).await?;
        dali_log!(info, "Saved {} devices", records.len());
        Ok(())
    }

    /// Persistence task: save once changes have been quiet for
    /// `sync_timeout_ms`.
    pub async fn run_persistence(&self) -> ! {
        let quiet = Duration::from_millis(u64::from(self.config.sync_timeout_ms));
        loop {
            self.registry.wait_dirty().await;
            while with_timeout(quiet, self.registry.wait_dirty()).await.is_ok() {}
            if let Err(e) = self.persist().await {
                dali_log!(error, "Saving address map failed: {:?}", e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Groups and scenes
    // -------------------------------------------------------------------------

    fn gear_short(&self, long: LongAddress) -> Result<ShortAddress> {
        self.registry
            .device(DeviceKey::gear(long))
            .and_then(|device| device.identity().short)
            .ok_or(DaliError::InvalidState)
    }

    fn resolve(&self, target: CommandTarget) -> Result<Target> {
        match target {
            CommandTarget::Device(long) => self.gear_short(long).map(Target::Short),
            CommandTarget::Group(group) => Ok(Target::Group(group)),
            CommandTarget::Broadcast => Ok(Target::Broadcast),
        }
    }

    pub async fn add_to_group(&self, long: LongAddress, group: GroupId) -> Result<()> {
        let short = self.gear_short(long)?;
        self.adapter.transaction().await.add_to_group(short, group).await?;
        self.registry.update_membership(long, group, true)?;
        self.registry.recompute_groups();
        Ok(())
    }

    pub async fn remove_from_group(&self, long: LongAddress, group: GroupId) -> Result<()> {
        let short = self.gear_short(long)?;
        self.adapter.transaction().await.remove_from_group(short, group).await?;
        self.registry.update_membership(long, group, false)
    }

    /// Make the membership of `long` exactly `mask`, sending only the
    /// commands for groups that change.
    pub async fn set_group_assignments(&self, long: LongAddress, mask: u16) -> Result<()> {
        let short = self.gear_short(long)?;
        let current = self.registry.with(|state| state.groups().get(long));
        let diff = GroupDiff::between(current, mask);
        if diff.is_empty() {
            return Ok(());
        }
        {
            let mut tx = self.adapter.transaction().await;
            for (group, member) in diff.changes() {
                if member {
                    tx.add_to_group(short, group).await?;
                } else {
                    tx.remove_from_group(short, group).await?;
                }
            }
        }
        self.registry.set_membership(long, mask)?;
        self.registry.recompute_groups();
        Ok(())
    }

    /// Read the membership of `long` back from the gear.
    pub async fn refresh_group_assignments(&self, long: LongAddress) -> Result<Option<u16>> {
        let short = self.gear_short(long)?;
        let mask = self.adapter.transaction().await.query_groups(short).await?;
        match mask {
            Some(mask) => self.registry.set_membership(long, mask)?,
            None => dali_log!(warn, "Gear {} did not report its groups", long.raw()),
        }
        Ok(mask)
    }

    /// Store per-device levels as `scene`.
    ///
    /// Unknown devices and failed writes are logged and skipped; returns
    /// the number of devices that stored the scene.
    pub async fn save_scene(&self, scene: SceneId, levels: &[(LongAddress, u8)]) -> Result<usize> {
        let mut stored = 0;
        for (long, level) in levels {
            let Ok(short) = self.gear_short(*long) else {
                dali_log!(warn, "Scene {}: unknown device {}", scene.value(), long.raw());
                continue;
            };
            let result = self
                .adapter
                .transaction()
                .await
                .store_scene(Target::Short(short), scene, *level)
                .await;
            match result {
                Ok(()) => stored += 1,
                Err(e) => dali_log!(warn, "Scene {}: storing on {} failed: {:?}", scene.value(), long.raw(), e),
            }
        }
        Ok(stored)
    }

    pub async fn activate_scene(&self, target: Target, scene: SceneId) -> Result<()> {
        self.adapter.transaction().await.go_to_scene(target, scene).await?;
        self.registry.schedule_resync(target, Instant::now());
        Ok(())
    }

    pub async fn query_scene_level(&self, long: LongAddress, scene: SceneId) -> Result<Option<u8>> {
        let short = self.gear_short(long)?;
        self.adapter.transaction().await.query_scene_level(short, scene).await
    }

    pub async fn set_group_level(&self, group: GroupId, level: u8) -> Result<()> {
        self.set_level(Target::Group(group), level).await
    }

    /// Restore the last non-zero level of `group`.
    pub async fn group_on(&self, group: GroupId) -> Result<()> {
        let last = self.registry.group_state(group).last_level;
        self.set_group_level(group, if last == 0 { 254 } else { last }).await
    }

    pub async fn group_off(&self, group: GroupId) -> Result<()> {
        self.set_group_level(group, 0).await
    }

    /// Step a lit group up or down; a group that is off stays off.
    pub async fn group_step(&self, group: GroupId, up: bool) -> Result<()> {
        let current = self.registry.group_state(group).current_level;
        if current == 0 {
            return Ok(());
        }
        let level = groups::step_level(current, up);
        if level == current {
            return Ok(());
        }
        self.set_group_level(group, level).await
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Set a level and record it; gear that clamp it are re-polled.
    async fn set_level(&self, target: Target, level: u8) -> Result<()> {
        self.adapter.transaction().await.set_level(target, level).await?;
        self.registry.apply_level(target, level);
        if level != 0 {
            self.registry.schedule_resync(target, Instant::now());
        }
        Ok(())
    }

    async fn turn_on(&self, target: CommandTarget) -> Result<()> {
        match target {
            CommandTarget::Group(group) => self.group_on(group).await,
            CommandTarget::Device(long) => {
                let last = self
                    .registry
                    .device(DeviceKey::gear(long))
                    .and_then(|device| device.as_gear().map(|gear| gear.last_level))
                    .ok_or(DaliError::InvalidState)?;
                let short = self.gear_short(long)?;
                self.set_level(Target::Short(short), if last == 0 { 254 } else { last }).await
            }
            CommandTarget::Broadcast => self.set_level(Target::Broadcast, 254).await,
        }
    }

    /// Execute one inbound command.
    ///
    /// Returns the backward frame of a raw query, `None` otherwise.
    pub async fn handle_command(&self, command: BridgeCommand) -> Result<Option<u8>> {
        dali_log!(debug, "Command {:?}", command);
        match command {
            BridgeCommand::SetLevel { target, level } => self.set_level(self.resolve(target)?, level).await?,
            BridgeCommand::On { target } => self.turn_on(target).await?,
            BridgeCommand::Off { target } => self.set_level(self.resolve(target)?, 0).await?,
            BridgeCommand::SetColourTemperature { target, mirek } => {
                let target = self.resolve(target)?;
                self.adapter
                    .transaction()
                    .await
                    .set_colour_temperature(target, mirek)
                    .await?;
                self.registry.apply_colour(target, Some(mirek), None);
            }
            BridgeCommand::SetRgb {
                target,
                red,
                green,
                blue,
            } => {
                let target = self.resolve(target)?;
                self.adapter.transaction().await.set_rgb(target, red, green, blue).await?;
                self.registry.apply_colour(target, None, Some((red, green, blue)));
            }
            BridgeCommand::GroupMembership { long, group, member } => {
                if member {
                    self.add_to_group(long, group).await?;
                } else {
                    self.remove_from_group(long, group).await?;
                }
            }
            BridgeCommand::SetGroups { long, mask } => self.set_group_assignments(long, mask).await?,
            BridgeCommand::ActivateScene { target, scene } => {
                self.activate_scene(self.resolve(target)?, scene).await?;
            }
            BridgeCommand::SaveScene { scene, levels } => {
                self.save_scene(scene, &levels).await?;
            }
            BridgeCommand::SendRaw { frame, query } => {
                let mut tx = self.adapter.transaction().await;
                if query {
                    return tx.send_query(frame).await;
                }
                tx.send_raw(frame).await?;
            }
            BridgeCommand::Scan => {
                self.discover_and_map().await?;
                self.sync_all();
            }
            BridgeCommand::Initialize { scope } => self.initialize(scope).await?,
            BridgeCommand::Sync { short } => match short {
                Some(short) => self.registry.request_sync(short, Duration::from_ticks(0), Instant::now()),
                None => self.sync_all(),
            },
        }
        Ok(None)
    }

    /// Queue a command for [`run_commands`](Self::run_commands).
    pub fn submit(&self, command: BridgeCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|_| DaliError::queue_full())
    }

    /// Command task.
    pub async fn run_commands(&self) -> ! {
        loop {
            let command = self.commands.receive().await;
            if let Err(e) = self.handle_command(command).await {
                dali_log!(warn, "Command failed: {:?}", e);
            }
        }
    }
}
