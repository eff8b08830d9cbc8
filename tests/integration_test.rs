//! Integration tests for the dali-bridge library
//!
//! These tests run the complete bridge life cycle against the simulated bus:
//! commissioning a fresh installation, discovery, polling, group and scene
//! handling, persistence and a restart from storage.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test integration_test
//! ```

use dali_bridge::adapter::mock_bus::{MockBus, SimGear};
use dali_bridge::adapter::DaliAdapter;
use dali_bridge::addressing::{AddressSpace, GroupId, LongAddress, SceneId, ShortAddress};
use dali_bridge::commissioning::InitialiseScope;
use dali_bridge::configuration::BridgeConfig;
use dali_bridge::controller::{BridgeCommand, CommandTarget, Controller};
use dali_bridge::device::DeviceKey;
use dali_bridge::registry::{Notification, Registry};
use dali_bridge::storage::{KeyValueStore, MemoryStore, ADDRESS_MAP_KEY, GROUPS_KEY};
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

type Adapter = DaliAdapter<CriticalSectionRawMutex, MockBus>;
type TestRegistry = Registry<CriticalSectionRawMutex>;

fn long(raw: u32) -> LongAddress {
    LongAddress::new(raw).unwrap()
}

fn short(n: u8) -> ShortAddress {
    ShortAddress::new(n).unwrap()
}

fn drain(registry: &TestRegistry) -> Vec<Notification> {
    std::iter::from_fn(|| registry.try_next_notification()).collect()
}

/// Fresh installation: nothing has a short address yet
fn fresh_bus() -> MockBus {
    let mut bus = MockBus::new();
    for raw in [0x00_3A_01, 0x12_00_FF, 0x80_00_00] {
        bus.add_gear(SimGear::new(long(raw)));
    }
    bus.add_gear(SimGear::new(long(0x44_44_44)).with_colour(0x02));
    bus.add_input(long(0x05_05_05), None);
    bus
}

/// Copy the persisted blobs into a new store, as a reboot would see them.
fn reboot_store(old: &MemoryStore) -> MemoryStore {
    let mut store = MemoryStore::new();
    for key in [ADDRESS_MAP_KEY, GROUPS_KEY] {
        if let Some(value) = old.get(key) {
            block_on(store.write(key, value)).unwrap();
        }
    }
    store
}

#[test]
fn test_commission_fresh_installation() {
    let adapter = Adapter::new(fresh_bus());
    let registry = TestRegistry::new();
    let controller = Controller::new(&adapter, &registry, MemoryStore::new(), BridgeConfig::default());

    // Nothing answers at any short address yet
    block_on(controller.init()).unwrap();
    assert_eq!(registry.counts(), (0, 0));

    block_on(controller.handle_command(BridgeCommand::Initialize {
        scope: InitialiseScope::All,
    }))
    .unwrap();
    assert_eq!(registry.counts(), (4, 1));

    // Binary search finds the lowest random address first
    assert_eq!(registry.long_at(AddressSpace::ControlGear, short(0)), Some(long(0x00_3A_01)));
    assert_eq!(registry.long_at(AddressSpace::ControlGear, short(3)), Some(long(0x80_00_00)));
    assert_eq!(registry.long_at(AddressSpace::InputDevice, short(0)), Some(long(0x05_05_05)));

    let notifications = drain(&registry);
    assert!(notifications.contains(&Notification::CommissioningComplete {
        space: AddressSpace::ControlGear,
        assigned: 4
    }));
    assert!(notifications.contains(&Notification::DiscoveryComplete {
        control_gear: 4,
        input_devices: 1
    }));
}

#[test]
fn test_bridge_life_cycle() {
    let adapter = Adapter::new(fresh_bus());
    let registry = TestRegistry::new();
    let controller = Controller::new(&adapter, &registry, MemoryStore::new(), BridgeConfig::default());
    block_on(controller.initialize(InitialiseScope::All)).unwrap();

    // First poll pass reads static data, including the DT8 capability
    for n in 0..4 {
        block_on(controller.poll_short(short(n))).unwrap();
    }
    let colour_gear = registry.device(DeviceKey::gear(long(0x44_44_44))).unwrap();
    assert!(colour_gear.identity().static_loaded);
    assert!(colour_gear.as_gear().unwrap().colour.unwrap().supports_tc);
    drain(&registry);

    // Group 2 gets two members
    let kitchen = GroupId::new(2).unwrap();
    for raw in [0x00_3A_01, 0x12_00_FF] {
        block_on(controller.handle_command(BridgeCommand::GroupMembership {
            long: long(raw),
            group: kitchen,
            member: true,
        }))
        .unwrap();
    }
    block_on(controller.handle_command(BridgeCommand::SetLevel {
        target: CommandTarget::Group(kitchen),
        level: 180,
    }))
    .unwrap();
    assert_eq!(registry.group_state(kitchen).current_level, 180);
    assert!(drain(&registry).iter().any(|n| matches!(
        n,
        Notification::GroupState { group, level: 180, .. } if *group == kitchen
    )));

    // Scene 5 stores the current kitchen look
    let scene = SceneId::new(5).unwrap();
    let mut levels = heapless::Vec::new();
    levels.push((long(0x00_3A_01), 60)).unwrap();
    levels.push((long(0x12_00_FF), 90)).unwrap();
    block_on(controller.handle_command(BridgeCommand::SaveScene { scene, levels })).unwrap();
    block_on(controller.handle_command(BridgeCommand::ActivateScene {
        target: CommandTarget::Group(kitchen),
        scene,
    }))
    .unwrap();
    block_on(controller.poll_short(short(1))).unwrap();
    let level = registry
        .device(DeviceKey::gear(long(0x12_00_FF)))
        .and_then(|device| device.as_gear().map(|gear| gear.current_level));
    assert_eq!(level, Some(90));

    // Save, then restart from the stored state
    block_on(controller.persist()).unwrap();
    let store = block_on(async { reboot_store(&*controller.store().await) });

    let restarted = TestRegistry::new();
    let second = Controller::new(&adapter, &restarted, store, BridgeConfig::default());
    block_on(second.init()).unwrap();
    assert_eq!(restarted.counts(), (4, 1));
    let groups = restarted.group_assignments();
    assert!(groups.is_member(long(0x00_3A_01), kitchen));
    assert!(groups.is_member(long(0x12_00_FF), kitchen));
    assert!(!drain(&restarted)
        .iter()
        .any(|n| matches!(n, Notification::DiscoveryComplete { .. })));

    // Static data came back from the address map
    let restored = restarted.device(DeviceKey::gear(long(0x44_44_44))).unwrap();
    assert_eq!(restored.as_gear().unwrap().device_type, Some(8));
}

#[test]
fn test_replaced_gear_forces_rediscovery() {
    let adapter = Adapter::new(fresh_bus());
    let registry = TestRegistry::new();
    let controller = Controller::new(&adapter, &registry, MemoryStore::new(), BridgeConfig::default());
    block_on(controller.initialize(InitialiseScope::All)).unwrap();
    block_on(controller.persist()).unwrap();
    let store = block_on(async { reboot_store(&*controller.store().await) });

    // A technician swaps the gear at short 2 for a new one with the same address
    let mut swapped = MockBus::new();
    for n in 0..4u8 {
        let raw = registry.long_at(AddressSpace::ControlGear, short(n)).unwrap().raw();
        let raw = if n == 2 { 0x77_77_77 } else { raw };
        swapped.add_gear(SimGear::new(long(raw)).with_short(n));
    }
    swapped.add_input(long(0x05_05_05), Some(0));

    let adapter = Adapter::new(swapped);
    let restarted = TestRegistry::new();
    let second = Controller::new(&adapter, &restarted, store, BridgeConfig::default());
    block_on(second.init()).unwrap();

    assert_eq!(restarted.long_at(AddressSpace::ControlGear, short(2)), Some(long(0x77_77_77)));
    assert!(drain(&restarted)
        .iter()
        .any(|n| matches!(n, Notification::DiscoveryComplete { control_gear: 4, .. })));
}

#[test]
fn test_unaddressed_gear_added_later() {
    let adapter = Adapter::new(fresh_bus());
    let registry = TestRegistry::new();
    let controller = Controller::new(&adapter, &registry, MemoryStore::new(), BridgeConfig::default());
    block_on(controller.initialize(InitialiseScope::All)).unwrap();

    block_on(async {
        adapter
            .transaction()
            .await
            .transport()
            .add_gear(SimGear::new(long(0x00_00_10)));
    });
    block_on(controller.initialize(InitialiseScope::Unaddressed)).unwrap();

    assert_eq!(registry.counts(), (5, 1));
    assert_eq!(registry.long_at(AddressSpace::ControlGear, short(4)), Some(long(0x00_00_10)));
    // Existing addresses are untouched
    assert_eq!(registry.long_at(AddressSpace::ControlGear, short(0)), Some(long(0x00_3A_01)));
}
