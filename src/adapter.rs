//! Transaction layer between application logic and the bus driver.
//!
//! ## Architecture
//!
//! ```text
//! Controller / Commissioner
//!          │ transaction()
//!          ▼
//!    ┌─────────────┐  lock   ┌──────────────┐
//!    │ DaliAdapter │ ──────▶ │ BusTransport │  DriverLink (bus driver) or MockBus (tests)
//!    └─────────────┘         └──────────────┘
//! ```
//!
//! A [`Transaction`] holds the adapter lock for its whole lifetime, so a
//! multi-frame exchange (set DTR, enable device type, command, query) can
//! never interleave with another task's frames.

pub mod link;
pub mod mock_bus;

use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Timer};

use crate::addressing::{GroupId, LongAddress, SceneId, ShortAddress, Target};
use crate::bus::{BusChannels, BusEvent, TxOutcome};
use crate::error::Result;
use crate::protocol::commands::{
    colour_selector, Command, Dt8, InputCommand, InputSpecial, Special, ADD_TO_GROUP,
    DEVICE_TYPE_COLOUR, FEATURE_RGBWAF_MASK, FEATURE_TC, GO_TO_SCENE, INPUT_SPECIAL,
    INSTANCE_DEVICE, QUERY_SCENE_LEVEL, REMOVE_FROM_GROUP, REMOVE_FROM_SCENE, SET_SCENE,
};
use crate::protocol::constants::SEND_TWICE_GAP_MS;
use crate::protocol::frame::Frame;

pub use link::DriverLink;
pub use mock_bus::MockBus;

/// Memory bank 0 offset of the 6-byte GTIN
const GTIN_OFFSET: u8 = 0x03;
const GTIN_LEN: u8 = 6;

/// Frame-level access to a DALI bus.
///
/// `send_raw` returns once the frame has been seen on the bus;
/// `send_query` additionally waits for a backward frame.
#[allow(async_fn_in_trait, reason = "Futures run on a single-threaded executor and need not be Send")]
pub trait BusTransport {
    /// Transmit one forward frame.
    ///
    /// # Errors
    ///
    /// Returns a bus error when the frame could not be placed on the bus
    /// (persistent collisions, full queue) and [`DaliError::Timeout`]
    /// when the driver never reports an outcome.
    ///
    /// [`DaliError::Timeout`]: crate::error::DaliError::Timeout
    async fn send_raw(&mut self, frame: Frame) -> Result<()>;

    /// Transmit a query and wait for its answer.
    ///
    /// `Ok(None)` means no device answered in time, which is a normal
    /// outcome for most queries.
    async fn send_query(&mut self, frame: Frame) -> Result<Option<u8>>;
}

/// DT8 colour features reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ColourCapability {
    pub tunable_white: bool,
    pub rgb: bool,
}

impl ColourCapability {
    pub const fn from_features(features: u8) -> Self {
        Self {
            tunable_white: features & FEATURE_TC != 0,
            rgb: features & FEATURE_RGBWAF_MASK != 0,
        }
    }

    pub const fn any(self) -> bool {
        self.tunable_white || self.rgb
    }
}

// =============================================================================
// Event routing
// =============================================================================

impl<M: RawMutex> BusChannels<M> {
    /// Distribute driver events forever.
    pub async fn route_events(&self) -> ! {
        loop {
            let event = self.events.receive().await;
            self.route_event(event);
        }
    }

    /// Hand one driver event to its consumer.
    pub fn route_event(&self, event: BusEvent) {
        match event {
            BusEvent::TxCompleted(_) => self.outcome.signal(TxOutcome::Completed),
            BusEvent::CollisionDetected => self.outcome.signal(TxOutcome::Collision),
            BusEvent::FrameReceived(frame) if frame.is_backward() => {
                if self.expecting_reply.swap(false, Ordering::AcqRel) {
                    // Slot was flushed when the query started
                    let _ = self.replies.try_send(frame.data() as u8);
                } else {
                    dali_log!(debug, "Unsolicited backward frame {:#x}", frame.data());
                }
            }
            BusEvent::FrameReceived(frame) => {
                if self.sniffer.try_send(frame).is_err() {
                    dali_log!(warn, "Sniffer queue full, dropping {:#x}", frame.data());
                }
            }
            BusEvent::FrameError(e) => dali_log!(debug, "Framing error on bus: {:?}", e),
            BusEvent::BusFailure => {
                dali_log!(error, "DALI bus failure (line held low)");
                self.outcome.signal(TxOutcome::BusFailure);
            }
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Serialises access to a [`BusTransport`]
pub struct DaliAdapter<M: RawMutex, T: BusTransport> {
    transport: Mutex<M, T>,
}

impl<M: RawMutex, T: BusTransport> DaliAdapter<M, T> {
    pub const fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    /// Take the bus for one logical operation.
    pub async fn transaction(&self) -> Transaction<'_, M, T> {
        Transaction {
            bus: self.transport.lock().await,
        }
    }

    /// Send a single frame in its own transaction.
    pub async fn send_raw(&self, frame: Frame) -> Result<()> {
        self.transaction().await.send_raw(frame).await
    }

    /// Send a single query in its own transaction.
    pub async fn send_query(&self, frame: Frame) -> Result<Option<u8>> {
        self.transaction().await.send_query(frame).await
    }
}

impl<M: RawMutex, T: BusTransport> core::fmt::Debug for DaliAdapter<M, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DaliAdapter").finish_non_exhaustive()
    }
}

/// Exclusive bus access; released on drop
pub struct Transaction<'a, M: RawMutex, T: BusTransport> {
    bus: MutexGuard<'a, M, T>,
}

impl<M: RawMutex, T: BusTransport> core::fmt::Debug for Transaction<'_, M, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl<M: RawMutex, T: BusTransport> Transaction<'_, M, T> {
    /// Direct access to the transport, for tests and diagnostics.
    pub fn transport(&mut self) -> &mut T {
        &mut self.bus
    }

    pub async fn send_raw(&mut self, frame: Frame) -> Result<()> {
        self.bus.send_raw(frame).await
    }

    pub async fn send_query(&mut self, frame: Frame) -> Result<Option<u8>> {
        self.bus.send_query(frame).await
    }

    async fn send_twice(&mut self, frame: Frame) -> Result<()> {
        self.send_raw(frame).await?;
        Timer::after(Duration::from_millis(SEND_TWICE_GAP_MS)).await;
        self.send_raw(frame).await
    }

    // -------------------------------------------------------------------------
    // Control gear
    // -------------------------------------------------------------------------

    /// Direct arc power control.
    pub async fn set_level(&mut self, target: Target, level: u8) -> Result<()> {
        self.send_raw(Frame::arc_power(target, level)).await
    }

    pub async fn command(&mut self, target: Target, command: Command) -> Result<()> {
        self.command_opcode(target, command as u8).await
    }

    /// Send an opcode without a [`Command`] variant (scene and group ranges).
    pub async fn command_opcode(&mut self, target: Target, opcode: u8) -> Result<()> {
        self.send_raw(Frame::command(target, opcode)).await
    }

    /// Send a configuration command twice, as the standard requires.
    pub async fn command_twice(&mut self, target: Target, command: Command) -> Result<()> {
        self.send_twice(Frame::command(target, command as u8)).await
    }

    pub async fn query(&mut self, short: ShortAddress, command: Command) -> Result<Option<u8>> {
        self.query_opcode(short, command as u8).await
    }

    async fn query_opcode(&mut self, short: ShortAddress, opcode: u8) -> Result<Option<u8>> {
        self.send_query(Frame::command(Target::Short(short), opcode)).await
    }

    pub async fn special(&mut self, op: Special, data: u8) -> Result<()> {
        self.send_raw(Frame::forward16(op as u8, data)).await
    }

    pub async fn special_twice(&mut self, op: Special, data: u8) -> Result<()> {
        self.send_twice(Frame::forward16(op as u8, data)).await
    }

    /// Special command that expects an answer (`COMPARE`, `VERIFY SHORT ADDRESS`).
    pub async fn special_query(&mut self, op: Special, data: u8) -> Result<Option<u8>> {
        self.send_query(Frame::forward16(op as u8, data)).await
    }

    pub async fn set_dtr0(&mut self, value: u8) -> Result<()> {
        self.special(Special::Dtr0, value).await
    }

    pub async fn set_dtr1(&mut self, value: u8) -> Result<()> {
        self.special(Special::Dtr1, value).await
    }

    pub async fn set_dtr2(&mut self, value: u8) -> Result<()> {
        self.special(Special::Dtr2, value).await
    }

    // -------------------------------------------------------------------------
    // Input devices
    // -------------------------------------------------------------------------

    pub async fn input_command(&mut self, short: ShortAddress, command: InputCommand) -> Result<()> {
        self.send_raw(Self::input_frame(short, command)).await
    }

    pub async fn input_query(&mut self, short: ShortAddress, command: InputCommand) -> Result<Option<u8>> {
        self.send_query(Self::input_frame(short, command)).await
    }

    pub async fn input_special(&mut self, op: InputSpecial, data: u8) -> Result<()> {
        self.send_raw(Frame::forward24(INPUT_SPECIAL, op as u8, data)).await
    }

    pub async fn input_special_query(&mut self, op: InputSpecial, data: u8) -> Result<Option<u8>> {
        self.send_query(Frame::forward24(INPUT_SPECIAL, op as u8, data)).await
    }

    fn input_frame(short: ShortAddress, command: InputCommand) -> Frame {
        Frame::forward24(Target::Short(short).address_byte(true), INSTANCE_DEVICE, command as u8)
    }

    // -------------------------------------------------------------------------
    // DT8 colour control
    // -------------------------------------------------------------------------

    async fn enable_colour(&mut self) -> Result<()> {
        self.special(Special::EnableDeviceType, DEVICE_TYPE_COLOUR).await
    }

    async fn colour_command(&mut self, target: Target, op: Dt8) -> Result<()> {
        self.enable_colour().await?;
        self.command_opcode(target, op as u8).await
    }

    /// Set and activate a colour temperature in mirek.
    pub async fn set_colour_temperature(&mut self, target: Target, mirek: u16) -> Result<()> {
        let [msb, lsb] = mirek.to_be_bytes();
        self.set_dtr1(msb).await?;
        self.set_dtr0(lsb).await?;
        self.colour_command(target, Dt8::SetTemporaryColourTemperature).await?;
        self.colour_command(target, Dt8::Activate).await
    }

    pub async fn set_rgb(&mut self, target: Target, red: u8, green: u8, blue: u8) -> Result<()> {
        self.set_dtr0(red).await?;
        self.set_dtr1(green).await?;
        self.set_dtr2(blue).await?;
        self.colour_command(target, Dt8::SetTemporaryRgbDimLevel).await?;
        self.colour_command(target, Dt8::Activate).await
    }

    pub async fn query_colour_capability(&mut self, short: ShortAddress) -> Result<Option<ColourCapability>> {
        self.enable_colour().await?;
        let features = self.query_opcode(short, Dt8::QueryColourTypeFeatures as u8).await?;
        Ok(features.map(ColourCapability::from_features))
    }

    /// `QUERY COLOUR VALUE` for `selector`; returns the answer byte.
    ///
    /// For 16-bit quantities the answer is the MSB and the device leaves the
    /// LSB in DTR0.
    pub async fn query_colour_value(&mut self, short: ShortAddress, selector: u8) -> Result<Option<u8>> {
        self.set_dtr0(selector).await?;
        self.enable_colour().await?;
        self.query_opcode(short, Dt8::QueryColourValue as u8).await
    }

    /// Current colour temperature in mirek, `None` if unknown.
    pub async fn query_colour_temperature(&mut self, short: ShortAddress) -> Result<Option<u16>> {
        let Some(msb) = self
            .query_colour_value(short, colour_selector::COLOUR_TEMPERATURE)
            .await?
        else {
            return Ok(None);
        };
        let Some(lsb) = self.query(short, Command::QueryContentDtr0).await? else {
            return Ok(None);
        };
        let mirek = u16::from_be_bytes([msb, lsb]);
        Ok((mirek != u16::MAX).then_some(mirek))
    }

    pub async fn query_rgb(&mut self, short: ShortAddress) -> Result<Option<(u8, u8, u8)>> {
        let red = self.query_colour_value(short, colour_selector::RED).await?;
        let green = self.query_colour_value(short, colour_selector::GREEN).await?;
        let blue = self.query_colour_value(short, colour_selector::BLUE).await?;
        Ok(match (red, green, blue) {
            (Some(r), Some(g), Some(b)) => Some((r, g, b)),
            _ => None,
        })
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Read back the 24-bit random address of a control gear.
    pub async fn query_long_address(&mut self, short: ShortAddress) -> Result<Option<LongAddress>> {
        let high = self.query(short, Command::QueryRandomAddressH).await?;
        let mid = self.query(short, Command::QueryRandomAddressM).await?;
        let low = self.query(short, Command::QueryRandomAddressL).await?;
        Ok(match (high, mid, low) {
            (Some(h), Some(m), Some(l)) => Some(LongAddress::from_bytes(h, m, l)),
            _ => None,
        })
    }

    pub async fn query_input_long_address(&mut self, short: ShortAddress) -> Result<Option<LongAddress>> {
        let high = self.input_query(short, InputCommand::QueryRandomAddressH).await?;
        let mid = self.input_query(short, InputCommand::QueryRandomAddressM).await?;
        let low = self.input_query(short, InputCommand::QueryRandomAddressL).await?;
        Ok(match (high, mid, low) {
            (Some(h), Some(m), Some(l)) => Some(LongAddress::from_bytes(h, m, l)),
            _ => None,
        })
    }

    pub async fn read_memory(&mut self, short: ShortAddress, bank: u8, offset: u8) -> Result<Option<u8>> {
        self.set_dtr1(bank).await?;
        self.set_dtr0(offset).await?;
        self.query(short, Command::ReadMemoryLocation).await
    }

    /// GTIN from memory bank 0 as 12 uppercase hex digits.
    pub async fn query_gtin(&mut self, short: ShortAddress) -> Result<Option<heapless::String<16>>> {
        use core::fmt::Write;

        let mut gtin = heapless::String::new();
        for offset in GTIN_OFFSET..GTIN_OFFSET + GTIN_LEN {
            let Some(byte) = self.read_memory(short, 0, offset).await? else {
                return Ok(None);
            };
            // 12 digits always fit
            let _ = write!(gtin, "{byte:02X}");
        }
        Ok(Some(gtin))
    }

    // -------------------------------------------------------------------------
    // Groups and scenes
    // -------------------------------------------------------------------------

    pub async fn add_to_group(&mut self, short: ShortAddress, group: GroupId) -> Result<()> {
        self.send_twice(Frame::command(Target::Short(short), ADD_TO_GROUP + group.value()))
            .await
    }

    pub async fn remove_from_group(&mut self, short: ShortAddress, group: GroupId) -> Result<()> {
        self.send_twice(Frame::command(Target::Short(short), REMOVE_FROM_GROUP + group.value()))
            .await
    }

    /// Group membership mask (bit n = group n).
    pub async fn query_groups(&mut self, short: ShortAddress) -> Result<Option<u16>> {
        let low = self.query(short, Command::QueryGroups0To7).await?;
        let high = self.query(short, Command::QueryGroups8To15).await?;
        Ok(match (low, high) {
            (Some(l), Some(h)) => Some(u16::from_le_bytes([l, h])),
            _ => None,
        })
    }

    /// Store `level` as the scene level of every addressed device.
    pub async fn store_scene(&mut self, target: Target, scene: SceneId, level: u8) -> Result<()> {
        self.set_dtr0(level).await?;
        self.send_twice(Frame::command(target, SET_SCENE + scene.value())).await
    }

    pub async fn remove_scene(&mut self, target: Target, scene: SceneId) -> Result<()> {
        self.send_twice(Frame::command(target, REMOVE_FROM_SCENE + scene.value()))
            .await
    }

    pub async fn go_to_scene(&mut self, target: Target, scene: SceneId) -> Result<()> {
        self.command_opcode(target, GO_TO_SCENE + scene.value()).await
    }

    pub async fn query_scene_level(&mut self, short: ShortAddress, scene: SceneId) -> Result<Option<u8>> {
        self.query_opcode(short, QUERY_SCENE_LEVEL + scene.value()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::AddressSpace;
    use crate::adapter::mock_bus::SimGear;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type Adapter = DaliAdapter<CriticalSectionRawMutex, MockBus>;

    fn short(n: u8) -> ShortAddress {
        ShortAddress::new(n).unwrap()
    }

    fn bus_with_gear() -> MockBus {
        let mut bus = MockBus::new();
        bus.add_gear(SimGear::new(LongAddress::new(0x12_3456).unwrap()).with_short(3));
        bus
    }

    #[test]
    fn test_router_delivers_expected_reply_only() {
        let channels: BusChannels<CriticalSectionRawMutex> = BusChannels::new();
        channels.route_event(BusEvent::FrameReceived(Frame::backward(0x11)));
        assert!(channels.replies.try_receive().is_err());

        channels.expecting_reply.store(true, Ordering::Release);
        channels.route_event(BusEvent::FrameReceived(Frame::backward(0x22)));
        assert_eq!(channels.replies.try_receive(), Ok(0x22));
        assert!(!channels.expecting_reply.load(Ordering::Acquire));
    }

    #[test]
    fn test_router_forwards_to_sniffer_and_signals_outcome() {
        let channels: BusChannels<CriticalSectionRawMutex> = BusChannels::new();
        let frame = Frame::forward16(0xFE, 0x80);
        channels.route_event(BusEvent::FrameReceived(frame));
        assert_eq!(channels.sniffer.try_receive(), Ok(frame));

        channels.route_event(BusEvent::CollisionDetected);
        assert_eq!(channels.outcome.try_take(), Some(TxOutcome::Collision));
        channels.route_event(BusEvent::TxCompleted(frame));
        assert_eq!(channels.outcome.try_take(), Some(TxOutcome::Completed));
        channels.route_event(BusEvent::BusFailure);
        assert_eq!(channels.outcome.try_take(), Some(TxOutcome::BusFailure));
    }

    #[test]
    fn test_colour_capability_bits() {
        assert_eq!(
            ColourCapability::from_features(0x02),
            ColourCapability { tunable_white: true, rgb: false }
        );
        assert!(ColourCapability::from_features(0x60).rgb);
        assert!(!ColourCapability::from_features(0x00).any());
    }

    #[test]
    fn test_query_long_address() {
        let adapter = Adapter::new(bus_with_gear());
        let long = block_on(async { adapter.transaction().await.query_long_address(short(3)).await }).unwrap();
        assert_eq!(long, Some(LongAddress::new(0x12_3456).unwrap()));

        let missing = block_on(async { adapter.transaction().await.query_long_address(short(4)).await }).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_set_colour_temperature_sequence() {
        let adapter = Adapter::new(MockBus::new());
        block_on(async {
            adapter
                .transaction()
                .await
                .set_colour_temperature(Target::Short(short(1)), 0x0172)
                .await
        })
        .unwrap();

        let sent: std::vec::Vec<u32> = block_on(adapter.transaction())
            .transport()
            .sent()
            .map(|f| f.data())
            .collect();
        assert_eq!(sent, [0xC301, 0xA372, 0xC108, 0x03E7, 0xC108, 0x03E2]);
    }

    #[test]
    fn test_gtin_read_from_memory_bank() {
        let mut bus = MockBus::new();
        bus.add_gear(
            SimGear::new(LongAddress::new(1).unwrap())
                .with_short(0)
                .with_gtin([0x04, 0x01, 0x23, 0x45, 0x67, 0x89]),
        );
        let adapter = Adapter::new(bus);
        let gtin = block_on(async { adapter.transaction().await.query_gtin(short(0)).await }).unwrap();
        assert_eq!(gtin.as_deref(), Some("040123456789"));
    }

    #[test]
    fn test_group_membership_round_trip() {
        let adapter = Adapter::new(bus_with_gear());
        block_on(async {
            let mut tx = adapter.transaction().await;
            tx.add_to_group(short(3), GroupId::new(2).unwrap()).await?;
            tx.add_to_group(short(3), GroupId::new(9).unwrap()).await?;
            tx.remove_from_group(short(3), GroupId::new(2).unwrap()).await?;
            assert_eq!(tx.query_groups(short(3)).await?, Some(1 << 9));
            Ok::<(), crate::error::DaliError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_scene_store_and_query() {
        let adapter = Adapter::new(bus_with_gear());
        let scene = SceneId::new(4).unwrap();
        let level = block_on(async {
            let mut tx = adapter.transaction().await;
            tx.store_scene(Target::Broadcast, scene, 120).await?;
            tx.query_scene_level(short(3), scene).await
        })
        .unwrap();
        assert_eq!(level, Some(120));
    }

    #[test]
    fn test_input_device_status_query() {
        let mut bus = MockBus::new();
        bus.add_input(LongAddress::new(0xABCDEF).unwrap(), Some(7));
        let adapter = Adapter::new(bus);
        let (status, long) = block_on(async {
            let mut tx = adapter.transaction().await;
            let status = tx.input_query(short(7), InputCommand::QueryDeviceStatus).await?;
            let long = tx.query_input_long_address(short(7)).await?;
            Ok::<_, crate::error::DaliError>((status, long))
        })
        .unwrap();
        assert!(status.is_some());
        assert_eq!(long, Some(LongAddress::new(0xABCDEF).unwrap()));
        assert_eq!(block_on(adapter.transaction()).transport().device_count(AddressSpace::InputDevice), 1);
    }
}
