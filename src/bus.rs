//! Shared bus plumbing between the interrupt side, the driver task and the
//! transaction layer.
//!
//! ```text
//!  edge IRQ ──record_edge──┐
//!  capture  ──post_burst───┤
//!                          ▼
//!                    ┌───────────┐  events   ┌──────────────┐  outcome / replies
//!   tx requests ───▶ │ BusDriver │ ────────▶ │ event router │ ─────────────────▶ DriverLink
//!                    └───────────┘           └──────────────┘ ── sniffer ──────▶ Controller
//! ```
//!
//! [`BusChannels`] owns every queue and is meant to live in a `static`
//! (all constructors are `const`).

pub mod driver;
pub mod phy;

#[cfg(any(test, feature = "std"))]
pub mod loopback;

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::protocol::codec::{DecodeError, PulseBuffer};
use crate::protocol::constants::{
    BURST_QUEUE_DEPTH, EVENT_QUEUE_DEPTH, SNIFFER_QUEUE_DEPTH, TX_QUEUE_DEPTH,
};
use crate::protocol::frame::Frame;

pub use driver::BusDriver;
pub use phy::BusPhy;

/// One driver outcome per processed burst or transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// A frame sent by another bus participant
    FrameReceived(Frame),
    /// Our transmission echoed back unchanged
    TxCompleted(Frame),
    /// Our transmission was corrupted, or never echoed
    CollisionDetected,
    /// A burst that is not valid Manchester
    FrameError(DecodeError),
    /// The bus is held active
    BusFailure,
}

/// Work items for the driver's transmit queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxRequest {
    Frame(Frame),
    /// System-failure signal that makes every other transmitter back off
    Break,
}

/// Transmission result as seen by the transaction layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxOutcome {
    Completed,
    Collision,
    /// The line was held active instead of echoing
    BusFailure,
}

/// Queues and flags shared by the bus tasks
pub struct BusChannels<M: RawMutex> {
    pub(crate) bursts: Channel<M, PulseBuffer, BURST_QUEUE_DEPTH>,
    pub(crate) tx: Channel<M, TxRequest, TX_QUEUE_DEPTH>,
    pub(crate) events: Channel<M, BusEvent, EVENT_QUEUE_DEPTH>,
    pub(crate) outcome: Signal<M, TxOutcome>,
    pub(crate) replies: Channel<M, u8, 1>,
    pub(crate) expecting_reply: AtomicBool,
    pub(crate) sniffer: Channel<M, Frame, SNIFFER_QUEUE_DEPTH>,
    /// Microsecond timestamp of the last edge
    last_edge_us: BlockingMutex<M, Cell<u64>>,
}

impl<M: RawMutex> BusChannels<M> {
    pub const fn new() -> Self {
        Self {
            bursts: Channel::new(),
            tx: Channel::new(),
            events: Channel::new(),
            outcome: Signal::new(),
            replies: Channel::new(),
            expecting_reply: AtomicBool::new(false),
            sniffer: Channel::new(),
            last_edge_us: BlockingMutex::new(Cell::new(0)),
        }
    }

    /// Record a line edge. Safe to call from interrupt context when `M` is
    /// `CriticalSectionRawMutex`.
    #[inline]
    pub fn record_edge(&self, now_us: u64) {
        self.last_edge_us.lock(|last| last.set(now_us));
    }

    /// Hand a completed receive burst to the driver without blocking.
    ///
    /// Returns `false` if the driver is behind and the burst was dropped.
    #[inline]
    pub fn post_burst(&self, burst: PulseBuffer) -> bool {
        self.bursts.try_send(burst).is_ok()
    }

    /// Microseconds since the last recorded edge.
    #[inline]
    pub fn idle_for_us(&self, now_us: u64) -> u64 {
        now_us.wrapping_sub(self.last_edge_us.lock(Cell::get))
    }

    /// Wait for the next forward frame sent by another bus master.
    pub async fn next_sniffed_frame(&self) -> Frame {
        self.sniffer.receive().await
    }

    /// Take a raw driver event, bypassing the event router.
    pub fn try_next_event(&self) -> Option<BusEvent> {
        self.events.try_receive().ok()
    }
}

impl<M: RawMutex> Default for BusChannels<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> fmt::Debug for BusChannels<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusChannels")
            .field("expecting_reply", &self.expecting_reply.load(Ordering::Relaxed))
            .field("last_edge_us", &self.last_edge_us.lock(Cell::get))
            .finish_non_exhaustive()
    }
}
