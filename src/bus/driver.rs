//! DALI bus driver task.
//!
//! Owns the physical layer. Each loop iteration:
//!
//! 1. waits for a captured burst or a 1 ms poll tick
//! 2. decodes the burst and either matches it against the pending
//!    transmission (echo) or reports it as a received frame
//! 3. fails a pending transmission that never echoed (watchdog)
//! 4. starts the next queued transmission once the bus has been quiet for
//!    the settle time
//!
//! The pending-transmit descriptor lives here and nowhere else.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant, Timer};

use crate::bus::phy::BusPhy;
use crate::bus::{BusChannels, BusEvent, TxRequest};
use crate::protocol::codec::{self, DecodeError, Decoded, EchoMatch};
use crate::protocol::constants::{SETTLE_AFTER_BACKWARD, SETTLE_AFTER_FORWARD, TX_WATCHDOG};
use crate::protocol::frame::Frame;

/// Poll period for the transmit queue while no burst arrives
const TX_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct PendingTx {
    frame: Frame,
    started: Instant,
}

/// Bus driver state machine
pub struct BusDriver<'a, M: RawMutex, P: BusPhy> {
    channels: &'a BusChannels<M>,
    phy: P,
    pending: Option<PendingTx>,
    last_was_backward: bool,
    /// The next burst is the echo of our own break signal
    suppress_echo: bool,
}

impl<'a, M: RawMutex, P: BusPhy> BusDriver<'a, M, P> {
    pub fn new(channels: &'a BusChannels<M>, phy: P) -> Self {
        Self {
            channels,
            phy,
            pending: None,
            last_was_backward: false,
            suppress_echo: false,
        }
    }

    /// Run the driver forever.
    pub async fn run(&mut self) -> ! {
        dali_log!(info, "DALI bus driver started");
        loop {
            self.step().await;
        }
    }

    /// One iteration of the driver loop.
    pub async fn step(&mut self) {
        match select(self.channels.bursts.receive(), Timer::after(TX_POLL)).await {
            Either::First(burst) => self.process_burst(&burst),
            Either::Second(()) => {}
        }
        self.check_watchdog(Instant::now());
        self.service_tx_queue().await;
    }

    /// True while a transmission awaits its echo.
    pub fn is_transmitting(&self) -> bool {
        self.pending.is_some()
    }

    fn emit(&self, event: BusEvent) {
        if self.channels.events.try_send(event).is_err() {
            dali_log!(warn, "Bus event queue full, dropping {:?}", event);
        }
    }

    fn process_burst(&mut self, burst: &[codec::Pulse]) {
        let decoded = codec::decode(burst);
        if let Err(e) = self.phy.rearm_receive() {
            dali_log!(error, "Failed to re-arm receive capture: {:?}", e);
        }

        if self.suppress_echo {
            self.suppress_echo = false;
            return;
        }

        if let Some(pending) = self.pending {
            match codec::classify_echo(pending.frame, &decoded) {
                EchoMatch::Match => {
                    self.pending = None;
                    self.last_was_backward = pending.frame.is_backward();
                    self.emit(BusEvent::TxCompleted(pending.frame));
                }
                EchoMatch::Collision => {
                    self.pending = None;
                    dali_log!(debug, "Collision while sending {:#x}: {:?}", pending.frame.data(), decoded);
                    if decoded == Ok(Decoded::BusFailure) {
                        self.emit(BusEvent::BusFailure);
                    } else {
                        self.emit(BusEvent::CollisionDetected);
                    }
                }
                EchoMatch::NotAnEcho => {}
            }
            return;
        }

        match decoded {
            Ok(Decoded::Frame(frame)) => {
                self.last_was_backward = frame.is_backward();
                self.emit(BusEvent::FrameReceived(frame));
            }
            Ok(Decoded::Idle) => {}
            Ok(Decoded::BusFailure) => self.emit(BusEvent::BusFailure),
            Err(DecodeError::Length { data, bits }) => {
                dali_log!(debug, "Discarding non-standard {} bit frame {:#x}", bits, data);
            }
            Err(e) => self.emit(BusEvent::FrameError(e)),
        }
    }

    fn check_watchdog(&mut self, now: Instant) {
        if let Some(pending) = self.pending {
            if now.saturating_duration_since(pending.started) > Duration::from_micros(u64::from(TX_WATCHDOG)) {
                dali_log!(warn, "No echo for {:#x}, assuming collision", pending.frame.data());
                self.pending = None;
                self.emit(BusEvent::CollisionDetected);
            }
        }
    }

    fn settle_time_us(&self) -> u32 {
        if self.last_was_backward {
            SETTLE_AFTER_BACKWARD
        } else {
            SETTLE_AFTER_FORWARD
        }
    }

    async fn service_tx_queue(&mut self) {
        if self.pending.is_some() {
            return;
        }
        if self.channels.idle_for_us(Instant::now().as_micros()) < u64::from(self.settle_time_us()) {
            return;
        }
        let Ok(request) = self.channels.tx.try_receive() else {
            return;
        };

        match request {
            TxRequest::Frame(frame) => {
                let pulses = codec::encode(frame);
                self.pending = Some(PendingTx {
                    frame,
                    started: Instant::now(),
                });
                if let Err(e) = self.phy.transmit(&pulses).await {
                    dali_log!(error, "Transmit of {:#x} failed: {:?}", frame.data(), e);
                    self.pending = None;
                    self.emit(BusEvent::CollisionDetected);
                }
            }
            TxRequest::Break => {
                self.suppress_echo = true;
                if let Err(e) = self.phy.transmit(&codec::encode_break()).await {
                    dali_log!(error, "Break signal failed: {:?}", e);
                    self.suppress_echo = false;
                }
            }
        }
    }
}

impl<M: RawMutex, P: BusPhy> core::fmt::Debug for BusDriver<'_, M, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusDriver")
            .field("pending", &self.pending)
            .field("last_was_backward", &self.last_was_backward)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::loopback::{EchoMode, LoopbackPhy};
    use crate::protocol::codec::{coalesce, encode, Pulse, PulseBuffer};
    use crate::protocol::constants::T_TE;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type Channels = BusChannels<CriticalSectionRawMutex>;

    fn drain(channels: &Channels) -> std::vec::Vec<BusEvent> {
        core::iter::from_fn(|| channels.try_next_event()).collect()
    }

    /// Pretend the last edge was long ago so the first transmission may start.
    fn quiet_bus(channels: &Channels) {
        channels.record_edge(Instant::now().as_micros().wrapping_sub(20_000));
    }

    fn run_steps<P: BusPhy>(driver: &mut BusDriver<'_, CriticalSectionRawMutex, P>, steps: usize) {
        block_on(async {
            for _ in 0..steps {
                driver.step().await;
            }
        });
    }

    #[test]
    fn test_received_frame_is_reported() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Faithful));
        let frame = Frame::forward16(0xFF, 0x05);
        assert!(channels.post_burst(coalesce(&encode(frame))));

        run_steps(&mut driver, 1);
        assert_eq!(drain(&channels), [BusEvent::FrameReceived(frame)]);
    }

    #[test]
    fn test_transmit_echo_completes() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Faithful));
        quiet_bus(&channels);
        let frame = Frame::forward16(0x03, 0xA0);
        channels.tx.try_send(TxRequest::Frame(frame)).unwrap();

        run_steps(&mut driver, 2);
        assert!(!driver.is_transmitting());
        assert_eq!(drain(&channels), [BusEvent::TxCompleted(frame)]);
    }

    #[test]
    fn test_corrupted_echo_is_collision() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::FlipLastBit));
        quiet_bus(&channels);
        channels.tx.try_send(TxRequest::Frame(Frame::forward16(0x03, 0xA0))).unwrap();

        run_steps(&mut driver, 2);
        assert_eq!(drain(&channels), [BusEvent::CollisionDetected]);
    }

    #[test]
    fn test_stuck_line_during_transmit_is_bus_failure() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Silent));
        quiet_bus(&channels);
        channels.tx.try_send(TxRequest::Frame(Frame::forward16(0x03, 0xA0))).unwrap();
        run_steps(&mut driver, 1);
        assert!(driver.is_transmitting());

        let mut stuck = PulseBuffer::new();
        stuck.push(Pulse::active(600_000)).unwrap();
        assert!(channels.post_burst(stuck));
        run_steps(&mut driver, 1);
        assert!(!driver.is_transmitting());
        assert_eq!(drain(&channels), [BusEvent::BusFailure]);
    }

    #[test]
    fn test_missing_echo_trips_watchdog() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Silent));
        quiet_bus(&channels);
        channels.tx.try_send(TxRequest::Frame(Frame::forward16(0x03, 0xA0))).unwrap();

        run_steps(&mut driver, 1);
        assert!(driver.is_transmitting());
        block_on(Timer::after_millis(60));
        run_steps(&mut driver, 1);
        assert!(!driver.is_transmitting());
        assert_eq!(drain(&channels), [BusEvent::CollisionDetected]);
    }

    #[test]
    fn test_break_echo_is_suppressed() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Faithful));
        quiet_bus(&channels);
        channels.tx.try_send(TxRequest::Break).unwrap();

        run_steps(&mut driver, 2);
        assert!(drain(&channels).is_empty());
    }

    #[test]
    fn test_framing_error_and_bus_failure() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Faithful));

        let mut garbage = PulseBuffer::new();
        garbage.extend([Pulse::active(T_TE), Pulse::idle(T_TE), Pulse::active(620), Pulse::idle(5_000)]);
        assert!(channels.post_burst(garbage));
        run_steps(&mut driver, 1);

        let mut stuck = PulseBuffer::new();
        stuck.push(Pulse::active(600_000)).unwrap();
        assert!(channels.post_burst(stuck));
        run_steps(&mut driver, 1);

        assert_eq!(
            drain(&channels),
            [
                BusEvent::FrameError(DecodeError::Timing { duration_us: 620 }),
                BusEvent::BusFailure
            ]
        );
    }

    #[test]
    fn test_waits_for_settle_time() {
        let channels = Channels::new();
        let mut driver = BusDriver::new(&channels, LoopbackPhy::new(&channels, EchoMode::Faithful));
        channels.record_edge(Instant::now().as_micros());
        channels.tx.try_send(TxRequest::Frame(Frame::forward16(0xFF, 0x00))).unwrap();

        // Bus just went quiet, well under the settle time of one poll tick
        block_on(driver.service_tx_queue());
        assert!(!driver.is_transmitting());

        block_on(Timer::after_millis(6));
        run_steps(&mut driver, 2);
        assert_eq!(drain(&channels), [BusEvent::TxCompleted(Frame::forward16(0xFF, 0x00))]);
    }
}
