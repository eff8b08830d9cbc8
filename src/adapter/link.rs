//! Production [`BusTransport`] on top of the bus driver queues.
//!
//! Collision handling follows IEC 62386-101: after a collision the
//! transmitter sends a break, backs off for a priority-dependent time plus
//! jitter and retries.

use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{with_timeout, Duration, Timer};
use rand_core::RngCore;

use crate::adapter::BusTransport;
use crate::bus::{BusChannels, TxOutcome, TxRequest};
use crate::error::{DaliError, Result};
use crate::protocol::constants::{MAX_TX_ATTEMPTS, REPLY_TIMEOUT_MS, TX_OUTCOME_TIMEOUT_MS, TX_PRIORITY};
use crate::protocol::frame::Frame;

const OUTCOME_TIMEOUT: Duration = Duration::from_millis(TX_OUTCOME_TIMEOUT_MS);
const REPLY_TIMEOUT: Duration = Duration::from_millis(REPLY_TIMEOUT_MS);

/// Transport that queues frames for a [`BusDriver`](crate::bus::BusDriver)
pub struct DriverLink<'a, M: RawMutex, R: RngCore> {
    channels: &'a BusChannels<M>,
    rng: R,
}

impl<'a, M: RawMutex, R: RngCore> DriverLink<'a, M, R> {
    pub fn new(channels: &'a BusChannels<M>, rng: R) -> Self {
        Self { channels, rng }
    }

    fn backoff(&mut self) -> Duration {
        Duration::from_millis(u64::from(TX_PRIORITY) * 2 + u64::from(self.rng.next_u32() % 4))
    }
}

impl<M: RawMutex, R: RngCore> BusTransport for DriverLink<'_, M, R> {
    async fn send_raw(&mut self, frame: Frame) -> Result<()> {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            self.channels.outcome.reset();
            if self.channels.tx.try_send(TxRequest::Frame(frame)).is_err() {
                return Err(DaliError::queue_full());
            }

            match with_timeout(OUTCOME_TIMEOUT, self.channels.outcome.wait()).await {
                Ok(TxOutcome::Completed) => return Ok(()),
                Ok(TxOutcome::Collision) => {
                    dali_log!(debug, "Collision on {:#x} (attempt {})", frame.data(), attempt);
                    if self.channels.tx.try_send(TxRequest::Break).is_err() {
                        dali_log!(warn, "Transmit queue full, break not sent");
                    }
                    if attempt < MAX_TX_ATTEMPTS {
                        Timer::after(self.backoff()).await;
                    }
                }
                Ok(TxOutcome::BusFailure) => return Err(DaliError::bus_failure()),
                Err(_) => {
                    dali_log!(warn, "No transmit outcome for {:#x}", frame.data());
                    return Err(DaliError::Timeout);
                }
            }
        }
        dali_log!(warn, "Giving up on {:#x} after {} collisions", frame.data(), MAX_TX_ATTEMPTS);
        Err(DaliError::collision())
    }

    async fn send_query(&mut self, frame: Frame) -> Result<Option<u8>> {
        while self.channels.replies.try_receive().is_ok() {}
        self.channels.expecting_reply.store(true, Ordering::Release);

        let reply = match self.send_raw(frame).await {
            Ok(()) => with_timeout(REPLY_TIMEOUT, self.channels.replies.receive()).await.ok(),
            Err(e) => {
                self.channels.expecting_reply.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.channels.expecting_reply.store(false, Ordering::Release);
        Ok(reply)
    }
}

impl<M: RawMutex, R: RngCore> core::fmt::Debug for DriverLink<'_, M, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::loopback::{EchoMode, LoopbackPhy};
    use crate::bus::{BusDriver, BusEvent};
    use embassy_futures::block_on;
    use embassy_futures::select::{select3, Either3};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_time::Instant;

    type Channels = BusChannels<CriticalSectionRawMutex>;

    /// Deterministic jitter source
    struct CountingRng(u32);

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0
        }

        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_u32(self)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> core::result::Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    /// Run `send_raw` against a real driver on a loopback line.
    fn send_over_loopback(channels: &Channels, phy: &mut LoopbackPhy<'_, CriticalSectionRawMutex>, frame: Frame) -> Result<()> {
        channels.record_edge(Instant::now().as_micros().wrapping_sub(20_000));
        let mut driver = BusDriver::new(channels, phy);
        let mut link = DriverLink::new(channels, CountingRng(0));
        block_on(async {
            match select3(driver.run(), channels.route_events(), link.send_raw(frame)).await {
                Either3::First(never) | Either3::Second(never) => never,
                Either3::Third(result) => result,
            }
        })
    }

    #[test]
    fn test_send_completes_on_echo() {
        let channels = Channels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::Faithful);
        let frame = Frame::forward16(0xFE, 0xFE);

        assert!(send_over_loopback(&channels, &mut phy, frame).is_ok());
        assert_eq!(phy.transmitted(), &[frame]);
        assert_eq!(phy.breaks(), 0);
    }

    #[test]
    fn test_retry_after_collision() {
        let channels = Channels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::Faithful);
        phy.corrupt_next(1);
        let frame = Frame::forward16(0x01, 0x05);

        assert!(send_over_loopback(&channels, &mut phy, frame).is_ok());
        assert_eq!(phy.transmitted(), &[frame, frame]);
        assert_eq!(phy.breaks(), 1);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let channels = Channels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::FlipLastBit);
        let frame = Frame::forward16(0x01, 0x05);

        let err = send_over_loopback(&channels, &mut phy, frame).unwrap_err();
        assert!(matches!(err, DaliError::Bus(ref e) if e.is_collision()));
        assert_eq!(phy.transmitted().len(), usize::from(MAX_TX_ATTEMPTS));
    }

    #[test]
    fn test_timeout_is_not_retried() {
        let channels = Channels::new();
        let mut link = DriverLink::new(&channels, CountingRng(0));

        let result = block_on(link.send_raw(Frame::forward16(0xFF, 0x00)));
        assert!(matches!(result, Err(DaliError::Timeout)));
        // Nobody drained the queue: exactly one request was made
        assert_eq!(channels.tx.len(), 1);
    }

    #[test]
    fn test_bus_failure_is_not_retried() {
        let channels = Channels::new();
        let mut link = DriverLink::new(&channels, CountingRng(0));
        let frame = Frame::forward16(0xFE, 0x80);

        let responder = async {
            channels.tx.receive().await;
            channels.route_event(BusEvent::BusFailure);
            core::future::pending::<()>().await;
        };
        let result = block_on(async {
            match embassy_futures::select::select(responder, link.send_raw(frame)).await {
                embassy_futures::select::Either::First(()) => unreachable!(),
                embassy_futures::select::Either::Second(result) => result,
            }
        });
        let err = result.unwrap_err();
        assert!(matches!(err, DaliError::Bus(ref e) if e.is_bus_failure()));
        assert!(!err.is_transient());
        // Neither a break nor a second attempt was queued
        assert!(channels.tx.is_empty());
    }

    #[test]
    fn test_query_receives_reply() {
        let channels = Channels::new();
        let mut link = DriverLink::new(&channels, CountingRng(0));
        let query = Frame::forward16(0x07, 0x90);

        let responder = async {
            let request = channels.tx.receive().await;
            assert_eq!(request, TxRequest::Frame(query));
            channels.route_event(BusEvent::TxCompleted(query));
            channels.route_event(BusEvent::FrameReceived(Frame::backward(0x42)));
            core::future::pending::<()>().await;
        };
        let reply = block_on(async {
            match embassy_futures::select::select(responder, link.send_query(query)).await {
                embassy_futures::select::Either::First(()) => unreachable!(),
                embassy_futures::select::Either::Second(reply) => reply,
            }
        });
        assert_eq!(reply.unwrap(), Some(0x42));
        assert!(!channels.expecting_reply.load(Ordering::Acquire));
    }

    #[test]
    fn test_query_without_answer() {
        let channels = Channels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::Faithful);
        channels.record_edge(Instant::now().as_micros().wrapping_sub(20_000));
        let mut driver = BusDriver::new(&channels, &mut phy);
        let mut link = DriverLink::new(&channels, CountingRng(0));

        let reply = block_on(async {
            match select3(driver.run(), channels.route_events(), link.send_query(Frame::forward16(0x07, 0x90))).await {
                Either3::First(never) | Either3::Second(never) => never,
                Either3::Third(result) => result,
            }
        });
        assert_eq!(reply.unwrap(), None);
        assert!(!channels.expecting_reply.load(Ordering::Acquire));
    }
}
