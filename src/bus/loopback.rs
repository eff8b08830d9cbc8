//! In-process physical layer that echoes every transmission back to the
//! driver, the way a real DALI line does.
//!
//! Used by the driver tests and available on hosts through the `std`
//! feature for simulation.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;

use crate::bus::phy::BusPhy;
use crate::bus::BusChannels;
use crate::error::Result;
use crate::protocol::codec::{self, Decoded, Pulse};
use crate::protocol::frame::Frame;

/// How the simulated line answers a transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// Echo exactly what was driven
    Faithful,
    /// Echo the frame with its least significant bit inverted (collision)
    FlipLastBit,
    /// Never echo (disconnected transceiver)
    Silent,
}

/// Loopback phy bound to a set of bus channels
pub struct LoopbackPhy<'a, M: RawMutex> {
    channels: &'a BusChannels<M>,
    mode: EchoMode,
    /// Frame echoes still to corrupt before `mode` applies again
    corrupt_remaining: usize,
    frames: std::vec::Vec<Frame>,
    breaks: usize,
}

impl<'a, M: RawMutex> LoopbackPhy<'a, M> {
    pub fn new(channels: &'a BusChannels<M>, mode: EchoMode) -> Self {
        Self {
            channels,
            mode,
            corrupt_remaining: 0,
            frames: std::vec::Vec::new(),
            breaks: 0,
        }
    }

    pub fn set_mode(&mut self, mode: EchoMode) {
        self.mode = mode;
    }

    /// Corrupt the echoes of the next `count` frames, then behave per mode.
    pub fn corrupt_next(&mut self, count: usize) {
        self.corrupt_remaining = count;
    }

    /// Frames driven onto the line so far.
    pub fn transmitted(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of break signals driven so far.
    pub fn breaks(&self) -> usize {
        self.breaks
    }
}

impl<M: RawMutex> BusPhy for LoopbackPhy<'_, M> {
    async fn transmit(&mut self, pulses: &[Pulse]) -> Result<()> {
        let line = codec::coalesce(pulses);
        let decoded = codec::decode(&line);
        match decoded {
            Ok(Decoded::Frame(frame)) => self.frames.push(frame),
            _ => self.breaks += 1,
        }

        let corrupt = self.corrupt_remaining > 0 || self.mode == EchoMode::FlipLastBit;
        let echo = match decoded {
            Ok(Decoded::Frame(frame)) if corrupt => {
                self.corrupt_remaining = self.corrupt_remaining.saturating_sub(1);
                let flipped = Frame::from_parts(frame.data() ^ 1, frame.length());
                codec::coalesce(&codec::encode(flipped))
            }
            _ if self.mode == EchoMode::Silent => return Ok(()),
            _ => line,
        };
        self.channels.record_edge(Instant::now().as_micros());
        if !self.channels.post_burst(echo) {
            dali_log!(warn, "Loopback echo dropped, burst queue full");
        }
        Ok(())
    }
}

impl<M: RawMutex> core::fmt::Debug for LoopbackPhy<'_, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackPhy")
            .field("mode", &self.mode)
            .field("frames", &self.frames)
            .field("breaks", &self.breaks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    #[test]
    fn test_records_frames_and_breaks() {
        let channels: BusChannels<CriticalSectionRawMutex> = BusChannels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::Silent);
        let frame = Frame::forward16(0x01, 0x90);
        block_on(phy.transmit(&codec::encode(frame))).unwrap();
        block_on(phy.transmit(&codec::encode_break())).unwrap();

        assert_eq!(phy.transmitted(), &[frame]);
        assert_eq!(phy.breaks(), 1);
        assert!(channels.bursts.try_receive().is_err());
    }

    #[test]
    fn test_flip_mode_corrupts_echo() {
        let channels: BusChannels<CriticalSectionRawMutex> = BusChannels::new();
        let mut phy = LoopbackPhy::new(&channels, EchoMode::FlipLastBit);
        block_on(phy.transmit(&codec::encode(Frame::forward16(0x01, 0x90)))).unwrap();

        let echo = channels.bursts.try_receive().unwrap();
        assert_eq!(
            codec::decode(&echo),
            Ok(Decoded::Frame(Frame::forward16(0x01, 0x91)))
        );
    }
}
