//! Manchester codec between logical frames and line pulses.
//!
//! ## Line encoding
//!
//! ```text
//!            start   bit=1   bit=0   stop
//! active   ┌───┐   ┌───┐       ┌───┐
//! idle   ──┘   └───┘   └───────┘   └───────
//!          |TE |TE |TE |TE |TE |TE | 2TE |
//! ```
//!
//! The encoder emits one pulse per half-bit; on the wire adjacent pulses of
//! the same level merge, so the decoder accepts pulses of one or two
//! half-bit periods.
//!
//! Decoding is pure and allocation free, shared by the transactional receive
//! path (echo comparison) and the sniffer.

use crate::protocol::constants::{
    MAX_DECODED_BITS, MAX_PULSES, T_2TE_MAX, T_2TE_MIN, T_BREAK_ACTIVE, T_BUS_FAILURE_MIN, T_TE,
    T_TE_MAX, T_TE_MIN,
};
use crate::protocol::frame::{Frame, FrameLength};

/// Logical line level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Bus voltage present (logical high, no current sunk)
    Idle,
    /// Bus pulled low by a transmitter
    Active,
}

/// A line level held for a duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pulse {
    pub level: Level,
    pub duration_us: u32,
}

impl Pulse {
    #[inline]
    pub const fn active(duration_us: u32) -> Self {
        Self {
            level: Level::Active,
            duration_us,
        }
    }

    #[inline]
    pub const fn idle(duration_us: u32) -> Self {
        Self {
            level: Level::Idle,
            duration_us,
        }
    }
}

/// Fixed-capacity pulse sequence (one captured burst or one encoded frame)
pub type PulseBuffer = heapless::Vec<Pulse, MAX_PULSES>;

/// Successful decoder outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decoded {
    Frame(Frame),
    /// Nothing but idle line: no frame, not an error
    Idle,
    /// The line was held active far longer than a bit period
    BusFailure,
}

/// Framing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// A pulse outside both tolerance bands
    Timing { duration_us: u32 },
    /// The burst does not begin with an active-then-idle start bit
    MissingStart,
    /// Two active half-bits in one bit cell
    Phase,
    /// Well-formed Manchester, but not 8, 16 or 24 bits
    Length { data: u32, bits: u8 },
}

/// Outcome of comparing a received burst against the pending transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EchoMatch {
    /// Exact echo of what was sent
    Match,
    /// Different bits or length, or a framing error: another transmitter was active
    Collision,
    /// Idle noise; keep waiting for the echo
    NotAnEcho,
}

const MAX_HALF_BITS: usize = 2 + 2 * MAX_DECODED_BITS as usize;

// =============================================================================
// Encoder
// =============================================================================

/// Encode a frame into half-bit pulses, including start bit and stop condition.
pub fn encode(frame: Frame) -> PulseBuffer {
    let mut out = PulseBuffer::new();
    // 2 + 2 * 24 + 1 pulses always fit in MAX_PULSES
    let _ = out.push(Pulse::active(T_TE));
    let _ = out.push(Pulse::idle(T_TE));
    for bit in (0..frame.bits()).rev() {
        let (first, second) = if (frame.data() >> bit) & 1 == 1 {
            (Pulse::active(T_TE), Pulse::idle(T_TE))
        } else {
            (Pulse::idle(T_TE), Pulse::active(T_TE))
        };
        let _ = out.push(first);
        let _ = out.push(second);
    }
    let _ = out.push(Pulse::idle(2 * T_TE));
    out
}

/// System-failure signal sent after a detected collision.
pub fn encode_break() -> PulseBuffer {
    let mut out = PulseBuffer::new();
    let _ = out.push(Pulse::active(T_BREAK_ACTIVE));
    let _ = out.push(Pulse::idle(T_TE));
    out
}

/// Merge adjacent pulses of equal level, as the line does.
pub fn coalesce(pulses: &[Pulse]) -> PulseBuffer {
    let mut out = PulseBuffer::new();
    for pulse in pulses.iter().filter(|p| p.duration_us > 0) {
        match out.last_mut() {
            Some(last) if last.level == pulse.level => {
                last.duration_us = last.duration_us.saturating_add(pulse.duration_us);
            }
            _ => {
                if out.push(*pulse).is_err() {
                    break;
                }
            }
        }
    }
    out
}

// =============================================================================
// Decoder
// =============================================================================

#[inline]
fn half_bits(duration_us: u32) -> Option<usize> {
    if (T_TE_MIN..=T_TE_MAX).contains(&duration_us) {
        Some(1)
    } else if (T_2TE_MIN..=T_2TE_MAX).contains(&duration_us) {
        Some(2)
    } else {
        None
    }
}

/// Decode one captured burst.
///
/// Zero-length pulses (capture end markers) are ignored, as is idle line
/// before the start bit. An idle pulse longer than two half-bit periods ends
/// the frame.
pub fn decode(pulses: &[Pulse]) -> Result<Decoded, DecodeError> {
    let mut rest = pulses
        .iter()
        .filter(|p| p.duration_us > 0)
        .skip_while(|p| p.level == Level::Idle);

    let Some(first) = rest.next() else {
        return Ok(Decoded::Idle);
    };
    if first.duration_us > T_BUS_FAILURE_MIN {
        return Ok(Decoded::BusFailure);
    }

    let mut halves: heapless::Vec<Level, MAX_HALF_BITS> = heapless::Vec::new();
    'pulses: for pulse in core::iter::once(first).chain(rest) {
        if pulse.level == Level::Idle && pulse.duration_us > T_2TE_MAX {
            break;
        }
        let count = half_bits(pulse.duration_us).ok_or(DecodeError::Timing {
            duration_us: pulse.duration_us,
        })?;
        for _ in 0..count {
            if halves.push(pulse.level).is_err() {
                break 'pulses;
            }
        }
    }

    if halves.get(0..2) != Some(&[Level::Active, Level::Idle][..]) {
        return Err(DecodeError::MissingStart);
    }

    let mut data = 0u32;
    let mut bits = 0u8;
    for cell in halves[2..].chunks(2) {
        let bit = match cell {
            [Level::Active, Level::Idle] | [Level::Active] => 1,
            [Level::Idle, Level::Active] => 0,
            [Level::Idle, Level::Idle] | [Level::Idle] => break,
            _ => return Err(DecodeError::Phase),
        };
        data = (data << 1) | bit;
        bits += 1;
        // A lone active half is a '1' whose idle half merged into the stop
        if cell.len() == 1 {
            break;
        }
    }

    match FrameLength::from_bits(bits) {
        Some(length) => Ok(Decoded::Frame(Frame::from_parts(data, length))),
        None => Err(DecodeError::Length { data, bits }),
    }
}

/// Compare a decoded burst against the frame being transmitted.
pub fn classify_echo(sent: Frame, received: &Result<Decoded, DecodeError>) -> EchoMatch {
    match received {
        Ok(Decoded::Frame(frame)) if *frame == sent => EchoMatch::Match,
        Ok(Decoded::Idle) => EchoMatch::NotAnEcho,
        _ => EchoMatch::Collision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn line(frame: Frame) -> PulseBuffer {
        coalesce(&encode(frame))
    }

    #[test]
    fn test_encode_layout() {
        let pulses = encode(Frame::backward(0b1000_0000));
        assert_eq!(pulses.len(), 2 + 16 + 1);
        assert_eq!(pulses[0], Pulse::active(T_TE));
        assert_eq!(pulses[1], Pulse::idle(T_TE));
        // MSB '1' then '0'
        assert_eq!(pulses[2], Pulse::active(T_TE));
        assert_eq!(pulses[3], Pulse::idle(T_TE));
        assert_eq!(pulses[4], Pulse::idle(T_TE));
        assert_eq!(pulses[5], Pulse::active(T_TE));
        assert_eq!(pulses.last(), Some(&Pulse::idle(2 * T_TE)));
    }

    #[test]
    fn test_coalesce_merges_levels() {
        let merged = coalesce(&[
            Pulse::active(T_TE),
            Pulse::idle(T_TE),
            Pulse::idle(T_TE),
            Pulse::idle(0),
            Pulse::active(T_TE),
        ]);
        assert_eq!(
            merged.as_slice(),
            &[Pulse::active(T_TE), Pulse::idle(2 * T_TE), Pulse::active(T_TE)]
        );
    }

    #[test]
    fn test_decode_forward_frame() {
        let frame = Frame::forward16(0xFF, 0x00);
        assert_eq!(decode(&line(frame)), Ok(Decoded::Frame(frame)));
    }

    #[test]
    fn test_decode_unmerged_pulses() {
        let frame = Frame::forward24(0xC1, 0x03, 0x00);
        assert_eq!(decode(&encode(frame)), Ok(Decoded::Frame(frame)));
    }

    #[test]
    fn test_decode_with_leading_idle_and_end_marker() {
        let frame = Frame::backward(0x5A);
        let mut pulses = PulseBuffer::new();
        pulses.push(Pulse::idle(20_000)).unwrap();
        pulses.extend(line(frame));
        pulses.push(Pulse::idle(0)).unwrap();
        assert_eq!(decode(&pulses), Ok(Decoded::Frame(frame)));
    }

    #[test]
    fn test_trailing_one_without_stop_pulse() {
        // Capture ended right after the last active half
        let frame = Frame::backward(0xFF);
        let mut pulses = line(frame);
        pulses.pop();
        assert_eq!(decode(&pulses), Ok(Decoded::Frame(frame)));
    }

    #[test]
    fn test_idle_only() {
        assert_eq!(decode(&[]), Ok(Decoded::Idle));
        assert_eq!(decode(&[Pulse::idle(5_000)]), Ok(Decoded::Idle));
    }

    #[test]
    fn test_bus_failure() {
        assert_eq!(decode(&[Pulse::active(500_000)]), Ok(Decoded::BusFailure));
    }

    #[test]
    fn test_break_signal_is_framing_error() {
        assert_eq!(
            decode(&encode_break()),
            Err(DecodeError::Timing {
                duration_us: T_BREAK_ACTIVE
            })
        );
    }

    #[test]
    fn test_missing_start() {
        // Starts with a double-length active pulse
        let pulses = [Pulse::active(2 * T_TE), Pulse::idle(T_TE), Pulse::idle(3_000)];
        assert_eq!(decode(&pulses), Err(DecodeError::MissingStart));
    }

    #[test]
    fn test_phase_error() {
        let pulses = [
            Pulse::active(T_TE),
            Pulse::idle(T_TE),
            Pulse::active(2 * T_TE),
            Pulse::idle(3_000),
        ];
        assert_eq!(decode(&pulses), Err(DecodeError::Phase));
    }

    #[test]
    fn test_non_standard_length() {
        let mut pulses = PulseBuffer::new();
        pulses.extend([Pulse::active(T_TE), Pulse::idle(T_TE)]);
        for _ in 0..4 {
            pulses.extend([Pulse::idle(T_TE), Pulse::active(T_TE)]);
        }
        pulses.push(Pulse::idle(2 * T_TE)).unwrap();
        assert_eq!(
            decode(&coalesce(&pulses)),
            Err(DecodeError::Length { data: 0, bits: 4 })
        );
    }

    #[test]
    fn test_bit_limit() {
        let mut pulses = PulseBuffer::new();
        pulses.extend([Pulse::active(T_TE), Pulse::idle(T_TE)]);
        for _ in 0..40 {
            pulses.extend([Pulse::active(T_TE), Pulse::idle(T_TE)]);
        }
        match decode(&pulses) {
            Err(DecodeError::Length { bits, .. }) => assert_eq!(bits, MAX_DECODED_BITS),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_echo() {
        let sent = Frame::forward16(0x01, 0xA0);
        assert_eq!(classify_echo(sent, &Ok(Decoded::Frame(sent))), EchoMatch::Match);
        assert_eq!(
            classify_echo(sent, &Ok(Decoded::Frame(Frame::forward16(0x01, 0xA1)))),
            EchoMatch::Collision
        );
        assert_eq!(
            classify_echo(sent, &Ok(Decoded::Frame(Frame::forward24(0x00, 0x01, 0xA0)))),
            EchoMatch::Collision
        );
        assert_eq!(classify_echo(sent, &Err(DecodeError::Phase)), EchoMatch::Collision);
        assert_eq!(classify_echo(sent, &Ok(Decoded::BusFailure)), EchoMatch::Collision);
        assert_eq!(classify_echo(sent, &Ok(Decoded::Idle)), EchoMatch::NotAnEcho);
    }

    #[quickcheck]
    fn manchester_roundtrip(data: u32, length: u8) -> bool {
        let length = [FrameLength::Backward, FrameLength::Forward16, FrameLength::Forward24]
            [usize::from(length % 3)];
        let mask = (1u32 << length.bits()) - 1;
        let frame = Frame::from_parts(data & mask, length);
        decode(&line(frame)) == Ok(Decoded::Frame(frame))
            && decode(&encode(frame)) == Ok(Decoded::Frame(frame))
    }

    #[quickcheck]
    fn out_of_band_pulse_is_framing_error(data: u16, position: u8, duration: u16, active: bool) -> TestResult {
        let duration = u32::from(duration);
        let in_band = (T_TE_MIN..=T_TE_MAX).contains(&duration)
            || (T_2TE_MIN..=T_2TE_MAX).contains(&duration);
        // Long idle is the stop condition, long active at the start is a bus failure
        if duration == 0 || in_band || (!active && duration > T_2TE_MAX) {
            return TestResult::discard();
        }
        let mut pulses = line(Frame::forward16((data >> 8) as u8, data as u8));
        // Keep the start pulse (a leading idle would be skipped) and the stop pulse
        let index = 1 + usize::from(position) % (pulses.len() - 2);
        pulses[index] = Pulse {
            level: if active { Level::Active } else { Level::Idle },
            duration_us: duration,
        };
        match decode(&pulses) {
            Ok(Decoded::Frame(_)) => TestResult::failed(),
            _ => TestResult::passed(),
        }
    }
}
