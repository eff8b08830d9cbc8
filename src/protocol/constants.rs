//! DALI physical layer timing and bus engine sizing constants.
//!
//! All durations are in microseconds unless the name says otherwise.

// =============================================================================
// Bit Timing (1200 baud, IEC 62386-101)
// =============================================================================

/// Half-bit period (1 / 2400 s)
pub const T_TE: u32 = 417;
/// Lower bound of a single half-bit pulse
pub const T_TE_MIN: u32 = 300;
/// Upper bound of a single half-bit pulse
pub const T_TE_MAX: u32 = 525;
/// Lower bound of a double half-bit pulse
pub const T_2TE_MIN: u32 = 700;
/// Upper bound of a double half-bit pulse; longer idle ends the frame
pub const T_2TE_MAX: u32 = 960;

/// An active level this long at the start of a burst means the bus is stuck
pub const T_BUS_FAILURE_MIN: u32 = 10_000;
/// Active part of the system-failure signal sent after a collision
pub const T_BREAK_ACTIVE: u32 = 1_500;

/// Receive capture ends after this much idle
pub const RX_IDLE_THRESHOLD: u32 = 1_800;

/// A pending transmission without echo is declared failed after this long
pub const TX_WATCHDOG: u32 = 50_000;

/// Quiet time required before sending after a backward frame
pub const SETTLE_AFTER_BACKWARD: u32 = 5_500;
/// Quiet time required before sending after a forward frame
pub const SETTLE_AFTER_FORWARD: u32 = 2_400;

/// Maximum bits collected by the decoder
pub const MAX_DECODED_BITS: u8 = 32;

// =============================================================================
// Transaction Timing (milliseconds)
// =============================================================================

/// Wait for the driver's transmit outcome
pub const TX_OUTCOME_TIMEOUT_MS: u64 = 50;
/// Wait for a backward frame after a query was sent
pub const REPLY_TIMEOUT_MS: u64 = 60;
/// Gap between the two frames of a send-twice configuration command
pub const SEND_TWICE_GAP_MS: u64 = 10;
/// Transmissions attempted before a collision becomes an error
pub const MAX_TX_ATTEMPTS: u8 = 3;
/// Priority class used for backoff slot computation
pub const TX_PRIORITY: u64 = 2;
/// Settle delay after RANDOMISE
pub const RANDOMISE_SETTLE_MS: u64 = 100;

// =============================================================================
// Queue Sizes
// =============================================================================

/// Pulses per captured receive burst (a 24-bit frame needs at most 51)
pub const MAX_PULSES: usize = 128;
/// Driver event queue depth
pub const EVENT_QUEUE_DEPTH: usize = 64;
/// Driver transmit request queue depth
pub const TX_QUEUE_DEPTH: usize = 16;
/// Completed receive bursts awaiting the driver
pub const BURST_QUEUE_DEPTH: usize = 2;
/// Forward frames buffered for the sniffer
pub const SNIFFER_QUEUE_DEPTH: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_bands_do_not_overlap() {
        assert!(T_TE_MIN < T_TE && T_TE < T_TE_MAX);
        assert!(T_TE_MAX < T_2TE_MIN);
        assert!(T_2TE_MIN < 2 * T_TE && 2 * T_TE < T_2TE_MAX);
    }

    #[test]
    fn test_break_is_not_a_bus_failure() {
        assert!(T_BREAK_ACTIVE > T_2TE_MAX);
        assert!(T_BREAK_ACTIVE < T_BUS_FAILURE_MIN);
    }

    #[test]
    fn test_stop_condition_exceeds_double_band() {
        // Idle half of a trailing '1' merged with the 2TE stop
        assert!(3 * T_TE > T_2TE_MAX);
        assert!(RX_IDLE_THRESHOLD > T_2TE_MAX);
    }
}
