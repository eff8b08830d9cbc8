//! Physical layer abstraction.
//!
//! The bus driver never touches GPIO or timers directly; it drives a
//! [`BusPhy`]. Production code wraps the line driver output, tests use
//! [`LoopbackPhy`](super::loopback::LoopbackPhy).
//!
//! Receiving is not part of the trait: captured bursts reach the driver
//! through [`BusChannels::post_burst`](super::BusChannels::post_burst),
//! which can be called from an interrupt or a capture task.

use crate::error::Result;
use crate::protocol::codec::Pulse;

/// Pulse-level transmit side of a DALI interface
#[allow(async_fn_in_trait, reason = "Futures run on a single-threaded executor and need not be Send")]
pub trait BusPhy {
    /// Drive the line through `pulses`, returning once the last one ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral rejects the sequence; the driver
    /// reports it as a failed transmission.
    async fn transmit(&mut self, pulses: &[Pulse]) -> Result<()>;

    /// Re-enable capture after a burst has been consumed.
    ///
    /// Default implementation does nothing, for captures that re-arm
    /// themselves.
    fn rearm_receive(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: BusPhy + ?Sized> BusPhy for &mut P {
    async fn transmit(&mut self, pulses: &[Pulse]) -> Result<()> {
        (**self).transmit(pulses).await
    }

    fn rearm_receive(&mut self) -> Result<()> {
        (**self).rearm_receive()
    }
}
