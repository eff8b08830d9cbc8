//! DALI protocol layer.
//!
//! Frames, opcodes, line timing and the Manchester codec. Everything in here
//! is pure and synchronous; the bus driver and the transaction layer build on
//! top of it.

pub mod codec;
pub mod commands;
pub mod constants;
pub mod frame;

pub use codec::{DecodeError, Decoded, EchoMatch, Level, Pulse, PulseBuffer};
pub use frame::{Direction, Frame, FrameLength};
