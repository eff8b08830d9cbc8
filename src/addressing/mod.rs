//! DALI addressing.
//!
//! Devices carry two addresses:
//! - a 24-bit random long address, used to single them out during commissioning
//! - a 6-bit short address (0-63), used for everything else
//!
//! Control gear and input devices each have their own short-address space.

pub mod long;
pub mod short;

pub use long::LongAddress;
pub use short::{AddressSpace, GroupId, SceneId, ShortAddress, Target};
