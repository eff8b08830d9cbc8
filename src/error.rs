//! Error types for DALI bus operations.
//!
//! Structured error types with backtraces (when std is enabled) and
//! helper methods for inspecting the error category.
//!
//! Transient bus conditions (no reply, collisions) are mostly absorbed by the
//! transaction layer and the scheduler; what reaches callers here is what they
//! can act upon.

use core::fmt;

#[cfg(feature = "std")]
use std::backtrace::Backtrace;

/// Result type alias for DALI operations.
pub type Result<T> = core::result::Result<T, DaliError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Bus error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum BusErrorKind {
    Collision,
    BusFailure,
    QueueFull,
}

/// Frame error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum FrameErrorKind {
    InvalidLength,
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AddressingErrorKind {
    InvalidLongAddress,
    ShortOutOfRange,
    GroupOutOfRange,
    SceneOutOfRange,
}

/// Storage error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StorageErrorKind {
    ReadFailed,
    WriteFailed,
    Corrupt,
    Serialize,
    BufferTooSmall,
}

/// Configuration error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ConfigErrorKind {
    MissingKey,
    InvalidValue,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// DALI bus engine error types.
///
/// This is the main error type returned by the bus, registry and storage
/// operations of this crate.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DaliError {
    /// Bus-level failures (collision retries exhausted, stuck bus, full queues)
    Bus(BusError),
    /// Frame construction errors
    Frame(FrameError),
    /// Address parsing and range errors
    Addressing(AddressingError),
    /// Persistent storage errors
    Storage(StorageError),
    /// Configuration parsing errors
    Config(ConfigError),
    /// The driver did not report any outcome for a transmission in time
    Timeout,
    InvalidState,
    /// Peripheral or interrupt setup failed; the bus subsystem is unusable
    HardwareInit,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Bus error with optional backtrace
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusError {
    kind: BusErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl BusError {
    pub(crate) fn new(kind: BusErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the retry budget was exhausted by collisions
    pub fn is_collision(&self) -> bool {
        matches!(self.kind, BusErrorKind::Collision)
    }

    /// Check if the bus is held active (power loss or short)
    pub fn is_bus_failure(&self) -> bool {
        matches!(self.kind, BusErrorKind::BusFailure)
    }

    /// Check if the driver's transmit queue was full
    pub fn is_queue_full(&self) -> bool {
        matches!(self.kind, BusErrorKind::QueueFull)
    }
}

/// Frame error with optional backtrace
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameError {
    kind: FrameErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl FrameError {
    pub(crate) fn new(kind: FrameErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the bit length was not 8, 16 or 24
    pub fn is_invalid_length(&self) -> bool {
        matches!(self.kind, FrameErrorKind::InvalidLength)
    }
}

/// Addressing error with optional backtrace
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressingError {
    kind: AddressingErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl AddressingError {
    pub(crate) fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if a long address string could not be parsed
    pub fn is_invalid_long_address(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::InvalidLongAddress)
    }

    /// Check if a short, group or scene number was out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self.kind,
            AddressingErrorKind::ShortOutOfRange
                | AddressingErrorKind::GroupOutOfRange
                | AddressingErrorKind::SceneOutOfRange
        )
    }
}

/// Storage error with optional backtrace
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageError {
    kind: StorageErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl StorageError {
    pub(crate) fn new(kind: StorageErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if persisted data could not be decoded
    pub fn is_corrupt(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Corrupt)
    }

    /// Check if the backing store could not be read
    pub fn is_read_failed(&self) -> bool {
        matches!(self.kind, StorageErrorKind::ReadFailed)
    }

    /// Check if the backing store rejected a write
    pub fn is_write_failed(&self) -> bool {
        matches!(self.kind, StorageErrorKind::WriteFailed)
    }
}

/// Configuration error with optional backtrace
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigError {
    kind: ConfigErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl ConfigError {
    pub(crate) fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if a value failed to parse
    pub fn is_invalid_value(&self) -> bool {
        matches!(self.kind, ConfigErrorKind::InvalidValue)
    }

    /// Check if the key was absent
    pub fn is_missing_key(&self) -> bool {
        matches!(self.kind, ConfigErrorKind::MissingKey)
    }
}

// =============================================================================
// Convenience Constructors for DaliError
// =============================================================================

impl DaliError {
    // Bus errors
    pub(crate) fn collision() -> Self {
        Self::Bus(BusError::new(BusErrorKind::Collision))
    }

    pub(crate) fn bus_failure() -> Self {
        Self::Bus(BusError::new(BusErrorKind::BusFailure))
    }

    pub(crate) fn queue_full() -> Self {
        Self::Bus(BusError::new(BusErrorKind::QueueFull))
    }

    // Frame errors
    pub(crate) fn invalid_frame_length() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::InvalidLength))
    }

    // Addressing errors
    pub(crate) fn invalid_long_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidLongAddress))
    }

    pub(crate) fn short_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::ShortOutOfRange))
    }

    pub(crate) fn group_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::GroupOutOfRange))
    }

    pub(crate) fn scene_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::SceneOutOfRange))
    }

    // Storage errors
    pub(crate) fn storage_read_failed() -> Self {
        Self::Storage(StorageError::new(StorageErrorKind::ReadFailed))
    }

    pub(crate) fn storage_write_failed() -> Self {
        Self::Storage(StorageError::new(StorageErrorKind::WriteFailed))
    }

    pub(crate) fn storage_corrupt() -> Self {
        Self::Storage(StorageError::new(StorageErrorKind::Corrupt))
    }

    pub(crate) fn storage_serialize() -> Self {
        Self::Storage(StorageError::new(StorageErrorKind::Serialize))
    }

    pub(crate) fn buffer_too_small() -> Self {
        Self::Storage(StorageError::new(StorageErrorKind::BufferTooSmall))
    }

    // Config errors
    pub(crate) fn missing_config_key() -> Self {
        Self::Config(ConfigError::new(ConfigErrorKind::MissingKey))
    }

    pub(crate) fn invalid_config_value() -> Self {
        Self::Config(ConfigError::new(ConfigErrorKind::InvalidValue))
    }

    /// Check if this error is a transient bus condition worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            DaliError::Bus(e) => !e.is_bus_failure(),
            DaliError::Timeout => true,
            _ => false,
        }
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for DaliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaliError::Bus(e) => write!(f, "Bus error: {:?}", e.kind),
            DaliError::Frame(e) => write!(f, "Frame error: {:?}", e.kind),
            DaliError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
            DaliError::Storage(e) => write!(f, "Storage error: {:?}", e.kind),
            DaliError::Config(e) => write!(f, "Configuration error: {:?}", e.kind),
            DaliError::Timeout => write!(f, "No outcome from bus driver"),
            DaliError::InvalidState => write!(f, "Invalid state"),
            DaliError::HardwareInit => write!(f, "Bus hardware initialization failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DaliError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DaliError::collision().is_transient());
        assert!(DaliError::Timeout.is_transient());
        assert!(!DaliError::bus_failure().is_transient());
        assert!(!DaliError::storage_corrupt().is_transient());
    }

    #[test]
    fn test_helpers_match_kind() {
        match DaliError::scene_out_of_range() {
            DaliError::Addressing(e) => {
                assert!(e.is_out_of_range());
                assert!(!e.is_invalid_long_address());
            }
            other => panic!("unexpected {other:?}"),
        }
        match DaliError::storage_corrupt() {
            DaliError::Storage(e) => assert!(e.is_corrupt()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(DaliError::Timeout.to_string(), "No outcome from bus driver");
        assert_eq!(DaliError::collision().to_string(), "Bus error: Collision");
    }
}
