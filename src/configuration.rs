//! Bridge configuration.
//!
//! Edit the values below to match the installation. Keys that are missing
//! fall back to the defaults of [`BridgeConfig`].

use crate::error::Result;
use crate::utility::config_u32;

pub const CONFIG: &str = r#"
DALI_POLL_INTERVAL_MS=60000
DALI_TX_PIN=17
DALI_RX_PIN=16
DALI_SYNC_TIMEOUT_MS=5000
"#;

/// Settings of the DALI side of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BridgeConfig {
    /// Time for one full round-robin pass over all short addresses
    pub poll_interval_ms: u32,
    pub tx_pin: u8,
    pub rx_pin: u8,
    /// Quiet time before changed state is saved
    pub sync_timeout_ms: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            tx_pin: 17,
            rx_pin: 16,
            sync_timeout_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    /// Parse a `KEY=VALUE` block.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a present key has a value that is
    /// not a number or does not fit its field.
    pub fn from_text(text: &str) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval_ms: value_or(text, "DALI_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            tx_pin: pin_or(text, "DALI_TX_PIN", defaults.tx_pin)?,
            rx_pin: pin_or(text, "DALI_RX_PIN", defaults.rx_pin)?,
            sync_timeout_ms: value_or(text, "DALI_SYNC_TIMEOUT_MS", defaults.sync_timeout_ms)?,
        })
    }

    /// Configuration compiled into the firmware.
    pub fn load() -> Result<Self> {
        Self::from_text(CONFIG)
    }
}

fn value_or(text: &str, key: &str, default: u32) -> Result<u32> {
    match config_u32(text, key) {
        Ok(value) => Ok(value),
        Err(crate::error::DaliError::Config(e)) if e.is_missing_key() => Ok(default),
        Err(e) => Err(e),
    }
}

fn pin_or(text: &str, key: &str, default: u8) -> Result<u8> {
    let value = value_or(text, key, u32::from(default))?;
    u8::try_from(value).map_err(|_| crate::error::DaliError::invalid_config_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_config_parses() {
        assert_eq!(BridgeConfig::load().unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = BridgeConfig::from_text("DALI_TX_PIN=3\n").unwrap();
        assert_eq!(config.tx_pin, 3);
        assert_eq!(config.rx_pin, 16);
        assert_eq!(config.poll_interval_ms, 60_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(BridgeConfig::from_text("DALI_POLL_INTERVAL_MS=soon").is_err());
        assert!(BridgeConfig::from_text("DALI_RX_PIN=300").is_err());
    }
}
