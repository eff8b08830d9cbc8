//! Utility functions for configuration parsing

use crate::error::{DaliError, Result};

/// Look up `key` in a `KEY=VALUE` block.
///
/// Surrounding whitespace of lines and values is ignored.
///
/// # Returns
/// * `Option<&str>` - the value of the first matching line
pub fn config_value<'t>(text: &'t str, key: &str) -> Option<&'t str> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.split_once('='))
        .find(|(name, _)| name.trim() == key)
        .map(|(_, value)| value.trim())
}

/// Look up `key` and parse it as a decimal number.
///
/// # Errors
/// * missing key - configuration `MissingKey` error
/// * non-numeric value - configuration `InvalidValue` error
pub fn config_u32(text: &str, key: &str) -> Result<u32> {
    let value = config_value(text, key).ok_or_else(DaliError::missing_config_key)?;
    value.parse().map_err(|_| DaliError::invalid_config_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "
DALI_TX_PIN = 17
# comment
DALI_RX_PIN=16
DALI_NAME=bridge
";

    #[test]
    fn test_config_value_lookup() {
        assert_eq!(config_value(TEXT, "DALI_TX_PIN"), Some("17"));
        assert_eq!(config_value(TEXT, "DALI_NAME"), Some("bridge"));
        assert_eq!(config_value(TEXT, "DALI"), None);
    }

    #[test]
    fn test_config_u32_errors() {
        assert_eq!(config_u32(TEXT, "DALI_RX_PIN").unwrap(), 16);
        match config_u32(TEXT, "DALI_NAME") {
            Err(DaliError::Config(e)) => assert!(e.is_invalid_value()),
            other => panic!("unexpected {other:?}"),
        }
        match config_u32(TEXT, "MISSING") {
            Err(DaliError::Config(e)) => assert!(e.is_missing_key()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
