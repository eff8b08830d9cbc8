//! Unified logging macro for the DALI bus engine.
//!
//! `dali_log!` selects the backend from the active feature flags:
//!
//! - `usb-logger` - `log::` crate (USB serial console)
//! - `defmt` - `defmt::` (RTT, default for the firmware binary)
//! - neither - compiled out; arguments are still type-checked
//!
//! ```rust,ignore
//! dali_log!(info, "Commissioning found {} devices", count);
//! dali_log!(debug, "Sniffed forward frame {:#x}", frame.data());
//! dali_log!(warn, "Event queue full, dropping {:?}", event);
//! ```
//!
//! Format strings must stay within the subset understood by both `defmt` and
//! `core::fmt`: `{}`, `{:?}` and `{:#x}`.

/// Unified logging macro - automatically selects log:: or defmt:: based on features
#[macro_export]
#[cfg(feature = "usb-logger")]
macro_rules! dali_log {
    (info, $($arg:tt)*) => { log::info!($($arg)*) };
    (debug, $($arg:tt)*) => { log::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { log::warn!($($arg)*) };
    (error, $($arg:tt)*) => { log::error!($($arg)*) };
    (trace, $($arg:tt)*) => { log::trace!($($arg)*) };
}

#[macro_export]
#[cfg(all(feature = "defmt", not(feature = "usb-logger")))]
macro_rules! dali_log {
    (info, $($arg:tt)*) => { defmt::info!($($arg)*) };
    (debug, $($arg:tt)*) => { defmt::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { defmt::warn!($($arg)*) };
    (error, $($arg:tt)*) => { defmt::error!($($arg)*) };
    (trace, $($arg:tt)*) => { defmt::trace!($($arg)*) };
}

#[macro_export]
#[cfg(not(any(feature = "defmt", feature = "usb-logger")))]
macro_rules! dali_log {
    ($level:ident, $($arg:tt)*) => {{
        if false {
            let _ = ::core::format_args!($($arg)*);
        }
    }};
}
