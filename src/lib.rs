#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![doc = include_str!("../README.md")]

//! # dali-bridge
//!
//! DALI (IEC 62386) bus engine for embedded DALI-to-MQTT bridges.
//!
//! This crate provides a `no_std` implementation of the DALI master side,
//! designed for use with the Embassy async runtime on microcontrollers.
//!
//! ## Layers
//!
//! - Manchester codec and echo-checking bus driver ([`protocol`], [`bus`])
//! - Transaction layer with retry and backoff ([`adapter`])
//! - Random-address commissioning ([`commissioning`])
//! - Device registry, groups, scenes and polling ([`registry`], [`controller`])
//! - Address map and group persistence ([`storage`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use dali_bridge::adapter::{DaliAdapter, MockBus};
//! use dali_bridge::configuration::BridgeConfig;
//! use dali_bridge::controller::Controller;
//! use dali_bridge::registry::Registry;
//! use dali_bridge::storage::MemoryStore;
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//!
//! # async fn run() -> dali_bridge::Result<()> {
//! let adapter: DaliAdapter<CriticalSectionRawMutex, _> = DaliAdapter::new(MockBus::new());
//! let registry = Registry::new();
//! let controller = Controller::new(&adapter, &registry, MemoryStore::new(), BridgeConfig::default());
//! controller.init().await?;
//! # Ok(())
//! # }
//! ```

// Macro modules (must be declared before use)
#[macro_use]
pub mod logging;

pub mod adapter;
pub mod addressing;
pub mod bus;
pub mod commissioning;
pub mod configuration;
pub mod controller;
pub mod device;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod utility;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::{AddressSpace, GroupId, LongAddress, SceneId, ShortAddress, Target};
#[doc(inline)]
pub use controller::{BridgeCommand, CommandTarget, Controller};
#[doc(inline)]
pub use error::{DaliError, Result};
#[doc(inline)]
pub use protocol::Frame;
#[doc(inline)]
pub use registry::{Notification, Registry};
