//! LoRaWAN end-device MAC/PHY core in Rust
//!
//! This crate implements the device side of LoRaWAN 1.0.2: the MAC state
//! machine, the EU868 regional PHY, MAC command handling and a session
//! façade the application drives. Radio, timer and crypto are collaborators
//! behind traits, so the stack runs on any `no_std` target and under test
//! with scripted doubles.
//!
//! # Features
//! - OTAA join with alternating datarates and ABP activation
//! - Class A and class C operation
//! - ADR, duty cycle and aggregated duty cycle enforcement
//! - Every LoRaWAN 1.0.2 MAC command, with sticky answer repetition
//! - Confirmed uplink retries and unconfirmed repetitions
//! - Application channel plans and multicast groups
//! - `defmt` or `log` logging behind features
//!
//! # Example
//! ```ignore
//! use lorawan_mac::{
//!     config::device::{AESKey, DeviceConfig},
//!     crypto::LoRaMacCrypto,
//!     device::{AppEvent, LoRaWANDevice, MsgFlags},
//!     lorawan::region::Region,
//! };
//!
//! let mut device = LoRaWANDevice::new(radio, timer, LoRaMacCrypto::new(), Region::Eu868);
//! device.initialize()?;
//! device.connect_with(DeviceConfig::new_otaa(dev_eui, app_eui, AESKey::new(app_key)))?;
//!
//! loop {
//!     // Radio interrupts and timer expiries are posted from the platform
//!     // with `post_radio_event` / `post_timer_event`.
//!     device.process();
//!     while let Some(event) = device.next_event() {
//!         if event == AppEvent::Connected {
//!             device.send(1, b"Hello, LoRaWAN!", MsgFlags::UNCONFIRMED)?;
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![no_std]

#[cfg(feature = "std")]
extern crate std;

#[macro_use]
mod fmt;

/// Device and network configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// High-level device interface
pub mod device;

/// Error and status types
pub mod error;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Radio hardware abstraction layer
pub mod radio;

/// Timer abstraction
pub mod timer;

pub use error::{Error, EventInfoStatus, Result};
