//! Device and network configuration
//!
//! This module contains the credentials and knobs an application hands to the
//! stack before connecting:
//! - Device configuration (DevEUI, AppEUI, keys, trial counts)
//! - Activation method (OTAA or ABP)
//! - Device class, ADR and duty cycle switches

/// Device configuration and credentials
pub mod device;

pub use device::{Activation, DeviceClass, DeviceConfig};
