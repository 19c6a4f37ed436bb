//! LoRaWAN protocol implementation
//!
//! This module contains the core LoRaWAN protocol implementation, including:
//! - the MAC state machine driving join, uplink and the receive windows
//! - the regional PHY (channels, bands, datarates, duty cycle, ADR)
//! - MAC command parsing and answer queueing
//! - frame layouts and application channel plans

/// Application channel plans
pub mod channel_plan;

/// MAC command handling
pub mod commands;

/// Frame layouts
pub mod frame;

/// MAC layer implementation
pub mod mac;

/// Session parameters
pub mod params;

/// Regional PHY algorithms
pub mod phy;

/// Regional parameters and configurations
pub mod region;

/// Service records and MAC events
pub mod types;

pub use channel_plan::{ChannelParams, ChannelPlan, Plan};
pub use commands::MacCommandCodec;
pub use mac::{LoRaMac, MacState};
pub use params::{MulticastChannel, ProtocolParams};
pub use phy::RegionalPhy;
pub use region::Region;
