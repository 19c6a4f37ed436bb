//! Live MAC session parameters

use heapless::Vec;

use super::region::RegionTables;
use crate::config::device::{AESKey, DevAddr, DeviceClass};
use crate::error::{Error, Result};
use crate::timer::TimerTime;

/// Multicast groups a device can follow at once
pub const MAX_MULTICAST_CHANNELS: usize = 4;

/// Default delay between TX end and RX1, in ms
pub const RECEIVE_DELAY1: u32 = 1_000;
/// Default delay between TX end and RX2, in ms
pub const RECEIVE_DELAY2: u32 = 2_000;
/// Join accept RX1 delay, in ms
pub const JOIN_ACCEPT_DELAY1: u32 = 5_000;
/// Join accept RX2 delay, in ms
pub const JOIN_ACCEPT_DELAY2: u32 = 6_000;
/// Largest tolerated downlink frame-counter jump
pub const MAX_FCNT_GAP: u32 = 16_384;
/// Uplinks without downlink before ADRACKReq is set
pub const ADR_ACK_LIMIT: u16 = 64;
/// Uplinks between datarate steps once ADRACKReq is set
pub const ADR_ACK_DELAY: u16 = 32;
/// Nominal ACK timeout, in ms
pub const ACK_TIMEOUT: u32 = 2_000;
/// Random spread added to the ACK timeout, in ms
pub const ACK_TIMEOUT_RND: u32 = 1_000;
/// Timing error budget of the platform, in ms
pub const MAX_SYS_RX_ERROR: u32 = 10;
/// Preamble symbols the radio needs to detect a frame
pub const MIN_RX_SYMBOLS: u8 = 6;
/// Radio wake-up time, in ms
pub const RADIO_WAKEUP_TIME: u32 = 5;

/// How the current session was obtained
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// No session yet
    Idle,
    /// Joined over the air
    Otaa,
    /// Personalized
    Abp,
}

/// Multicast group
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MulticastChannel {
    /// Group address
    pub address: DevAddr,
    /// Group network session key
    pub nwk_skey: AESKey,
    /// Group application session key
    pub app_skey: AESKey,
    /// Last downlink counter received on the group
    pub dl_frame_counter: Option<u32>,
}

/// Live session parameters shared by the MAC and the command codec
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    /// How the session was obtained
    pub activation: ActivationState,
    /// Device address
    pub dev_addr: DevAddr,
    /// Network identifier
    pub net_id: u32,
    /// Network session key
    pub nwk_skey: AESKey,
    /// Application session key
    pub app_skey: AESKey,
    /// Next uplink frame counter
    pub ul_frame_counter: u32,
    /// Last accepted downlink frame counter
    pub dl_frame_counter: Option<u32>,
    /// Device class
    pub dev_class: DeviceClass,
    /// ADR enabled
    pub adr_on: bool,
    /// Uplinks since the last downlink
    pub adr_ack_counter: u32,
    /// Uplinks without downlink before ADRACKReq
    pub adr_ack_limit: u16,
    /// Uplinks between ADR datarate steps
    pub adr_ack_delay: u16,
    /// Uplink datarate
    pub channel_data_rate: u8,
    /// Uplink TX power index
    pub channel_tx_power: u8,
    /// Transmissions of each unconfirmed uplink
    pub nb_rep: u8,
    /// Transmissions of each confirmed uplink
    pub max_ack_retries: u8,
    /// RX1 datarate offset
    pub rx1_dr_offset: u8,
    /// RX2 frequency
    pub rx2_frequency: u32,
    /// RX2 datarate
    pub rx2_datarate: u8,
    /// RX1 delay in ms
    pub recv_delay1: u32,
    /// RX2 delay in ms
    pub recv_delay2: u32,
    /// Join accept RX1 delay in ms
    pub join_accept_delay1: u32,
    /// Join accept RX2 delay in ms
    pub join_accept_delay2: u32,
    /// Largest tolerated downlink counter jump
    pub max_fcnt_gap: u32,
    /// Platform timing error in ms
    pub max_sys_rx_error: u32,
    /// Preamble symbols needed to lock
    pub min_rx_symbols: u8,
    /// Radio wake-up time in ms
    pub wakeup_time: u32,
    /// Regulatory duty cycle enforced
    pub duty_cycle_on: bool,
    /// Public network sync word
    pub public_network: bool,
    /// Aggregated duty cycle exponent set by DutyCycleReq (1 / 2^n)
    pub max_duty_cycle: u8,
    /// End of the last uplink
    pub aggregated_last_tx_time: TimerTime,
    /// Aggregated silence required after the last uplink
    pub aggregated_timeoff: u32,
    /// Nonce of the last join request
    pub dev_nonce: u16,
    /// Join requests sent in the current join procedure
    pub join_trials: u16,
    /// Join requests allowed per join procedure
    pub max_join_trials: u8,
    /// Network asked for an acknowledgement
    pub srv_ack_requested: bool,
    /// Time the stack was initialized, for the join duty cycle
    pub init_time: TimerTime,
    /// Followed multicast groups
    pub multicast: Vec<MulticastChannel, MAX_MULTICAST_CHANNELS>,
}

impl ProtocolParams {
    /// Parameters of a fresh, unjoined device in a region
    pub fn new(tables: &RegionTables) -> Self {
        Self {
            activation: ActivationState::Idle,
            dev_addr: DevAddr::default(),
            net_id: 0,
            nwk_skey: AESKey::default(),
            app_skey: AESKey::default(),
            ul_frame_counter: 0,
            dl_frame_counter: None,
            dev_class: DeviceClass::A,
            adr_on: true,
            adr_ack_counter: 0,
            adr_ack_limit: ADR_ACK_LIMIT,
            adr_ack_delay: ADR_ACK_DELAY,
            channel_data_rate: tables.default_datarate,
            channel_tx_power: tables.default_tx_power,
            nb_rep: 1,
            max_ack_retries: 1,
            rx1_dr_offset: 0,
            rx2_frequency: tables.rx2_frequency,
            rx2_datarate: tables.rx2_datarate,
            recv_delay1: RECEIVE_DELAY1,
            recv_delay2: RECEIVE_DELAY2,
            join_accept_delay1: JOIN_ACCEPT_DELAY1,
            join_accept_delay2: JOIN_ACCEPT_DELAY2,
            max_fcnt_gap: MAX_FCNT_GAP,
            max_sys_rx_error: MAX_SYS_RX_ERROR,
            min_rx_symbols: MIN_RX_SYMBOLS,
            wakeup_time: RADIO_WAKEUP_TIME,
            duty_cycle_on: tables.duty_cycle_on,
            public_network: true,
            max_duty_cycle: 0,
            aggregated_last_tx_time: 0,
            aggregated_timeoff: 0,
            dev_nonce: 0,
            join_trials: 0,
            max_join_trials: 1,
            srv_ack_requested: false,
            init_time: 0,
            multicast: Vec::new(),
        }
    }

    /// True once a session exists
    pub fn is_joined(&self) -> bool {
        self.activation != ActivationState::Idle
    }

    /// Aggregated duty cycle as an inverse ratio
    pub fn aggregated_duty_cycle(&self) -> u32 {
        1u32 << self.max_duty_cycle.min(15)
    }

    /// Follow a multicast group
    pub fn link_multicast(&mut self, channel: MulticastChannel) -> Result<()> {
        if channel.address == self.dev_addr
            || self.multicast.iter().any(|m| m.address == channel.address)
        {
            return Err(Error::ParameterInvalid);
        }
        self.multicast.push(channel).map_err(|_| Error::LengthError)
    }

    /// Stop following a multicast group
    pub fn unlink_multicast(&mut self, address: DevAddr) -> Result<()> {
        let index = self
            .multicast
            .iter()
            .position(|m| m.address == address)
            .ok_or(Error::ParameterInvalid)?;
        self.multicast.swap_remove(index);
        Ok(())
    }
}
