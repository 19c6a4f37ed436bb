//! MCPS/MLME records and MAC events

use heapless::Vec;

use crate::error::{Error, EventInfoStatus};

/// Largest application payload a downlink can carry
pub const MAX_APP_PAYLOAD: usize = 242;

/// Data service primitive type
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum McpsType {
    /// Unconfirmed data frame
    #[default]
    Unconfirmed,
    /// Confirmed data frame
    Confirmed,
    /// Multicast data frame
    Multicast,
    /// Proprietary frame
    Proprietary,
}

/// Management service primitive type
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlmeType {
    /// Join procedure
    #[default]
    Join,
    /// LinkCheckReq answered
    LinkCheck,
    /// The network expects an uplink
    ScheduleUplink,
}

/// Receive window a frame arrived in
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxSlot {
    /// First window
    #[default]
    Rx1,
    /// Second window
    Rx2,
    /// Continuous class C reception
    ClassC,
}

/// Result of an uplink
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpsConfirm {
    /// Kind of uplink
    pub req_type: McpsType,
    /// Outcome
    pub status: EventInfoStatus,
    /// Datarate of the last transmission
    pub datarate: u8,
    /// TX power index of the last transmission
    pub tx_power: u8,
    /// A confirmed uplink was acknowledged
    pub ack_received: bool,
    /// Transmissions performed
    pub nb_retries: u8,
    /// Uplink counter used by the frame
    pub ul_frame_counter: u32,
    /// Channel of the last transmission
    pub channel: u8,
    /// Time on air of the last transmission in ms
    pub tx_toa: u32,
}

impl Default for McpsConfirm {
    fn default() -> Self {
        Self {
            req_type: McpsType::Unconfirmed,
            status: EventInfoStatus::Error,
            datarate: 0,
            tx_power: 0,
            ack_received: false,
            nb_retries: 0,
            ul_frame_counter: 0,
            channel: 0,
            tx_toa: 0,
        }
    }
}

/// Downlink delivered to the application
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpsIndication {
    /// Kind of downlink
    pub ind_type: McpsType,
    /// Outcome
    pub status: EventInfoStatus,
    /// Application port
    pub port: u8,
    /// Network has more data pending
    pub fpending: bool,
    /// Decrypted application payload
    pub buffer: Vec<u8, MAX_APP_PAYLOAD>,
    /// The frame carried application data
    pub is_data_recvd: bool,
    /// The frame acknowledged our confirmed uplink
    pub is_ack_recvd: bool,
    /// Downlink datarate
    pub rx_datarate: u8,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: i8,
    /// Window the frame arrived in
    pub rx_slot: RxSlot,
    /// Reconstructed downlink counter
    pub dl_frame_counter: u32,
}

impl Default for McpsIndication {
    fn default() -> Self {
        Self {
            ind_type: McpsType::Unconfirmed,
            status: EventInfoStatus::Error,
            port: 0,
            fpending: false,
            buffer: Vec::new(),
            is_data_recvd: false,
            is_ack_recvd: false,
            rx_datarate: 0,
            rssi: 0,
            snr: 0,
            rx_slot: RxSlot::Rx1,
            dl_frame_counter: 0,
        }
    }
}

/// Result of a management request
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MlmeConfirm {
    /// Request kind
    pub req_type: MlmeType,
    /// Outcome
    pub status: EventInfoStatus,
    /// Join requests sent
    pub nb_retries: u8,
    /// LinkCheckAns demodulation margin
    pub demod_margin: u8,
    /// LinkCheckAns gateway count
    pub nb_gateways: u8,
}

impl Default for MlmeConfirm {
    fn default() -> Self {
        Self {
            req_type: MlmeType::Join,
            status: EventInfoStatus::Error,
            nb_retries: 0,
            demod_margin: 0,
            nb_gateways: 0,
        }
    }
}

/// Management event raised by the network
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MlmeIndication {
    /// Indication kind
    pub ind_type: MlmeType,
    /// An uplink is pending
    pub pending: bool,
}

/// Last transmission
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMetadata {
    /// Channel index
    pub channel: u8,
    /// Datarate
    pub data_rate: u8,
    /// TX power index
    pub tx_power: u8,
    /// Time on air in ms
    pub tx_toa: u32,
    /// Transmissions of the frame so far
    pub nb_retries: u8,
}

/// Last reception
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMetadata {
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: i8,
    /// Downlink datarate
    pub rx_datarate: u8,
    /// Downlink frequency in Hz
    pub channel: u32,
}

/// Notification from the MAC to the device layer
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEvent {
    /// The uplink transaction ended; see [`McpsConfirm`]
    McpsConfirm,
    /// A downlink was accepted; see [`McpsIndication`]
    McpsIndication,
    /// A management request ended; see [`MlmeConfirm`]
    MlmeConfirm,
    /// The network raised a management event; see [`MlmeIndication`]
    MlmeIndication,
    /// A delayed transmission could not be scheduled
    SchedulingFailed(Error),
}
