//! Status and error types shared by every layer of the stack

use core::fmt;

/// Error returned by the MAC, the regional PHY and the device interface
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An operation of the same kind is already in flight
    Busy,
    /// No data or ready state yet
    WouldBlock,
    /// Feature not supported by the region or configuration
    ServiceUnknown,
    /// A parameter is out of range or inconsistent
    ParameterInvalid,
    /// Frequency not usable in the active region
    FrequencyInvalid,
    /// Datarate not usable in the active region
    DatarateInvalid,
    /// Both frequency and datarate are unusable
    FreqAndDrInvalid,
    /// The device has not joined a network yet
    NoNetworkJoined,
    /// Frame or command buffer overflow
    LengthError,
    /// The stack has been shut down
    DeviceOff,
    /// The stack has not been initialized
    NotInitialized,
    /// Operation not supported by this implementation
    Unsupported,
    /// Cryptographic collaborator failure
    CryptoFail,
    /// Application port out of the allowed range
    PortInvalid,
    /// A connection attempt is already in progress
    ConnectInProgress,
    /// No session exists for the requested operation
    NoActiveSessions,
    /// Transmission is blocked by regulatory duty cycle
    DutyCycleRestricted {
        /// Time after which a new attempt may succeed
        retry_after_ms: u32,
    },
    /// No channel is able to carry the current datarate
    NoChannelFound,
    /// Requested telemetry is stale or was never recorded
    MetadataNotAvailable,
    /// The device is already connected
    AlreadyConnected,
    /// Nothing to do
    NoOp,
    /// Message integrity check failed
    MicFail,
    /// The radio driver reported an error
    Radio,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => f.write_str("operation already in progress"),
            Error::WouldBlock => f.write_str("no data available"),
            Error::ServiceUnknown => f.write_str("service unknown"),
            Error::ParameterInvalid => f.write_str("invalid parameter"),
            Error::FrequencyInvalid => f.write_str("invalid frequency"),
            Error::DatarateInvalid => f.write_str("invalid datarate"),
            Error::FreqAndDrInvalid => f.write_str("invalid frequency and datarate"),
            Error::NoNetworkJoined => f.write_str("no network joined"),
            Error::LengthError => f.write_str("length error"),
            Error::DeviceOff => f.write_str("device off"),
            Error::NotInitialized => f.write_str("not initialized"),
            Error::Unsupported => f.write_str("unsupported"),
            Error::CryptoFail => f.write_str("crypto failure"),
            Error::PortInvalid => f.write_str("invalid port"),
            Error::ConnectInProgress => f.write_str("connect in progress"),
            Error::NoActiveSessions => f.write_str("no active sessions"),
            Error::DutyCycleRestricted { retry_after_ms } => {
                write!(f, "duty cycle restricted, retry in {} ms", retry_after_ms)
            }
            Error::NoChannelFound => f.write_str("no channel found"),
            Error::MetadataNotAvailable => f.write_str("metadata not available"),
            Error::AlreadyConnected => f.write_str("already connected"),
            Error::NoOp => f.write_str("no operation"),
            Error::MicFail => f.write_str("MIC check failed"),
            Error::Radio => f.write_str("radio error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Outcome recorded in confirmation and indication records
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInfoStatus {
    /// Service performed successfully
    Ok,
    /// Generic error
    Error,
    /// The radio did not finish transmitting in time
    TxTimeout,
    /// Nothing received in RX1
    Rx1Timeout,
    /// Nothing received in RX2
    Rx2Timeout,
    /// Reception error in RX1
    Rx1Error,
    /// Reception error in RX2
    Rx2Error,
    /// Join procedure exhausted its trials
    JoinFail,
    /// Downlink frame counter already seen
    DownlinkRepeated,
    /// Payload does not fit the datarate
    TxDrPayloadSizeError,
    /// Too many downlink frames lost
    DownlinkTooManyFramesLoss,
    /// Frame not addressed to this device
    AddressFail,
    /// MIC check failed
    MicFail,
    /// Crypto collaborator failed
    CryptoFail,
}

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;
