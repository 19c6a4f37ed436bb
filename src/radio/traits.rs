use heapless::Vec;

/// Largest PHY payload a LoRa radio can carry
pub const MAX_PHY_PAYLOAD: usize = 255;

/// Radio modem type
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modem {
    /// Frequency shift keying
    Fsk,
    /// LoRa chirp spread spectrum
    LoRa,
}

/// Radio operating state
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// Idle or sleeping
    Idle,
    /// Receiving
    RxRunning,
    /// Transmitting
    TxRunning,
    /// Channel activity detection
    Cad,
}

/// Radio modulation parameters
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationParams {
    /// Modem type
    pub modem: Modem,
    /// Spreading factor (SF7-SF12), or bitrate in bps for FSK
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate denominator (4/5 = 5 .. 4/8 = 8)
    pub coding_rate: u8,
}

/// Radio transmission parameters
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxConfig {
    /// Transmission power in dBm at the radio output
    pub power: i8,
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
    /// Preamble length in symbols
    pub preamble_len: u16,
    /// Transmission timeout in milliseconds
    pub timeout_ms: u32,
}

/// Radio receive parameters
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxConfig {
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
    /// Symbol timeout of the receive window
    pub symbol_timeout: u16,
    /// Maximum payload accepted
    pub max_payload_len: u8,
    /// Keep receiving until stopped (class C)
    pub continuous: bool,
    /// Invert IQ (downlinks)
    pub iq_inverted: bool,
}

/// Event raised by the radio driver from interrupt context.
///
/// The driver never calls into the stack directly; it posts these to the
/// device, which handles them on the dispatcher thread.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Transmission finished
    TxDone,
    /// A frame was received
    RxDone {
        /// Received bytes
        payload: Vec<u8, MAX_PHY_PAYLOAD>,
        /// Received signal strength in dBm
        rssi: i16,
        /// Signal to noise ratio in dB
        snr: i8,
    },
    /// Transmission did not complete in time
    TxTimeout,
    /// Receive window closed without a frame
    RxTimeout,
    /// A frame was received but failed the radio CRC
    RxError,
}

/// Generic radio interface trait
pub trait Radio {
    /// Error type for radio operations
    type Error: core::fmt::Debug;

    /// Initialize the radio
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Hardware reset
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Put the radio into sleep mode
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Put the radio into standby mode
    fn standby(&mut self) -> Result<(), Self::Error>;

    /// Configure the radio for reception
    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error>;

    /// Configure the radio for transmission
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error>;

    /// Start transmitting, completion is signalled with [`RadioEvent::TxDone`]
    fn send(&mut self, buffer: &[u8]) -> Result<(), Self::Error>;

    /// Start receiving with the last RX configuration
    fn receive(&mut self) -> Result<(), Self::Error>;

    /// Set the carrier frequency
    fn set_channel(&mut self, freq: u32) -> Result<(), Self::Error>;

    /// 32-bit random number from RSSI noise
    fn random(&mut self) -> u32;

    /// Current radio state
    fn get_status(&mut self) -> RadioState;

    /// Maximum payload the radio accepts for a modem
    fn set_max_payload_length(&mut self, modem: Modem, max: u8) -> Result<(), Self::Error>;

    /// Select the public or private network sync word
    fn set_public_network(&mut self, enable: bool) -> Result<(), Self::Error>;

    /// Time on air in milliseconds of a packet of `len` bytes with the
    /// current TX configuration
    fn time_on_air(&mut self, modem: Modem, len: u8) -> u32;

    /// Listen before talk; true when the channel is free
    fn perform_carrier_sense(
        &mut self,
        modem: Modem,
        freq: u32,
        rssi_threshold: i16,
        max_carrier_sense_time: u32,
    ) -> bool;

    /// Check that the hardware supports the frequency
    fn check_rf_frequency(&mut self, freq: u32) -> bool;

    /// Emit an unmodulated carrier for `time_s` seconds
    fn set_tx_continuous_wave(&mut self, freq: u32, power: i8, time_s: u16) -> Result<(), Self::Error>;

    /// Acquire exclusive access on preemptive systems
    fn lock(&mut self) {}

    /// Release exclusive access on preemptive systems
    fn unlock(&mut self) {}
}
