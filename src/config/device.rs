//! Device credentials and connection configuration

/// EUI-64 (8 bytes, over-the-air byte order)
pub type EUI64 = [u8; 8];

/// AES-128 key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Wrap raw key bytes
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True when every byte is zero, i.e. the key was never provisioned
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

// Keys never end up in logs.
impl core::fmt::Debug for AESKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AESKey(..)")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AESKey {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "AESKey(..)")
    }
}

/// Device address
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevAddr(u32);

impl DevAddr {
    /// Create from its numeric value
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Decode from the little-endian wire representation
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    /// Little-endian wire representation
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Numeric value
    pub fn value(self) -> u32 {
        self.0
    }
}

/// LoRaWAN device class
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Class A: Uplink followed by two receive windows
    A,
    /// Class B: Scheduled receive slots (beaconing)
    B,
    /// Class C: Continuously listening except when transmitting
    C,
}

/// Over-the-air activation credentials
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OtaaCredentials {
    /// Device EUI
    pub dev_eui: EUI64,
    /// Application EUI
    pub app_eui: EUI64,
    /// Application key
    pub app_key: AESKey,
    /// Number of join-request transmissions before giving up
    pub nb_trials: u8,
}

/// Activation-by-personalization credentials
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbpCredentials {
    /// Network identifier
    pub net_id: u32,
    /// Device address
    pub dev_addr: DevAddr,
    /// Network session key
    pub nwk_skey: AESKey,
    /// Application session key
    pub app_skey: AESKey,
}

/// How the device obtains its session
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Over-the-air activation
    Otaa(OtaaCredentials),
    /// Activation by personalization
    Abp(AbpCredentials),
}

/// Device configuration for both OTAA and ABP activation
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    /// Activation credentials
    pub activation: Activation,
    /// Class to switch to once connected
    pub device_class: DeviceClass,
    /// Adaptive datarate enabled
    pub adr_enabled: bool,
    /// Regulatory duty cycle enforced
    pub duty_cycle_on: bool,
    /// Public (true) or private network sync word
    pub public_network: bool,
    /// Transmissions of a confirmed uplink before reporting failure
    pub confirmed_msg_retries: u8,
    /// Datarate used when ADR is off, `None` for the region default
    pub data_rate: Option<u8>,
}

/// Default number of join-request transmissions
pub const DEFAULT_NB_TRIALS: u8 = 8;

/// Default confirmed uplink transmission count
pub const DEFAULT_CONFIRMED_RETRIES: u8 = 1;

impl DeviceConfig {
    /// Create a new OTAA device configuration
    pub fn new_otaa(dev_eui: EUI64, app_eui: EUI64, app_key: AESKey) -> Self {
        Self::with_activation(Activation::Otaa(OtaaCredentials {
            dev_eui,
            app_eui,
            app_key,
            nb_trials: DEFAULT_NB_TRIALS,
        }))
    }

    /// Create a new ABP device configuration
    pub fn new_abp(net_id: u32, dev_addr: DevAddr, nwk_skey: AESKey, app_skey: AESKey) -> Self {
        Self::with_activation(Activation::Abp(AbpCredentials {
            net_id,
            dev_addr,
            nwk_skey,
            app_skey,
        }))
    }

    fn with_activation(activation: Activation) -> Self {
        Self {
            activation,
            device_class: DeviceClass::A,
            adr_enabled: true,
            duty_cycle_on: true,
            public_network: true,
            confirmed_msg_retries: DEFAULT_CONFIRMED_RETRIES,
            data_rate: None,
        }
    }

    /// Override the number of join trials (OTAA only)
    pub fn with_nb_trials(mut self, nb_trials: u8) -> Self {
        if let Activation::Otaa(ref mut otaa) = self.activation {
            otaa.nb_trials = nb_trials;
        }
        self
    }

    /// Enable or disable duty cycle enforcement
    pub fn with_duty_cycle(mut self, on: bool) -> Self {
        self.duty_cycle_on = on;
        self
    }

    /// Enable or disable ADR
    pub fn with_adr(mut self, on: bool) -> Self {
        self.adr_enabled = on;
        self
    }

    /// Select the device class applied after connecting
    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.device_class = class;
        self
    }

    /// True when this is an OTAA configuration
    pub fn is_otaa(&self) -> bool {
        matches!(self.activation, Activation::Otaa(_))
    }
}
