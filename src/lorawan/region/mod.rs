//! Regional parameters
//!
//! Each LoRaWAN region is a variant of [`Region`]; its static description is a
//! [`RegionTables`] value. All algorithms operating on these tables live in
//! [`RegionalPhy`](crate::lorawan::phy::RegionalPhy), which is the only owner
//! of the mutable channel, band and mask state derived from them.

mod eu868;

pub use eu868::EU868;

use crate::radio::Modem;
use crate::timer::TimerTime;

/// Upper bound of channels any supported region defines
pub const MAX_CHANNELS: usize = 16;

/// Upper bound of sub-bands any supported region defines
pub const MAX_BANDS: usize = 6;

/// Number of 16-bit words backing a [`ChannelMask`]
pub const MASK_WORDS: usize = (MAX_CHANNELS + 15) / 16;

/// Data rate description
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRate {
    /// Modem used at this rate
    pub modem: Modem,
    /// Spreading factor, or kbps for FSK
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
}

impl DataRate {
    /// LoRa rate from spreading factor and bandwidth
    pub const fn lora(spreading_factor: u8, bandwidth: u32) -> Self {
        Self {
            modem: Modem::LoRa,
            spreading_factor,
            bandwidth,
        }
    }

    /// Symbol duration in microseconds
    pub fn symbol_time_us(&self) -> u32 {
        match self.modem {
            // Eight bit periods per "symbol" for FSK.
            Modem::Fsk => 8_000 / u32::from(self.spreading_factor.max(1)),
            Modem::LoRa => ((1u64 << self.spreading_factor) * 1_000_000 / u64::from(self.bandwidth)) as u32,
        }
    }
}

/// Inclusive datarate range a channel supports
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrRange {
    /// Minimum datarate index
    pub min: u8,
    /// Maximum datarate index
    pub max: u8,
}

impl DrRange {
    /// Build a range
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    /// Decode the NewChannelReq byte (max in the high nibble)
    pub fn from_byte(byte: u8) -> Self {
        Self {
            min: byte & 0x0F,
            max: (byte >> 4) & 0x0F,
        }
    }

    /// True when `dr` falls inside the range
    pub fn contains(&self, dr: u8) -> bool {
        self.min <= dr && dr <= self.max
    }
}

/// Uplink channel
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channel {
    /// Uplink frequency in Hz, 0 when the slot is unused
    pub frequency: u32,
    /// RX1 downlink frequency in Hz, 0 to use the uplink frequency
    pub rx1_frequency: u32,
    /// Allowed datarates
    pub dr_range: DrRange,
    /// Sub-band the channel belongs to
    pub band: u8,
}

impl Channel {
    /// Build a channel
    pub const fn new(frequency: u32, dr_range: DrRange, band: u8) -> Self {
        Self {
            frequency,
            rx1_frequency: 0,
            dr_range,
            band,
        }
    }

    /// True when the slot holds a channel
    pub fn is_defined(&self) -> bool {
        self.frequency != 0
    }
}

/// Regulatory sub-band
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    /// Inverse duty cycle (100 means 1 %)
    pub duty_cycle: u16,
    /// Strongest TX power index allowed in the band
    pub max_tx_power: u8,
    /// Lowest frequency of the band in Hz
    pub low_frequency: u32,
    /// Highest frequency of the band in Hz
    pub high_frequency: u32,
    /// End of the last data transmission
    pub last_tx_time: TimerTime,
    /// End of the last join-request transmission
    pub last_join_tx_time: TimerTime,
    /// Time the band must stay silent after the last transmission
    pub off_time: u32,
}

impl Band {
    /// Static band definition
    pub const fn new(duty_cycle: u16, max_tx_power: u8, low_frequency: u32, high_frequency: u32) -> Self {
        Self {
            duty_cycle,
            max_tx_power,
            low_frequency,
            high_frequency,
            last_tx_time: 0,
            last_join_tx_time: 0,
            off_time: 0,
        }
    }

    /// True when `frequency` lies inside the band
    pub fn contains(&self, frequency: u32) -> bool {
        self.low_frequency <= frequency && frequency <= self.high_frequency
    }
}

/// Bitset over channel indices
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask([u16; MASK_WORDS]);

impl ChannelMask {
    /// Mask with no channel enabled
    pub const fn empty() -> Self {
        Self([0; MASK_WORDS])
    }

    /// Mask with the first `count` channels enabled
    pub fn first(count: usize) -> Self {
        let mut mask = Self::empty();
        for i in 0..count.min(MAX_CHANNELS) {
            mask.set(i);
        }
        mask
    }

    /// Enable channel `index`. Out of range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < MAX_CHANNELS {
            self.0[index / 16] |= 1 << (index % 16);
        }
    }

    /// Disable channel `index`. Out of range indices are ignored.
    pub fn clear(&mut self, index: usize) {
        if index < MAX_CHANNELS {
            self.0[index / 16] &= !(1 << (index % 16));
        }
    }

    /// True when channel `index` is enabled
    pub fn test(&self, index: usize) -> bool {
        index < MAX_CHANNELS && self.0[index / 16] & (1 << (index % 16)) != 0
    }

    /// Number of enabled channels
    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when no channel is enabled
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Enable every channel of `other` as well
    pub fn union(&mut self, other: &ChannelMask) {
        for (dst, src) in self.0.iter_mut().zip(other.0.iter()) {
            *dst |= *src;
        }
    }

    /// 16-bit block `index`, as carried by LinkADRReq
    pub fn word(&self, index: usize) -> u16 {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// Replace 16-bit block `index`
    pub fn set_word(&mut self, index: usize, value: u16) {
        if let Some(word) = self.0.get_mut(index) {
            *word = value;
        }
    }

    /// Enabled channel indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CHANNELS).filter(move |i| self.test(*i))
    }
}

/// Static description of a region
#[derive(Debug)]
pub struct RegionTables {
    /// Region name
    pub name: &'static str,
    /// Channels the region can hold
    pub max_channels: u8,
    /// Channels defined at start-up; they cannot be removed
    pub default_channels: &'static [Channel],
    /// Sub-bands
    pub bands: &'static [Band],
    /// Datarate table indexed by DR
    pub datarates: &'static [DataRate],
    /// Maximum MACPayload size (FHDR excluded) indexed by DR
    pub max_payload: &'static [u8],
    /// Lowest uplink datarate
    pub min_tx_datarate: u8,
    /// Highest uplink datarate
    pub max_tx_datarate: u8,
    /// Lowest downlink datarate
    pub min_rx_datarate: u8,
    /// Highest downlink datarate
    pub max_rx_datarate: u8,
    /// Highest datarate a default channel must allow
    pub default_max_datarate: u8,
    /// Datarate used after reset
    pub default_datarate: u8,
    /// Largest RX1 datarate offset
    pub max_rx1_dr_offset: u8,
    /// Strongest TX power index
    pub max_tx_power: u8,
    /// Weakest TX power index
    pub min_tx_power: u8,
    /// TX power index after reset
    pub default_tx_power: u8,
    /// Maximum EIRP in dBm
    pub max_eirp: i8,
    /// Antenna gain in hundredths of dBi
    pub antenna_gain_cdb: i16,
    /// RX2 frequency after reset
    pub rx2_frequency: u32,
    /// RX2 datarate after reset
    pub rx2_datarate: u8,
    /// Lowest frequency allowed for any channel
    pub min_frequency: u32,
    /// Highest frequency allowed for any channel
    pub max_frequency: u32,
    /// Join accept may carry a frequency CFList
    pub cflist_supported: bool,
    /// Application may install its own channel plan
    pub custom_channel_plan_supported: bool,
    /// TXParamSetupReq is honored
    pub accept_tx_param_setup: bool,
    /// DlChannelReq is honored
    pub dl_channel_req_supported: bool,
    /// Duty cycle enforced after reset
    pub duty_cycle_on: bool,
}

/// Supported regions
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Europe 863-870 MHz
    Eu868,
}

impl Region {
    /// Static tables of the region
    pub fn tables(&self) -> &'static RegionTables {
        match self {
            Region::Eu868 => &EU868,
        }
    }
}
