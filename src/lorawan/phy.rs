//! Regional PHY engine
//!
//! [`RegionalPhy`] owns the mutable channel, band and mask state of one
//! region and implements the algorithms the MAC needs from it: channel
//! selection under duty cycle, ADR back-off, RX/TX radio parameters and
//! validation of network-issued parameter changes. Callers only ever see
//! computed decisions or copies of the tables.

use heapless::Vec;

use super::region::{
    Band, Channel, ChannelMask, DrRange, Region, RegionTables, MAX_BANDS, MAX_CHANNELS,
};
use crate::error::{Error, Result};
use crate::radio::{ModulationParams, RxConfig, TxConfig, MAX_PHY_PAYLOAD};
use crate::timer::TimerTime;

/// Join duty cycle during the first hour after start-up (1 %)
pub const BACKOFF_DC_1_HOUR: u16 = 100;
/// Join duty cycle during the following ten hours (0.1 %)
pub const BACKOFF_DC_10_HOURS: u16 = 1000;
/// Join duty cycle afterwards (0.01 %)
pub const BACKOFF_DC_24_HOURS: u16 = 10000;

const ONE_HOUR_MS: u32 = 3_600_000;
const ELEVEN_HOURS_MS: u32 = ONE_HOUR_MS + 36_000_000;

/// Preamble length the network uses for downlinks, in symbols
const DOWNLINK_PREAMBLE_SYMBOLS: u32 = 8;

/// Uplink preamble length in symbols
const UPLINK_PREAMBLE_SYMBOLS: u16 = 8;

/// Upper bound on a radio TX attempt before the radio reports a timeout
const TX_TIMEOUT_MS: u32 = 4_000;

/// EIRP values selected by TXParamSetupReq
const MAX_EIRP_TABLE: [i8; 16] = [8, 10, 12, 13, 14, 16, 18, 20, 21, 24, 26, 27, 29, 30, 33, 36];

/// LinkADRReq length including its command identifier
pub const LINK_ADR_REQ_LEN: usize = 5;

const SRV_MAC_LINK_ADR_REQ: u8 = 0x03;

/// Inputs of [`RegionalPhy::set_next_channel`]
#[derive(Debug, Clone, Copy)]
pub struct NextChannelParams {
    /// Datarate of the next uplink
    pub datarate: u8,
    /// Network joined
    pub joined: bool,
    /// Duty cycle enforced
    pub dc_enabled: bool,
    /// End of the last uplink for the aggregated duty cycle
    pub aggregated_last_tx_time: TimerTime,
    /// Aggregated silence required after that uplink
    pub aggregated_timeoff: u32,
}

/// Inputs of [`RegionalPhy::link_adr_request`]
#[derive(Debug, Clone, Copy)]
pub struct LinkAdrParams<'a> {
    /// Downlink MAC commands starting at the first LinkADRReq
    pub payload: &'a [u8],
    /// Current uplink datarate
    pub current_datarate: u8,
    /// Current TX power index
    pub current_tx_power: u8,
    /// Current repetition count
    pub current_nb_rep: u8,
}

/// Result of [`RegionalPhy::link_adr_request`]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAdrAnswer {
    /// bit0 channel mask ok, bit1 datarate ok, bit2 power ok
    pub status: u8,
    /// Datarate to adopt
    pub datarate: u8,
    /// TX power index to adopt
    pub tx_power: u8,
    /// Repetition count to adopt
    pub nb_rep: u8,
    /// Bytes of the command stream consumed, 0 when nothing could be parsed
    pub bytes_consumed: usize,
}

/// Outcome of [`RegionalPhy::get_next_adr`]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrNext {
    /// Set ADRACKReq in the next uplink
    pub adr_ack_req: bool,
    /// Datarate of the next uplink
    pub datarate: u8,
    /// TX power index of the next uplink
    pub tx_power: u8,
}

/// Timing of one receive window
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxWindowParams {
    /// Downlink datarate
    pub datarate: u8,
    /// Correction added to the nominal window delay
    pub window_offset_ms: i32,
    /// Receive timeout in symbols
    pub symbol_timeout: u16,
}

/// RXParamSetupReq content
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxParamSetup {
    /// RX1 datarate offset
    pub dr_offset: u8,
    /// RX2 datarate
    pub datarate: u8,
    /// RX2 frequency in Hz
    pub frequency: u32,
}

/// Regional PHY state and algorithms
#[derive(Debug, Clone)]
pub struct RegionalPhy {
    region: Region,
    tables: &'static RegionTables,
    channels: [Channel; MAX_CHANNELS],
    bands: Vec<Band, MAX_BANDS>,
    mask: ChannelMask,
    default_mask: ChannelMask,
    uplink_dwell_time: bool,
    downlink_dwell_time: bool,
    max_eirp: i8,
}

impl RegionalPhy {
    /// Create the PHY with the region's default channel plan
    pub fn new(region: Region) -> Self {
        let tables = region.tables();
        let mut phy = Self {
            region,
            tables,
            channels: [Channel::default(); MAX_CHANNELS],
            bands: Vec::new(),
            mask: ChannelMask::empty(),
            default_mask: ChannelMask::empty(),
            uplink_dwell_time: false,
            downlink_dwell_time: false,
            max_eirp: tables.max_eirp,
        };
        phy.reset();
        phy
    }

    /// Drop every network-provided change and return to the default plan
    pub fn reset(&mut self) {
        self.channels = [Channel::default(); MAX_CHANNELS];
        for (slot, ch) in self.channels.iter_mut().zip(self.tables.default_channels) {
            *slot = *ch;
        }
        self.bands.clear();
        for band in self.tables.bands.iter().take(MAX_BANDS) {
            // Capacity matches the table bound above.
            let _ = self.bands.push(*band);
        }
        self.default_mask = ChannelMask::first(self.tables.default_channels.len());
        self.mask = self.default_mask;
        self.uplink_dwell_time = false;
        self.downlink_dwell_time = false;
        self.max_eirp = self.tables.max_eirp;
    }

    /// Region this PHY implements
    pub fn region(&self) -> Region {
        self.region
    }

    /// Static tables of the region
    pub fn tables(&self) -> &'static RegionTables {
        self.tables
    }

    /// Number of channel slots
    pub fn max_channels(&self) -> usize {
        (self.tables.max_channels as usize).min(MAX_CHANNELS)
    }

    /// Number of protected default channels
    pub fn default_channel_count(&self) -> usize {
        self.tables.default_channels.len()
    }

    /// Copy of channel `id`, `None` when the slot is empty or out of range
    pub fn channel(&self, id: usize) -> Option<Channel> {
        self.channels
            .get(id)
            .filter(|ch| id < self.max_channels() && ch.is_defined())
            .copied()
    }

    /// Copy of band `index`
    pub fn band(&self, index: usize) -> Option<Band> {
        self.bands.get(index).copied()
    }

    /// Currently enabled channels
    pub fn channel_mask(&self) -> ChannelMask {
        self.mask
    }

    /// Channels restored when nothing else is usable
    pub fn default_channel_mask(&self) -> ChannelMask {
        self.default_mask
    }

    /// Re-enable the default channels
    pub fn restore_default_channels(&mut self) {
        self.mask.union(&self.default_mask);
    }

    /// Current maximum EIRP in dBm
    pub fn max_eirp(&self) -> i8 {
        self.max_eirp
    }

    /// Uplink and downlink dwell time limits
    pub fn dwell_time(&self) -> (bool, bool) {
        (self.uplink_dwell_time, self.downlink_dwell_time)
    }

    // ---------------------------------------------------------------------
    // Validation predicates
    // ---------------------------------------------------------------------

    /// Uplink datarate within region bounds
    pub fn verify_tx_datarate(&self, dr: u8) -> bool {
        self.tables.min_tx_datarate <= dr && dr <= self.tables.max_tx_datarate
    }

    /// Downlink datarate within region bounds
    pub fn verify_rx_datarate(&self, dr: u8) -> bool {
        self.tables.min_rx_datarate <= dr && dr <= self.tables.max_rx_datarate
    }

    /// TX power index within region bounds
    pub fn verify_tx_power(&self, tx_power: u8) -> bool {
        self.tables.max_tx_power <= tx_power && tx_power <= self.tables.min_tx_power
    }

    /// Duty cycle setting matches what the region mandates
    pub fn verify_duty_cycle(&self, on: bool) -> bool {
        on == self.tables.duty_cycle_on
    }

    /// At least one join trial
    pub fn verify_nb_join_trials(&self, nb_trials: u8) -> bool {
        nb_trials >= 1
    }

    /// RX1 datarate offset within region bounds
    pub fn verify_rx1_dr_offset(&self, offset: u8) -> bool {
        offset <= self.tables.max_rx1_dr_offset
    }

    /// Frequency inside the region and inside one of its bands
    pub fn verify_frequency(&self, frequency: u32) -> bool {
        self.band_index(frequency).is_some()
    }

    fn band_index(&self, frequency: u32) -> Option<u8> {
        if frequency < self.tables.min_frequency || frequency > self.tables.max_frequency {
            return None;
        }
        self.bands
            .iter()
            .position(|band| band.contains(frequency))
            .map(|i| i as u8)
    }

    /// Maximum FOpts + FRMPayload size at `dr`
    pub fn max_payload(&self, dr: u8) -> usize {
        self.tables
            .max_payload
            .get(dr as usize)
            .copied()
            .unwrap_or(0) as usize
    }

    /// Next slower uplink datarate
    pub fn get_next_lower_tx_datarate(&self, dr: u8) -> u8 {
        if dr <= self.tables.min_tx_datarate {
            self.tables.min_tx_datarate
        } else {
            dr - 1
        }
    }

    /// Datarate of join trial `trial` (0 for the first attempt)
    pub fn get_alternate_dr(&self, trial: u16) -> u8 {
        let dr = if trial % 48 == 0 {
            0
        } else if trial % 32 == 0 {
            1
        } else if trial % 24 == 0 {
            2
        } else if trial % 16 == 0 {
            3
        } else if trial % 8 == 0 {
            4
        } else {
            5
        };
        dr.max(self.tables.min_tx_datarate).min(self.tables.default_max_datarate)
    }

    // ---------------------------------------------------------------------
    // ADR and duty cycle
    // ---------------------------------------------------------------------

    /// ADR back-off applied before an uplink while the network stays silent
    pub fn get_next_adr(
        &mut self,
        restore_channel_mask: bool,
        datarate: u8,
        tx_power: u8,
        adr_ack_cnt: &mut u32,
        adr_ack_limit: u16,
        adr_ack_delay: u16,
    ) -> AdrNext {
        let mut next = AdrNext {
            adr_ack_req: false,
            datarate,
            tx_power,
        };

        if datarate == self.tables.min_tx_datarate {
            *adr_ack_cnt = 0;
            return next;
        }

        let limit = u32::from(adr_ack_limit);
        let delay = u32::from(adr_ack_delay).max(1);
        if *adr_ack_cnt < limit {
            return next;
        }

        next.adr_ack_req = true;
        next.tx_power = self.tables.max_tx_power;

        if *adr_ack_cnt >= limit + delay && *adr_ack_cnt % delay == 1 % delay {
            next.datarate = self.get_next_lower_tx_datarate(datarate);
            debug!("ADR back-off: DR{} -> DR{}", datarate, next.datarate);
            if next.datarate == self.tables.min_tx_datarate {
                next.adr_ack_req = false;
                if restore_channel_mask {
                    self.restore_default_channels();
                }
            }
        }
        next
    }

    /// Compute the silence the band of `channel` must keep after an uplink
    /// of `time_on_air` ms. `elapsed_time` is the time since start-up.
    pub fn calculate_backoff(
        &mut self,
        joined: bool,
        last_tx_was_join_req: bool,
        dc_enabled: bool,
        channel: u8,
        elapsed_time: u32,
        time_on_air: u32,
    ) {
        let Some(band_idx) = self.channels.get(channel as usize).map(|ch| ch.band as usize) else {
            return;
        };
        let Some(band) = self.bands.get_mut(band_idx) else {
            return;
        };

        let mut duty_cycle = band.duty_cycle;
        if !joined {
            let join_duty_cycle = if elapsed_time <= ONE_HOUR_MS {
                BACKOFF_DC_1_HOUR
            } else if elapsed_time <= ELEVEN_HOURS_MS {
                BACKOFF_DC_10_HOURS
            } else {
                BACKOFF_DC_24_HOURS
            };
            duty_cycle = duty_cycle.max(join_duty_cycle);
        }

        band.off_time = if !dc_enabled && !last_tx_was_join_req {
            0
        } else {
            time_on_air
                .saturating_mul(u32::from(duty_cycle))
                .saturating_sub(time_on_air)
        };
        trace!("band {} off time {} ms", band_idx, band.off_time);
    }

    /// Record the end of a transmission on `channel`
    pub fn set_band_tx_done(&mut self, channel: u8, joined: bool, now: TimerTime) {
        let Some(band_idx) = self.channels.get(channel as usize).map(|ch| ch.band as usize) else {
            return;
        };
        if let Some(band) = self.bands.get_mut(band_idx) {
            if joined {
                band.last_tx_time = now;
            } else {
                band.last_join_tx_time = now;
                band.last_tx_time = now;
            }
        }
    }

    /// Clear elapsed band off-times and return the shortest remaining one
    fn update_band_timeoff(&mut self, joined: bool, dc_enabled: bool, now: TimerTime) -> u32 {
        let mut next_tx_delay = u32::MAX;
        for band in self.bands.iter_mut() {
            if !joined || dc_enabled {
                let since = if joined {
                    band.last_tx_time
                } else {
                    band.last_join_tx_time
                };
                let elapsed = now.wrapping_sub(since);
                if band.off_time <= elapsed {
                    band.off_time = 0;
                } else {
                    next_tx_delay = next_tx_delay.min(band.off_time - elapsed);
                }
            } else {
                band.off_time = 0;
            }
        }
        next_tx_delay
    }

    /// Pick a channel for the next uplink.
    ///
    /// `random` selects among the eligible channels. Returns the channel
    /// index, [`Error::DutyCycleRestricted`] when every eligible channel is
    /// still silent, or [`Error::NoChannelFound`] when no enabled channel
    /// supports the datarate (the default channels are then re-enabled).
    pub fn set_next_channel(
        &mut self,
        params: &NextChannelParams,
        now: TimerTime,
        random: u32,
    ) -> Result<u8> {
        if self.mask.is_empty() {
            self.restore_default_channels();
        }

        let mut delay_tx = 0u8;
        let mut enabled: Vec<u8, MAX_CHANNELS> = Vec::new();
        let next_tx_delay;

        let aggregated_elapsed = now.wrapping_sub(params.aggregated_last_tx_time);
        if params.aggregated_timeoff <= aggregated_elapsed {
            next_tx_delay = self.update_band_timeoff(params.joined, params.dc_enabled, now);
            delay_tx = self.enabled_channels(params.datarate, params.joined, &mut enabled);
        } else {
            delay_tx += 1;
            next_tx_delay = params.aggregated_timeoff - aggregated_elapsed;
        }

        if !enabled.is_empty() {
            let pick = enabled[(random as usize) % enabled.len()];
            debug!("channel {} selected among {}", pick, enabled.len());
            return Ok(pick);
        }

        if delay_tx > 0 {
            return Err(Error::DutyCycleRestricted {
                retry_after_ms: next_tx_delay,
            });
        }

        warn!("no channel supports DR{}", params.datarate);
        self.restore_default_channels();
        Err(Error::NoChannelFound)
    }

    /// Collect channels usable at `dr`; returns how many were skipped only
    /// because their band is still silent.
    fn enabled_channels(&self, dr: u8, joined: bool, out: &mut Vec<u8, MAX_CHANNELS>) -> u8 {
        let mut delayed = 0;
        for id in self.mask.iter().take_while(|id| *id < self.max_channels()) {
            let ch = &self.channels[id];
            if !ch.is_defined() {
                continue;
            }
            // Join requests only go out on the default channels.
            if !joined && !self.default_mask.test(id) {
                continue;
            }
            if !ch.dr_range.contains(dr) {
                continue;
            }
            if self.bands.get(ch.band as usize).map_or(true, |b| b.off_time > 0) {
                delayed += 1;
                continue;
            }
            let _ = out.push(id as u8);
        }
        delayed
    }

    // ---------------------------------------------------------------------
    // Network-driven parameter changes
    // ---------------------------------------------------------------------

    /// Process one or more consecutive LinkADRReq blocks.
    ///
    /// The resulting channel mask, datarate and power are only applied by
    /// the caller when `status == 0x07`; the mask is applied here.
    pub fn link_adr_request(&mut self, params: &LinkAdrParams<'_>) -> LinkAdrAnswer {
        let mut status = 0x07u8;
        let mut consumed = 0usize;
        let mut mask = self.mask;
        let mut datarate = params.current_datarate;
        let mut tx_power = params.current_tx_power;
        let mut nb_rep = params.current_nb_rep;

        let payload = params.payload;
        while payload.get(consumed) == Some(&SRV_MAC_LINK_ADR_REQ) {
            let Some(block) = payload.get(consumed..consumed + LINK_ADR_REQ_LEN) else {
                // Truncated block: nothing usable.
                consumed = 0;
                break;
            };
            consumed += LINK_ADR_REQ_LEN;

            datarate = (block[1] >> 4) & 0x0F;
            tx_power = block[1] & 0x0F;
            let ch_mask = u16::from_le_bytes([block[2], block[3]]);
            let ch_mask_ctrl = (block[4] >> 4) & 0x07;
            nb_rep = block[4] & 0x0F;

            status = 0x07;
            match ch_mask_ctrl {
                0 => {
                    for i in 0..16usize.min(self.max_channels()) {
                        if ch_mask & (1 << i) != 0 && !self.channels[i].is_defined() {
                            status &= 0xFE;
                        }
                    }
                    mask.set_word(0, ch_mask);
                }
                6 => {
                    for i in 0..self.max_channels() {
                        if self.channels[i].is_defined() {
                            mask.set(i);
                        }
                    }
                }
                _ => status &= 0xFE,
            }
        }

        if consumed == 0 {
            return LinkAdrAnswer {
                status,
                datarate: params.current_datarate,
                tx_power: params.current_tx_power,
                nb_rep: params.current_nb_rep,
                bytes_consumed: 0,
            };
        }

        if mask.is_empty() {
            status &= 0xFE;
        }
        if !self.verify_channel_dr(&mask, datarate) {
            status &= 0xFD;
        }
        if !self.verify_tx_power(tx_power) {
            if tx_power < self.tables.max_tx_power {
                tx_power = self.tables.max_tx_power;
            } else {
                status &= 0xFB;
            }
        }

        if status == 0x07 {
            if nb_rep == 0 {
                nb_rep = params.current_nb_rep;
            }
            self.mask = mask;
        } else {
            datarate = params.current_datarate;
            tx_power = params.current_tx_power;
            nb_rep = params.current_nb_rep;
        }

        LinkAdrAnswer {
            status,
            datarate,
            tx_power,
            nb_rep,
            bytes_consumed: consumed,
        }
    }

    fn verify_channel_dr(&self, mask: &ChannelMask, dr: u8) -> bool {
        if !self.verify_tx_datarate(dr) {
            return false;
        }
        mask.iter()
            .filter(|id| *id < self.max_channels())
            .any(|id| self.channels[id].is_defined() && self.channels[id].dr_range.contains(dr))
    }

    /// RXParamSetupReq validation; bit0 channel ok, bit1 RX2 datarate ok,
    /// bit2 RX1 offset ok. `radio_accepts` is the radio's own frequency check.
    pub fn accept_rx_param_setup_req(&self, req: &RxParamSetup, radio_accepts: bool) -> u8 {
        let mut status = 0x07;
        if !radio_accepts || !self.verify_frequency(req.frequency) {
            status &= 0xFE;
        }
        if !self.verify_rx_datarate(req.datarate) {
            status &= 0xFD;
        }
        if !self.verify_rx1_dr_offset(req.dr_offset) {
            status &= 0xFB;
        }
        status
    }

    /// NewChannelReq; bit0 frequency ok, bit1 datarate range ok.
    /// A zero frequency removes the channel.
    pub fn request_new_channel(&mut self, id: u8, channel: &Channel) -> u8 {
        let mut status = 0x03;
        if channel.frequency == 0 {
            if !self.remove_channel(id) {
                status &= 0xFC;
            }
            return status;
        }
        match self.add_channel(channel, id) {
            Ok(()) => {}
            Err(Error::FrequencyInvalid) => status &= 0xFE,
            Err(Error::DatarateInvalid) => status &= 0xFD,
            Err(_) => status &= 0xFC,
        }
        status
    }

    /// TXParamSetupReq; false when the region ignores the command
    pub fn accept_tx_param_setup_req(&mut self, ul_dwell: bool, dl_dwell: bool, max_eirp_idx: u8) -> bool {
        if !self.tables.accept_tx_param_setup {
            return false;
        }
        self.uplink_dwell_time = ul_dwell;
        self.downlink_dwell_time = dl_dwell;
        self.max_eirp = MAX_EIRP_TABLE[(max_eirp_idx & 0x0F) as usize];
        true
    }

    /// DlChannelReq; bit0 frequency ok, bit1 uplink frequency exists
    pub fn dl_channel_request(&mut self, id: u8, rx1_frequency: u32, radio_accepts: bool) -> u8 {
        let mut status = 0x03;
        if !self.tables.dl_channel_req_supported {
            return 0;
        }
        if !radio_accepts || !self.verify_frequency(rx1_frequency) {
            status &= 0xFE;
        }
        if self.channel(id as usize).is_none() {
            status &= 0xFD;
        }
        if status == 0x03 {
            self.channels[id as usize].rx1_frequency = rx1_frequency;
        }
        status
    }

    /// Add or replace channel `id`
    pub fn add_channel(&mut self, channel: &Channel, id: u8) -> Result<()> {
        let id_usize = id as usize;
        if id_usize >= self.max_channels() {
            return Err(Error::ParameterInvalid);
        }

        let mut dr_invalid = !self.verify_tx_datarate(channel.dr_range.min)
            || !self.verify_tx_datarate(channel.dr_range.max)
            || channel.dr_range.min > channel.dr_range.max;
        let mut freq_invalid = false;

        if id_usize < self.default_channel_count() {
            if channel.dr_range.min > self.tables.min_tx_datarate {
                dr_invalid = true;
            }
            if channel.dr_range.max < self.tables.default_max_datarate
                || channel.dr_range.max > self.tables.max_tx_datarate
            {
                dr_invalid = true;
            }
            if channel.frequency != self.channels[id_usize].frequency {
                freq_invalid = true;
            }
        }

        let band = if freq_invalid {
            None
        } else {
            self.band_index(channel.frequency)
        };
        if band.is_none() {
            freq_invalid = true;
        }

        match (freq_invalid, dr_invalid, band) {
            (true, true, _) => Err(Error::FreqAndDrInvalid),
            (true, false, _) => Err(Error::FrequencyInvalid),
            (false, true, _) => Err(Error::DatarateInvalid),
            (false, false, Some(band)) => {
                self.channels[id_usize] = Channel { band, ..*channel };
                self.mask.set(id_usize);
                debug!("channel {} set to {} Hz", id, channel.frequency);
                Ok(())
            }
            (false, false, None) => Err(Error::FrequencyInvalid),
        }
    }

    /// Remove channel `id`; default channels are protected
    pub fn remove_channel(&mut self, id: u8) -> bool {
        let id = id as usize;
        if id < self.default_channel_count() || id >= self.max_channels() {
            return false;
        }
        self.channels[id] = Channel::default();
        self.mask.clear(id);
        true
    }

    /// Apply the frequency CFList of a join accept
    pub fn apply_cf_list(&mut self, cf_list: &[u8]) {
        if !self.tables.cflist_supported || cf_list.len() < 16 {
            return;
        }
        // Last byte is the CFListType; 0 means frequency list.
        if cf_list[15] != 0 {
            return;
        }
        let first = self.default_channel_count();
        for (i, chunk) in cf_list[..15].chunks_exact(3).enumerate() {
            let id = (first + i) as u8;
            let frequency = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], 0]) * 100;
            if frequency != 0 {
                let channel = Channel::new(
                    frequency,
                    DrRange::new(self.tables.min_tx_datarate, self.tables.default_max_datarate),
                    0,
                );
                if self.add_channel(&channel, id).is_err() {
                    warn!("CFList channel {} rejected", id);
                }
            } else {
                self.remove_channel(id);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Radio parameters
    // ---------------------------------------------------------------------

    /// RX1 datarate for an uplink at `dr`
    pub fn apply_rx1_dr_offset(&self, dr: u8, offset: u8) -> u8 {
        dr.saturating_sub(offset).max(self.tables.min_rx_datarate)
    }

    /// Window offset and symbol timeout for a window at `datarate`
    pub fn compute_rx_win_params(
        &self,
        datarate: u8,
        min_rx_symbols: u8,
        max_rx_error_ms: u32,
        wakeup_time_ms: u32,
    ) -> RxWindowParams {
        let dr = self.tables.datarates[(datarate as usize).min(self.tables.datarates.len() - 1)];
        let t_symbol_us = dr.symbol_time_us().max(1);
        let min_rx_symbols = u32::from(min_rx_symbols).min(DOWNLINK_PREAMBLE_SYMBOLS);

        // Aim at the last preamble symbols the radio needs to lock on.
        let target_offset_us = (DOWNLINK_PREAMBLE_SYMBOLS - min_rx_symbols) * t_symbol_us;
        let error_us = max_rx_error_ms * 1000;
        let wakeup_us = wakeup_time_ms * 1000;

        let offset_us = target_offset_us as i64 - error_us as i64 - wakeup_us as i64;
        let window_offset_ms = offset_us.div_euclid(1000) as i32;

        let window_us = min_rx_symbols * t_symbol_us + 2 * error_us + wakeup_us;
        let symbols = (window_us + t_symbol_us - 1) / t_symbol_us;
        let symbol_timeout = symbols.max(min_rx_symbols).min(0x3FF) as u16;

        RxWindowParams {
            datarate,
            window_offset_ms,
            symbol_timeout,
        }
    }

    /// Radio RX configuration for a window
    pub fn rx_config(&self, window: &RxWindowParams, frequency: u32, continuous: bool) -> RxConfig {
        let dr = self.tables.datarates[(window.datarate as usize).min(self.tables.datarates.len() - 1)];
        let max_payload = self.max_payload(window.datarate) + 13;
        RxConfig {
            frequency,
            modulation: ModulationParams {
                modem: dr.modem,
                spreading_factor: dr.spreading_factor,
                bandwidth: dr.bandwidth,
                coding_rate: 5,
            },
            symbol_timeout: window.symbol_timeout,
            max_payload_len: max_payload.min(MAX_PHY_PAYLOAD) as u8,
            continuous,
            iq_inverted: true,
        }
    }

    /// Radio output power for a TX power index on `channel`
    pub fn compute_tx_power_dbm(&self, channel: u8, tx_power: u8) -> i8 {
        let band_limit = self
            .channels
            .get(channel as usize)
            .and_then(|ch| self.bands.get(ch.band as usize))
            .map_or(self.tables.max_tx_power, |b| b.max_tx_power);
        // Higher index means lower power.
        let index = tx_power.max(band_limit);
        let eirp_cdb = (i32::from(self.max_eirp) - 2 * i32::from(index)) * 100;
        let phy_cdb = eirp_cdb - i32::from(self.tables.antenna_gain_cdb);
        phy_cdb.div_euclid(100) as i8
    }

    /// Radio TX configuration for an uplink on `channel`
    pub fn tx_config(&self, channel: u8, datarate: u8, tx_power: u8) -> Result<TxConfig> {
        let ch = self.channel(channel as usize).ok_or(Error::NoChannelFound)?;
        let dr = *self
            .tables
            .datarates
            .get(datarate as usize)
            .ok_or(Error::DatarateInvalid)?;
        Ok(TxConfig {
            power: self.compute_tx_power_dbm(channel, tx_power),
            frequency: ch.frequency,
            modulation: ModulationParams {
                modem: dr.modem,
                spreading_factor: dr.spreading_factor,
                bandwidth: dr.bandwidth,
                coding_rate: 5,
            },
            preamble_len: UPLINK_PREAMBLE_SYMBOLS,
            timeout_ms: TX_TIMEOUT_MS,
        })
    }
}
