//! MAC command buffering and downlink command processing
//!
//! [`MacCommandCodec`] owns two buffers. The next-tx buffer collects answers
//! and requests for the coming uplink and is cleared once that uplink went
//! out. The repeat buffer keeps sticky answers (RXParamSetupAns,
//! RXTimingSetupAns, DlChannelAns) which ride along every uplink until the
//! network sends a downlink.

use heapless::Vec;

use super::frame::MAX_FOPTS_LEN;
use super::params::ProtocolParams;
use super::phy::{LinkAdrParams, RegionalPhy, RxParamSetup, LINK_ADR_REQ_LEN};
use super::region::{Channel, DrRange};
use crate::error::{Error, Result};

/// Largest MAC command buffer a codec can be configured with
pub const MAC_COMMAND_BUFFER_LEN: usize = 128;

/// MAC command identifiers, shared by both directions
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandIdentifier {
    /// LinkCheckReq / LinkCheckAns
    LinkCheck = 0x02,
    /// LinkADRReq / LinkADRAns
    LinkAdr = 0x03,
    /// DutyCycleReq / DutyCycleAns
    DutyCycle = 0x04,
    /// RXParamSetupReq / RXParamSetupAns
    RxParamSetup = 0x05,
    /// DevStatusReq / DevStatusAns
    DevStatus = 0x06,
    /// NewChannelReq / NewChannelAns
    NewChannel = 0x07,
    /// RXTimingSetupReq / RXTimingSetupAns
    RxTimingSetup = 0x08,
    /// TXParamSetupReq / TXParamSetupAns
    TxParamSetup = 0x09,
    /// DlChannelReq / DlChannelAns
    DlChannel = 0x0A,
}

impl CommandIdentifier {
    /// Decode an opcode
    pub fn from_u8(cid: u8) -> Option<Self> {
        Some(match cid {
            0x02 => Self::LinkCheck,
            0x03 => Self::LinkAdr,
            0x04 => Self::DutyCycle,
            0x05 => Self::RxParamSetup,
            0x06 => Self::DevStatus,
            0x07 => Self::NewChannel,
            0x08 => Self::RxTimingSetup,
            0x09 => Self::TxParamSetup,
            0x0A => Self::DlChannel,
            _ => return None,
        })
    }

    /// Payload length of the downlink (server to device) command
    pub fn downlink_len(self) -> usize {
        match self {
            Self::LinkCheck => 2,
            Self::LinkAdr => 4,
            Self::DutyCycle => 1,
            Self::RxParamSetup => 4,
            Self::DevStatus => 0,
            Self::NewChannel => 5,
            Self::RxTimingSetup => 1,
            Self::TxParamSetup => 1,
            Self::DlChannel => 4,
        }
    }

    /// Payload length of the uplink (device to server) command
    pub fn uplink_len(self) -> usize {
        match self {
            Self::LinkCheck | Self::DutyCycle | Self::RxTimingSetup | Self::TxParamSetup => 0,
            Self::LinkAdr | Self::RxParamSetup | Self::NewChannel | Self::DlChannel => 1,
            Self::DevStatus => 2,
        }
    }

    /// Bytes the answer occupies in the uplink; LinkCheckAns has none
    pub fn answer_len(self) -> usize {
        match self {
            Self::LinkCheck => 0,
            _ => 1 + self.uplink_len(),
        }
    }

    /// Answers that must be repeated until a downlink is received
    pub fn is_sticky(self) -> bool {
        matches!(self, Self::RxParamSetup | Self::RxTimingSetup | Self::DlChannel)
    }
}

/// Network reply to a LinkCheckReq
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCheck {
    /// Demodulation margin in dB
    pub margin: u8,
    /// Gateways that received the request
    pub gateway_count: u8,
}

/// What the MAC must know after a downlink command stream was processed
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandsOutcome {
    /// LinkCheckAns content, if any
    pub link_check: Option<LinkCheck>,
    /// At least one sticky answer was queued
    pub sticky_queued: bool,
}

/// Outgoing MAC command buffers
#[derive(Debug, Clone)]
pub struct MacCommandCodec {
    buffer: Vec<u8, MAC_COMMAND_BUFFER_LEN>,
    repeat: Vec<u8, MAX_FOPTS_LEN>,
    capacity: usize,
    sticky: bool,
}

impl Default for MacCommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MacCommandCodec {
    /// Codec using the whole command buffer
    pub fn new() -> Self {
        Self::with_capacity(MAC_COMMAND_BUFFER_LEN)
    }

    /// Codec limited to `capacity` bytes of queued commands
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            repeat: Vec::new(),
            capacity: capacity.min(MAC_COMMAND_BUFFER_LEN),
            sticky: false,
        }
    }

    /// Free bytes in the next-tx buffer
    pub fn cmd_buffer_remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Commands queued for the next uplink
    pub fn commands(&self) -> &[u8] {
        &self.buffer
    }

    /// Sticky answers waiting for a downlink
    pub fn repeat_commands(&self) -> &[u8] {
        &self.repeat
    }

    /// Number of bytes queued for the next uplink
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no command waits for the next uplink
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True while a sticky answer asks for an uplink
    pub fn has_sticky_mac_cmd(&self) -> bool {
        self.sticky
    }

    /// Forget the sticky uplink request
    pub fn clear_sticky_mac_cmd(&mut self) {
        self.sticky = false;
    }

    /// Drop everything queued for the next uplink
    pub fn clear_command_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Drop the sticky answers; a downlink acknowledged them
    pub fn clear_repeat_buffer(&mut self) {
        self.repeat.clear();
    }

    fn reserve(&self, len: usize) -> Result<()> {
        if self.cmd_buffer_remaining() < len {
            warn!("no room for {} bytes of MAC answers", len);
            return Err(Error::LengthError);
        }
        Ok(())
    }

    fn push(&mut self, cid: CommandIdentifier, body: &[u8]) -> Result<()> {
        if self.cmd_buffer_remaining() < body.len() + 1 {
            warn!("MAC command {} does not fit", cid as u8);
            return Err(Error::LengthError);
        }
        // Capacity is bounded by the buffer size, so both pushes succeed.
        self.buffer.push(cid as u8).map_err(|_| Error::LengthError)?;
        self.buffer.extend_from_slice(body).map_err(|_| Error::LengthError)?;
        if cid.is_sticky() {
            self.sticky = true;
        }
        Ok(())
    }

    /// Queue a LinkCheckReq
    pub fn add_link_check_req(&mut self) -> Result<()> {
        self.push(CommandIdentifier::LinkCheck, &[])
    }

    /// Queue a LinkADRAns
    pub fn add_link_adr_ans(&mut self, status: u8) -> Result<()> {
        self.push(CommandIdentifier::LinkAdr, &[status])
    }

    /// Queue a DutyCycleAns
    pub fn add_duty_cycle_ans(&mut self) -> Result<()> {
        self.push(CommandIdentifier::DutyCycle, &[])
    }

    /// Queue a RXParamSetupAns (sticky)
    pub fn add_rx_param_setup_ans(&mut self, status: u8) -> Result<()> {
        self.push(CommandIdentifier::RxParamSetup, &[status])
    }

    /// Queue a DevStatusAns; `margin` is the 6-bit signed SNR
    pub fn add_dev_status_ans(&mut self, battery: u8, margin: u8) -> Result<()> {
        self.push(CommandIdentifier::DevStatus, &[battery, margin & 0x3F])
    }

    /// Queue a NewChannelAns
    pub fn add_new_channel_ans(&mut self, status: u8) -> Result<()> {
        self.push(CommandIdentifier::NewChannel, &[status])
    }

    /// Queue a RXTimingSetupAns (sticky)
    pub fn add_rx_timing_setup_ans(&mut self) -> Result<()> {
        self.push(CommandIdentifier::RxTimingSetup, &[])
    }

    /// Queue a TXParamSetupAns
    pub fn add_tx_param_setup_ans(&mut self) -> Result<()> {
        self.push(CommandIdentifier::TxParamSetup, &[])
    }

    /// Queue a DlChannelAns (sticky)
    pub fn add_dl_channel_ans(&mut self, status: u8) -> Result<()> {
        self.push(CommandIdentifier::DlChannel, &[status])
    }

    /// Put the sticky answers in front of the next-tx buffer
    pub fn copy_repeat_commands_to_buffer(&mut self) -> Result<()> {
        if self.repeat.is_empty() {
            return Ok(());
        }
        if self.cmd_buffer_remaining() < self.repeat.len() {
            return Err(Error::LengthError);
        }
        let mut merged: Vec<u8, MAC_COMMAND_BUFFER_LEN> = Vec::new();
        merged.extend_from_slice(&self.repeat).map_err(|_| Error::LengthError)?;
        merged.extend_from_slice(&self.buffer).map_err(|_| Error::LengthError)?;
        self.buffer = merged;
        self.repeat.clear();
        Ok(())
    }

    /// After an uplink: keep its sticky answers for the following ones
    pub fn parse_mac_commands_to_repeat(&mut self) {
        self.repeat.clear();
        let mut index = 0;
        while index < self.buffer.len() {
            let Some(cid) = CommandIdentifier::from_u8(self.buffer[index]) else {
                break;
            };
            let end = (index + 1 + cid.uplink_len()).min(self.buffer.len());
            if cid.is_sticky() && self.repeat.extend_from_slice(&self.buffer[index..end]).is_err() {
                break;
            }
            index = end;
        }
    }

    /// Walk a downlink command stream, update the session and queue answers.
    ///
    /// `battery_level` feeds DevStatusAns. `radio_accepts` is the radio's own
    /// frequency check. Parsing stops at the first unknown opcode
    /// ([`Error::Unsupported`]), truncated command ([`Error::ParameterInvalid`])
    /// or command whose answer no longer fits ([`Error::LengthError`]). A
    /// command that stops the walk is not applied; answers queued before it
    /// are kept.
    pub fn process_mac_commands<F>(
        &mut self,
        payload: &[u8],
        snr: i8,
        params: &mut ProtocolParams,
        phy: &mut RegionalPhy,
        battery_level: u8,
        mut radio_accepts: F,
    ) -> Result<CommandsOutcome>
    where
        F: FnMut(u32) -> bool,
    {
        let mut outcome = CommandsOutcome::default();
        let mut index = 0;

        while index < payload.len() {
            let Some(cid) = CommandIdentifier::from_u8(payload[index]) else {
                warn!("unknown MAC command {:#x}", payload[index]);
                return Err(Error::Unsupported);
            };

            if cid == CommandIdentifier::LinkAdr {
                let blocks = payload[index..]
                    .chunks_exact(LINK_ADR_REQ_LEN)
                    .take_while(|block| block[0] == cid as u8)
                    .count();
                self.reserve(blocks * cid.answer_len())?;
                let answer = phy.link_adr_request(&LinkAdrParams {
                    payload: &payload[index..],
                    current_datarate: params.channel_data_rate,
                    current_tx_power: params.channel_tx_power,
                    current_nb_rep: params.nb_rep,
                });
                if answer.bytes_consumed == 0 {
                    return Err(Error::ParameterInvalid);
                }
                if answer.status == 0x07 {
                    params.channel_data_rate = answer.datarate;
                    params.channel_tx_power = answer.tx_power;
                    params.nb_rep = answer.nb_rep;
                }
                debug!("LinkADRReq status {:#x} dr {}", answer.status, answer.datarate);
                for _ in 0..answer.bytes_consumed / LINK_ADR_REQ_LEN {
                    self.add_link_adr_ans(answer.status)?;
                }
                index += answer.bytes_consumed;
                continue;
            }

            let body = payload
                .get(index + 1..index + 1 + cid.downlink_len())
                .ok_or(Error::ParameterInvalid)?;
            // Nothing is applied unless its answer fits.
            self.reserve(cid.answer_len())?;
            index += 1 + cid.downlink_len();

            match cid {
                CommandIdentifier::LinkCheck => {
                    outcome.link_check = Some(LinkCheck {
                        margin: body[0],
                        gateway_count: body[1],
                    });
                }
                CommandIdentifier::DutyCycle => {
                    params.max_duty_cycle = body[0] & 0x0F;
                    self.add_duty_cycle_ans()?;
                }
                CommandIdentifier::RxParamSetup => {
                    let req = RxParamSetup {
                        dr_offset: (body[0] >> 4) & 0x07,
                        datarate: body[0] & 0x0F,
                        frequency: u24_frequency(&body[1..4]),
                    };
                    let status = phy.accept_rx_param_setup_req(&req, radio_accepts(req.frequency));
                    if status == 0x07 {
                        params.rx2_datarate = req.datarate;
                        params.rx2_frequency = req.frequency;
                        params.rx1_dr_offset = req.dr_offset;
                    }
                    self.add_rx_param_setup_ans(status)?;
                }
                CommandIdentifier::DevStatus => {
                    let margin = snr.clamp(-32, 31) as u8;
                    self.add_dev_status_ans(battery_level, margin)?;
                }
                CommandIdentifier::NewChannel => {
                    let channel = Channel::new(u24_frequency(&body[1..4]), DrRange::from_byte(body[4]), 0);
                    let status = phy.request_new_channel(body[0], &channel);
                    self.add_new_channel_ans(status)?;
                }
                CommandIdentifier::RxTimingSetup => {
                    let delay = u32::from((body[0] & 0x0F).max(1));
                    params.recv_delay1 = delay * 1000;
                    params.recv_delay2 = params.recv_delay1 + 1000;
                    self.add_rx_timing_setup_ans()?;
                }
                CommandIdentifier::TxParamSetup => {
                    let ul_dwell = body[0] & 0x10 != 0;
                    let dl_dwell = body[0] & 0x20 != 0;
                    if phy.accept_tx_param_setup_req(ul_dwell, dl_dwell, body[0] & 0x0F) {
                        self.add_tx_param_setup_ans()?;
                    }
                }
                CommandIdentifier::DlChannel => {
                    let frequency = u24_frequency(&body[1..4]);
                    let status = phy.dl_channel_request(body[0], frequency, radio_accepts(frequency));
                    self.add_dl_channel_ans(status)?;
                }
                CommandIdentifier::LinkAdr => {}
            }
        }

        outcome.sticky_queued = self.sticky;
        Ok(outcome)
    }
}

// Frequencies travel as 24-bit little endian multiples of 100 Hz.
fn u24_frequency(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::region::{Region, EU868};

    fn setup() -> (MacCommandCodec, ProtocolParams, RegionalPhy) {
        (
            MacCommandCodec::new(),
            ProtocolParams::new(&EU868),
            RegionalPhy::new(Region::Eu868),
        )
    }

    fn freq_bytes(frequency: u32) -> [u8; 3] {
        let raw = (frequency / 100).to_le_bytes();
        [raw[0], raw[1], raw[2]]
    }

    #[test]
    fn link_adr_applies_datarate_and_power() {
        let (mut codec, mut params, mut phy) = setup();
        // DR5, power index 2, channels 0..2, ctrl 0, nb_rep 1
        let cmds = [0x03, 0x52, 0x07, 0x00, 0x01];
        codec
            .process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert_eq!(codec.commands(), &[0x03, 0x07]);
        assert_eq!(params.channel_data_rate, 5);
        assert_eq!(params.channel_tx_power, 2);
        assert_eq!(params.nb_rep, 1);
    }

    #[test]
    fn batched_link_adr_answers_each_block() {
        let (mut codec, mut params, mut phy) = setup();
        let cmds = [0x03, 0x30, 0x07, 0x00, 0x00, 0x03, 0x31, 0x07, 0x00, 0x00];
        codec
            .process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert_eq!(codec.commands(), &[0x03, 0x07, 0x03, 0x07]);
        assert_eq!(params.channel_tx_power, 1);
    }

    #[test]
    fn dev_status_reports_battery_and_snr() {
        let (mut codec, mut params, mut phy) = setup();
        codec
            .process_mac_commands(&[0x06], -5, &mut params, &mut phy, 200, |_| true)
            .unwrap();
        assert_eq!(codec.commands(), &[0x06, 200, (-5i8 as u8) & 0x3F]);
    }

    #[test]
    fn new_channel_out_of_band_leaves_table() {
        let (mut codec, mut params, mut phy) = setup();
        let f = freq_bytes(902_300_000);
        let cmds = [0x07, 3, f[0], f[1], f[2], 0x50];
        codec
            .process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert_eq!(codec.commands(), &[0x07, 0x02]);
        assert!(phy.channel(3).is_none());
    }

    #[test]
    fn new_channel_in_band_is_added() {
        let (mut codec, mut params, mut phy) = setup();
        let f = freq_bytes(867_100_000);
        let cmds = [0x07, 3, f[0], f[1], f[2], 0x50];
        codec
            .process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert_eq!(codec.commands(), &[0x07, 0x03]);
        assert_eq!(phy.channel(3).map(|c| c.frequency), Some(867_100_000));
        assert!(phy.channel_mask().test(3));
    }

    #[test]
    fn rx_timing_setup_is_sticky_and_repeated() {
        let (mut codec, mut params, mut phy) = setup();
        codec
            .process_mac_commands(&[0x08, 0x00, 0x04, 0x03], 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert_eq!(params.recv_delay1, 1000);
        assert_eq!(params.recv_delay2, 2000);
        assert_eq!(params.max_duty_cycle, 3);
        assert!(codec.has_sticky_mac_cmd());

        codec.parse_mac_commands_to_repeat();
        codec.clear_command_buffer();
        assert_eq!(codec.repeat_commands(), &[0x08]);
        codec.add_link_check_req().unwrap();
        codec.copy_repeat_commands_to_buffer().unwrap();
        assert_eq!(codec.commands(), &[0x08, 0x02]);
    }

    #[test]
    fn rx_param_setup_rejected_by_radio() {
        let (mut codec, mut params, mut phy) = setup();
        let f = freq_bytes(869_525_000);
        let cmds = [0x05, 0x13, f[0], f[1], f[2]];
        codec
            .process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| false)
            .unwrap();
        assert_eq!(codec.commands(), &[0x05, 0x06]);
        assert_eq!(params.rx2_datarate, EU868.rx2_datarate);
    }

    #[test]
    fn tx_param_setup_ignored_in_eu868() {
        let (mut codec, mut params, mut phy) = setup();
        codec
            .process_mac_commands(&[0x09, 0x3F], 0, &mut params, &mut phy, 255, |_| true)
            .unwrap();
        assert!(codec.is_empty());
    }

    #[test]
    fn unknown_opcode_aborts_but_keeps_answers() {
        let (mut codec, mut params, mut phy) = setup();
        let result = codec.process_mac_commands(&[0x04, 0x01, 0x7F, 0x06], 0, &mut params, &mut phy, 255, |_| true);
        assert_eq!(result, Err(Error::Unsupported));
        assert_eq!(codec.commands(), &[0x04]);
    }

    #[test]
    fn truncated_command_aborts() {
        let (mut codec, mut params, mut phy) = setup();
        let result = codec.process_mac_commands(&[0x05, 0x00], 0, &mut params, &mut phy, 255, |_| true);
        assert_eq!(result, Err(Error::ParameterInvalid));
        let result = codec.process_mac_commands(&[0x03, 0x50, 0x07], 0, &mut params, &mut phy, 255, |_| true);
        assert_eq!(result, Err(Error::ParameterInvalid));
        assert!(codec.is_empty());
    }

    #[test]
    fn overflow_keeps_queued_commands() {
        let mut codec = MacCommandCodec::with_capacity(5);
        codec.add_dev_status_ans(1, 2).unwrap();
        codec.add_new_channel_ans(3).unwrap();
        assert_eq!(codec.add_link_adr_ans(7), Err(Error::LengthError));
        assert_eq!(codec.commands(), &[0x06, 1, 2, 0x07, 3]);
        assert_eq!(codec.cmd_buffer_remaining(), 0);
    }

    #[test]
    fn full_buffer_stops_before_applying_link_adr() {
        let mut codec = MacCommandCodec::with_capacity(5);
        let mut params = ProtocolParams::new(&EU868);
        let mut phy = RegionalPhy::new(Region::Eu868);
        let mask = phy.channel_mask();
        // DutyCycleReq, DevStatusReq, then a LinkADRReq asking for DR5 on channel 0 only
        let cmds = [0x04, 0x01, 0x06, 0x03, 0x52, 0x01, 0x00, 0x01];
        let result = codec.process_mac_commands(&cmds, 0, &mut params, &mut phy, 90, |_| true);
        assert_eq!(result, Err(Error::LengthError));
        assert_eq!(codec.commands(), &[0x04, 0x06, 90, 0x00]);
        assert_eq!(params.max_duty_cycle, 1);
        assert_eq!(params.channel_data_rate, EU868.default_datarate);
        assert_eq!(phy.channel_mask(), mask);
    }

    #[test]
    fn full_buffer_stops_before_applying_rx_timing() {
        let mut codec = MacCommandCodec::with_capacity(1);
        let mut params = ProtocolParams::new(&EU868);
        let delay = params.recv_delay1;
        let result = codec.process_mac_commands(&[0x04, 0x00, 0x08, 0x05], 0, &mut params, &mut RegionalPhy::new(Region::Eu868), 255, |_| true);
        assert_eq!(result, Err(Error::LengthError));
        assert_eq!(codec.commands(), &[0x04]);
        assert_eq!(params.recv_delay1, delay);
        assert!(!codec.has_sticky_mac_cmd());
    }
}
