//! MAC state machine
//!
//! [`LoRaMac`] builds frames, drives the join / send / receive lifecycle
//! through the [`Timer`] and interprets downlinks. It never blocks: radio
//! interrupts and timer expiries are fed back in through
//! [`LoRaMac::handle_radio_event`] and [`LoRaMac::handle_timer_event`], and
//! results are queued as [`MacEvent`]s for the device layer.
//!
//! A class A transaction runs
//! `Idle -> [TxDelayed] -> TxRunning -> AwaitingRx1 -> InRx1 -> AwaitingRx2
//! -> InRx2 -> [AckTimeoutPending] -> Idle`. RX2 is never opened while RX1
//! is still receiving.

use heapless::{Deque, Vec};

use super::channel_plan::ChannelPlan;
use super::commands::{MacCommandCodec, MAC_COMMAND_BUFFER_LEN};
use super::frame::{
    self, DataFrame, FCtrl, Fhdr, JoinAccept, MType, Mhdr, FRAME_HEADER_LEN, JOIN_ACCEPT_CFLIST_LEN,
    JOIN_ACCEPT_LEN, MAX_FOPTS_LEN,
};
use super::params::{ActivationState, MulticastChannel, ProtocolParams, ACK_TIMEOUT, ACK_TIMEOUT_RND};
use super::phy::{NextChannelParams, RegionalPhy, RxWindowParams};
use super::region::Region;
use super::types::{
    MacEvent, McpsConfirm, McpsIndication, McpsType, MlmeConfirm, MlmeIndication, MlmeType, RxMetadata,
    RxSlot, TxMetadata, MAX_APP_PAYLOAD,
};
use crate::config::device::{Activation, DevAddr, DeviceClass, DeviceConfig, OtaaCredentials};
use crate::crypto::{Crypto, Direction, MIC_SIZE};
use crate::error::{Error, EventInfoStatus, Result};
use crate::radio::{Radio, RadioEvent, MAX_PHY_PAYLOAD};
use crate::timer::{Timer, TimerId};

const EVENT_QUEUE_LEN: usize = 8;

/// Where the MAC stands in the current transaction
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    /// Nothing in flight
    Idle,
    /// Waiting for a duty cycle restriction to end
    TxDelayed,
    /// Radio transmitting
    TxRunning,
    /// Between TX end and RX1
    AwaitingRx1,
    /// RX1 open
    InRx1,
    /// Between RX1 and RX2
    AwaitingRx2,
    /// RX2 open
    InRx2,
    /// Receive windows closed, waiting for the ACK timeout
    AckTimeoutPending,
}

fn radio_error<E: core::fmt::Debug>(_err: E) -> Error {
    error!("radio driver error");
    Error::Radio
}

fn window_delay(delay_ms: u32, offset_ms: i32) -> u32 {
    (i64::from(delay_ms) + i64::from(offset_ms)).max(0) as u32
}

/// LoRaWAN MAC
pub struct LoRaMac<R: Radio, T: Timer, C: Crypto> {
    radio: R,
    timer: T,
    crypto: C,
    phy: RegionalPhy,
    commands: MacCommandCodec,
    params: ProtocolParams,
    credentials: Option<Activation>,
    initialized: bool,
    state: MacState,

    tx_buffer: Vec<u8, MAX_PHY_PAYLOAD>,
    channel: u8,
    tx_toa: u32,
    nb_tx_done: u8,
    last_tx_join: bool,
    node_ack_requested: bool,
    commands_in_frame: bool,
    ack_timeout_expired: bool,

    rx_slot: RxSlot,
    rx2_deferred: bool,
    rx1_window: RxWindowParams,
    rx2_window: RxWindowParams,
    rx_frequency: u32,
    rx_datarate: u8,

    mcps_confirm: McpsConfirm,
    mcps_indication: McpsIndication,
    mlme_confirm: MlmeConfirm,
    mlme_indication: MlmeIndication,
    tx_metadata: Option<TxMetadata>,
    rx_metadata: Option<RxMetadata>,

    battery_level: Option<fn() -> u8>,
    events: Deque<MacEvent, EVENT_QUEUE_LEN>,
}

impl<R: Radio, T: Timer, C: Crypto> LoRaMac<R, T, C> {
    /// Bind the collaborators and the region
    pub fn new(radio: R, timer: T, crypto: C, region: Region) -> Self {
        let phy = RegionalPhy::new(region);
        let params = ProtocolParams::new(phy.tables());
        let idle_window = RxWindowParams {
            datarate: params.rx2_datarate,
            window_offset_ms: 0,
            symbol_timeout: 0,
        };
        Self {
            radio,
            timer,
            crypto,
            phy,
            commands: MacCommandCodec::new(),
            params,
            credentials: None,
            initialized: false,
            state: MacState::Idle,
            tx_buffer: Vec::new(),
            channel: 0,
            tx_toa: 0,
            nb_tx_done: 0,
            last_tx_join: false,
            node_ack_requested: false,
            commands_in_frame: false,
            ack_timeout_expired: false,
            rx_slot: RxSlot::Rx1,
            rx2_deferred: false,
            rx1_window: idle_window,
            rx2_window: idle_window,
            rx_frequency: 0,
            rx_datarate: 0,
            mcps_confirm: McpsConfirm::default(),
            mcps_indication: McpsIndication::default(),
            mlme_confirm: MlmeConfirm::default(),
            mlme_indication: MlmeIndication::default(),
            tx_metadata: None,
            rx_metadata: None,
            battery_level: None,
            events: Deque::new(),
        }
    }

    /// Bring the radio up and reset the session to region defaults
    pub fn initialize(&mut self) -> Result<()> {
        self.radio.init().map_err(radio_error)?;
        self.phy.reset();
        self.params = ProtocolParams::new(self.phy.tables());
        self.params.init_time = self.timer.now();
        self.commands = MacCommandCodec::new();
        self.radio
            .set_public_network(self.params.public_network)
            .map_err(radio_error)?;
        self.radio.sleep().map_err(radio_error)?;
        self.state = MacState::Idle;
        self.initialized = true;
        info!("MAC initialized for {}", self.phy.tables().name);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// True once a session exists (OTAA joined or ABP activated)
    pub fn nwk_joined(&self) -> bool {
        self.params.is_joined()
    }

    /// Current transaction state
    pub fn state(&self) -> MacState {
        self.state
    }

    /// Live session parameters
    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Regional PHY
    pub fn phy(&self) -> &RegionalPhy {
        &self.phy
    }

    /// Pending MAC commands
    pub fn commands(&self) -> &MacCommandCodec {
        &self.commands
    }

    /// Radio collaborator
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Radio collaborator, mutably
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Timer collaborator
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Timer collaborator, mutably
    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    /// Last uplink result
    pub fn mcps_confirm(&self) -> &McpsConfirm {
        &self.mcps_confirm
    }

    /// Last accepted downlink
    pub fn mcps_indication(&self) -> &McpsIndication {
        &self.mcps_indication
    }

    /// Last management result
    pub fn mlme_confirm(&self) -> &MlmeConfirm {
        &self.mlme_confirm
    }

    /// Last management indication
    pub fn mlme_indication(&self) -> &MlmeIndication {
        &self.mlme_indication
    }

    /// Next queued event
    pub fn poll_event(&mut self) -> Option<MacEvent> {
        self.events.pop_front()
    }

    /// Channel plan operations on the regional PHY
    pub fn channel_plan(&mut self) -> ChannelPlan<'_> {
        ChannelPlan::new(&mut self.phy)
    }

    /// Battery level reported in DevStatusAns; 255 (unknown) when unset
    pub fn set_battery_level_callback(&mut self, callback: Option<fn() -> u8>) {
        self.battery_level = callback;
    }

    /// Metadata of the last transmission, available once
    pub fn tx_metadata(&mut self) -> Result<TxMetadata> {
        self.tx_metadata.take().ok_or(Error::MetadataNotAvailable)
    }

    /// Metadata of the last reception, available once
    pub fn rx_metadata(&mut self) -> Result<RxMetadata> {
        self.rx_metadata.take().ok_or(Error::MetadataNotAvailable)
    }

    fn post(&mut self, event: MacEvent) {
        if self.events.push_back(event).is_err() {
            warn!("MAC event queue full, event dropped");
        }
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    fn apply_config(&mut self, config: &DeviceConfig) -> Result<()> {
        if config.confirmed_msg_retries == 0 {
            return Err(Error::ParameterInvalid);
        }
        if let Some(dr) = config.data_rate {
            if !self.phy.verify_tx_datarate(dr) {
                return Err(Error::DatarateInvalid);
            }
            self.params.channel_data_rate = dr;
        }
        if !self.phy.verify_duty_cycle(config.duty_cycle_on) {
            warn!("duty cycle forced to {} against region default", config.duty_cycle_on);
        }
        self.params.duty_cycle_on = config.duty_cycle_on;
        self.params.adr_on = config.adr_enabled;
        self.params.max_ack_retries = config.confirmed_msg_retries;
        self.params.public_network = config.public_network;
        self.radio
            .set_public_network(config.public_network)
            .map_err(radio_error)
    }

    /// Validate credentials and stage a join or an activation
    pub fn prepare_join(&mut self, config: &DeviceConfig) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if self.state != MacState::Idle {
            return Err(Error::Busy);
        }
        match config.activation {
            Activation::Otaa(otaa) => {
                if otaa.dev_eui == [0; 8] || otaa.app_key.is_zero() {
                    return Err(Error::ParameterInvalid);
                }
                if !self.phy.verify_nb_join_trials(otaa.nb_trials) {
                    return Err(Error::ParameterInvalid);
                }
                self.params.max_join_trials = otaa.nb_trials;
                self.params.join_trials = 0;
            }
            Activation::Abp(abp) => {
                if abp.dev_addr.value() == 0
                    || abp.net_id == 0
                    || abp.nwk_skey.is_zero()
                    || abp.app_skey.is_zero()
                {
                    return Err(Error::ParameterInvalid);
                }
            }
        }
        self.apply_config(config)?;
        self.credentials = Some(config.activation);
        Ok(())
    }

    /// Start the join procedure (OTAA) or activate the staged ABP session
    pub fn join(&mut self, is_otaa: bool) -> Result<()> {
        match (self.credentials, is_otaa) {
            (Some(Activation::Otaa(otaa)), true) => {
                if self.state != MacState::Idle {
                    return Err(Error::Busy);
                }
                self.params.join_trials = 0;
                self.mlme_confirm = MlmeConfirm {
                    req_type: MlmeType::Join,
                    ..MlmeConfirm::default()
                };
                self.send_join_request(&otaa)
            }
            (Some(Activation::Abp(abp)), false) => {
                self.params.activation = ActivationState::Abp;
                self.params.dev_addr = abp.dev_addr;
                self.params.net_id = abp.net_id;
                self.params.nwk_skey = abp.nwk_skey;
                self.params.app_skey = abp.app_skey;
                self.params.ul_frame_counter = 0;
                self.params.dl_frame_counter = None;
                info!("ABP session active, DevAddr {:x}", abp.dev_addr.value());
                Ok(())
            }
            _ => Err(Error::ParameterInvalid),
        }
    }

    fn send_join_request(&mut self, otaa: &OtaaCredentials) -> Result<()> {
        let dev_nonce = self.radio.random() as u16;
        self.params.dev_nonce = dev_nonce;
        let body = frame::join_request_body(&otaa.app_eui, &otaa.dev_eui, dev_nonce);
        let mic = self
            .crypto
            .compute_join_mic(&otaa.app_key, &body)
            .map_err(|_| Error::CryptoFail)?;

        self.tx_buffer.clear();
        self.tx_buffer.extend_from_slice(&body).map_err(|_| Error::LengthError)?;
        self.tx_buffer.extend_from_slice(&mic).map_err(|_| Error::LengthError)?;

        self.params.channel_data_rate = self.phy.get_alternate_dr(self.params.join_trials);
        self.last_tx_join = true;
        self.node_ack_requested = false;
        self.commands_in_frame = false;
        self.nb_tx_done = 0;
        info!(
            "join request {} at DR{}",
            self.params.join_trials + 1,
            self.params.channel_data_rate
        );
        self.schedule_tx()
    }

    fn continue_joining_process(&mut self) {
        if self.params.join_trials < u16::from(self.params.max_join_trials) {
            if let Some(Activation::Otaa(otaa)) = self.credentials {
                self.state = MacState::Idle;
                if let Err(err) = self.send_join_request(&otaa) {
                    warn!("join retry failed: {}", err);
                    self.join_failed();
                }
                return;
            }
        }
        self.join_failed();
    }

    fn join_failed(&mut self) {
        warn!("join failed after {} trials", self.params.join_trials);
        self.mlme_confirm.status = EventInfoStatus::JoinFail;
        self.mlme_confirm.nb_retries = self.params.join_trials.min(255) as u8;
        self.state = MacState::Idle;
        self.post(MacEvent::MlmeConfirm);
    }

    // ---------------------------------------------------------------------
    // Uplink
    // ---------------------------------------------------------------------

    /// Build and schedule a data frame.
    ///
    /// `mtype` selects an unconfirmed, confirmed or proprietary uplink. An
    /// empty `data` sends only the pending MAC commands. Returns how many
    /// bytes of `data` the frame carries: MAC commands too long for FOpts
    /// take the frame on FPort 0 and `data` is not sent.
    pub fn send(&mut self, mtype: MType, fport: u8, data: &[u8]) -> Result<usize> {
        if !self.params.is_joined() {
            return Err(Error::NoNetworkJoined);
        }
        if self.state != MacState::Idle {
            return Err(Error::Busy);
        }
        let req_type = match mtype {
            MType::UnconfirmedDataUp => McpsType::Unconfirmed,
            MType::ConfirmedDataUp => McpsType::Confirmed,
            MType::Proprietary => McpsType::Proprietary,
            _ => return Err(Error::ParameterInvalid),
        };

        let carried = if mtype == MType::Proprietary {
            self.tx_buffer.clear();
            self.tx_buffer
                .push(Mhdr::new(mtype).to_byte())
                .map_err(|_| Error::LengthError)?;
            self.tx_buffer.extend_from_slice(data).map_err(|_| Error::LengthError)?;
            self.commands_in_frame = false;
            data.len()
        } else {
            self.prepare_frame(mtype, fport, data)?
        };

        self.last_tx_join = false;
        self.node_ack_requested = mtype == MType::ConfirmedDataUp;
        self.ack_timeout_expired = false;
        self.nb_tx_done = 0;
        self.mcps_confirm = McpsConfirm {
            req_type,
            ul_frame_counter: self.params.ul_frame_counter,
            ..McpsConfirm::default()
        };
        self.schedule_tx().map(|_| carried)
    }

    fn prepare_frame(&mut self, mtype: MType, fport: u8, data: &[u8]) -> Result<usize> {
        let mut f_ctrl = FCtrl {
            adr: self.params.adr_on,
            ack: self.params.srv_ack_requested,
            ..FCtrl::default()
        };
        if self.params.adr_on {
            let next = self.phy.get_next_adr(
                true,
                self.params.channel_data_rate,
                self.params.channel_tx_power,
                &mut self.params.adr_ack_counter,
                self.params.adr_ack_limit,
                self.params.adr_ack_delay,
            );
            f_ctrl.adr_ack_req = next.adr_ack_req;
            self.params.channel_data_rate = next.datarate;
            self.params.channel_tx_power = next.tx_power;
        }

        if self.commands.copy_repeat_commands_to_buffer().is_err() {
            warn!("sticky MAC commands do not fit the command buffer");
        }
        let mut pending: Vec<u8, MAC_COMMAND_BUFFER_LEN> = Vec::new();
        pending
            .extend_from_slice(self.commands.commands())
            .map_err(|_| Error::LengthError)?;

        let dev_addr = self.params.dev_addr;
        let fcnt = self.params.ul_frame_counter;
        let no_bytes: &[u8] = &[];
        // (FOpts, FPort, FRMPayload, FRMPayload encrypted with NwkSKey)
        let (f_opts, port, payload, network_payload) = if pending.len() > MAX_FOPTS_LEN {
            if !data.is_empty() {
                warn!("{} bytes of MAC commands go first, application data not sent", pending.len());
            }
            self.commands_in_frame = true;
            (no_bytes, Some(0), pending.as_slice(), true)
        } else if !data.is_empty() {
            self.commands_in_frame = !pending.is_empty();
            (pending.as_slice(), Some(fport), data, false)
        } else {
            self.commands_in_frame = !pending.is_empty();
            (pending.as_slice(), None, no_bytes, false)
        };
        let carried = if network_payload { 0 } else { data.len() };

        let max = self.phy.max_payload(self.params.channel_data_rate);
        if f_opts.len() + payload.len() > max {
            warn!(
                "payload of {} bytes exceeds {} at DR{}",
                f_opts.len() + payload.len(),
                max,
                self.params.channel_data_rate
            );
            self.mcps_confirm.status = EventInfoStatus::TxDrPayloadSizeError;
            return Err(Error::LengthError);
        }

        let fhdr = Fhdr {
            dev_addr,
            f_ctrl,
            f_cnt: fcnt as u16,
            f_opts: Vec::from_slice(f_opts).map_err(|_| Error::LengthError)?,
        };
        self.tx_buffer.clear();
        self.tx_buffer
            .push(Mhdr::new(mtype).to_byte())
            .map_err(|_| Error::LengthError)?;
        fhdr.serialize(&mut self.tx_buffer)?;

        if let Some(port) = port {
            self.tx_buffer.push(port).map_err(|_| Error::LengthError)?;
            let start = self.tx_buffer.len();
            self.tx_buffer.extend_from_slice(payload).map_err(|_| Error::LengthError)?;
            let key = if network_payload {
                self.params.nwk_skey
            } else {
                self.params.app_skey
            };
            self.crypto
                .encrypt_payload(&key, dev_addr, Direction::Up, fcnt, &mut self.tx_buffer[start..])
                .map_err(|_| Error::CryptoFail)?;
        }

        let mic = self
            .crypto
            .compute_mic(&self.params.nwk_skey, &self.tx_buffer, dev_addr, Direction::Up, fcnt)
            .map_err(|_| Error::CryptoFail)?;
        self.tx_buffer.extend_from_slice(&mic).map_err(|_| Error::LengthError)?;
        Ok(carried)
    }

    fn schedule_tx(&mut self) -> Result<()> {
        let datarate = self.params.channel_data_rate;
        let next = NextChannelParams {
            datarate,
            joined: self.params.is_joined(),
            dc_enabled: self.params.duty_cycle_on,
            aggregated_last_tx_time: self.params.aggregated_last_tx_time,
            aggregated_timeoff: self.params.aggregated_timeoff,
        };
        let now = self.timer.now();
        let random = self.radio.random();

        let channel = match self.phy.set_next_channel(&next, now, random) {
            Ok(channel) => channel,
            Err(Error::DutyCycleRestricted { retry_after_ms }) => {
                debug!("transmission delayed by {} ms", retry_after_ms);
                self.state = MacState::TxDelayed;
                self.timer.start(TimerId::TxDelayed, retry_after_ms);
                return Ok(());
            }
            Err(err) => {
                self.state = MacState::Idle;
                return Err(err);
            }
        };
        self.channel = channel;

        let rx1_dr = self.phy.apply_rx1_dr_offset(datarate, self.params.rx1_dr_offset);
        self.rx1_window = self.window_params(rx1_dr);
        self.rx2_window = self.window_params(self.params.rx2_datarate);

        if let Err(err) = self.send_frame_on_channel(channel) {
            self.state = MacState::Idle;
            return Err(err);
        }
        Ok(())
    }

    fn window_params(&self, datarate: u8) -> RxWindowParams {
        self.phy.compute_rx_win_params(
            datarate,
            self.params.min_rx_symbols,
            self.params.max_sys_rx_error,
            self.params.wakeup_time,
        )
    }

    fn send_frame_on_channel(&mut self, channel: u8) -> Result<()> {
        let datarate = self.params.channel_data_rate;
        let tx_power = self.params.channel_tx_power;
        let config = self.phy.tx_config(channel, datarate, tx_power)?;

        self.radio.set_channel(config.frequency).map_err(radio_error)?;
        self.radio.set_tx_config(&config).map_err(radio_error)?;
        self.tx_toa = self
            .radio
            .time_on_air(config.modulation.modem, self.tx_buffer.len() as u8);
        self.radio.send(&self.tx_buffer).map_err(radio_error)?;

        self.nb_tx_done = self.nb_tx_done.saturating_add(1);
        self.state = MacState::TxRunning;
        self.mcps_confirm.datarate = datarate;
        self.mcps_confirm.tx_power = tx_power;
        self.mcps_confirm.channel = channel;
        self.mcps_confirm.tx_toa = self.tx_toa;
        self.mcps_confirm.nb_retries = self.nb_tx_done;
        self.tx_metadata = Some(TxMetadata {
            channel,
            data_rate: datarate,
            tx_power,
            tx_toa: self.tx_toa,
            nb_retries: self.nb_tx_done,
        });
        debug!(
            "tx {} bytes on channel {} ({} Hz) DR{}",
            self.tx_buffer.len(),
            channel,
            config.frequency,
            datarate
        );
        Ok(())
    }

    /// Cancel a transmission waiting for its duty cycle slot
    pub fn clear_tx_pipe(&mut self) -> Result<()> {
        if !self.timer.is_running(TimerId::TxDelayed) {
            return Err(Error::NoOp);
        }
        if !self.timer.stop(TimerId::TxDelayed) {
            return Err(Error::Busy);
        }
        self.tx_buffer.clear();
        self.enter_idle();
        if self.last_tx_join {
            self.mlme_confirm.status = EventInfoStatus::Error;
            self.post(MacEvent::MlmeConfirm);
        } else {
            self.mcps_confirm.status = EventInfoStatus::Error;
            self.post(MacEvent::McpsConfirm);
        }
        info!("pending transmission discarded");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Event dispatch
    // ---------------------------------------------------------------------

    /// Feed a radio interrupt
    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::TxDone => self.on_tx_done(),
            RadioEvent::RxDone { payload, rssi, snr } => self.on_rx_done(&payload, rssi, snr),
            RadioEvent::TxTimeout => self.on_tx_timeout(),
            RadioEvent::RxTimeout => self.on_rx_failed(true),
            RadioEvent::RxError => self.on_rx_failed(false),
        }
    }

    /// Feed a timer expiry
    pub fn handle_timer_event(&mut self, id: TimerId) {
        match id {
            TimerId::TxDelayed => self.on_tx_delayed(),
            TimerId::Rx1Window => self.on_rx1_window(),
            TimerId::Rx2Window => self.on_rx2_window(),
            TimerId::AckTimeout => self.on_ack_timeout(),
        }
    }

    fn on_tx_delayed(&mut self) {
        if self.state != MacState::TxDelayed {
            return;
        }
        if let Err(err) = self.schedule_tx() {
            error!("delayed transmission failed: {}", err);
            if self.last_tx_join {
                self.mlme_confirm.status = EventInfoStatus::Error;
            } else {
                self.mcps_confirm.status = EventInfoStatus::Error;
            }
            self.enter_idle();
            self.post(MacEvent::SchedulingFailed(err));
        }
    }

    fn on_tx_done(&mut self) {
        if self.state != MacState::TxRunning {
            return;
        }
        let now = self.timer.now();
        let joined = self.params.is_joined();
        self.phy.set_band_tx_done(self.channel, joined, now);
        self.phy.calculate_backoff(
            joined,
            self.last_tx_join,
            self.params.duty_cycle_on,
            self.channel,
            now.wrapping_sub(self.params.init_time),
            self.tx_toa,
        );
        self.params.aggregated_timeoff = self
            .tx_toa
            .saturating_mul(self.params.aggregated_duty_cycle())
            .saturating_sub(self.tx_toa);
        self.params.aggregated_last_tx_time = now;

        let (delay1, delay2) = if self.last_tx_join {
            (self.params.join_accept_delay1, self.params.join_accept_delay2)
        } else {
            (self.params.recv_delay1, self.params.recv_delay2)
        };
        self.rx2_deferred = false;
        self.state = MacState::AwaitingRx1;
        self.timer
            .start(TimerId::Rx1Window, window_delay(delay1, self.rx1_window.window_offset_ms));
        if self.params.dev_class == DeviceClass::C {
            self.open_continuous_rx2();
        } else {
            if let Err(err) = self.radio.sleep() {
                radio_error(err);
            }
            self.timer
                .start(TimerId::Rx2Window, window_delay(delay2, self.rx2_window.window_offset_ms));
        }

        if self.last_tx_join {
            self.params.join_trials = self.params.join_trials.saturating_add(1);
            self.mlme_confirm.nb_retries = self.params.join_trials.min(255) as u8;
        } else {
            if self.node_ack_requested {
                let spread = self.radio.random() % (2 * ACK_TIMEOUT_RND + 1);
                let ack_timeout = ACK_TIMEOUT - ACK_TIMEOUT_RND + spread;
                self.timer.start(TimerId::AckTimeout, delay2 + ack_timeout);
            } else {
                self.mcps_confirm.status = EventInfoStatus::Ok;
            }
            self.params.srv_ack_requested = false;
            if self.commands_in_frame {
                self.commands.parse_mac_commands_to_repeat();
                self.commands.clear_command_buffer();
                self.commands_in_frame = false;
            }
        }
        debug!("tx done, RX1 opens in {} ms", delay1);
    }

    fn on_tx_timeout(&mut self) {
        if self.state != MacState::TxRunning {
            return;
        }
        warn!("radio tx timeout");
        if let Err(err) = self.radio.sleep() {
            radio_error(err);
        }
        self.enter_idle();
        if self.last_tx_join {
            self.mlme_confirm.status = EventInfoStatus::TxTimeout;
            self.post(MacEvent::MlmeConfirm);
        } else {
            self.mcps_confirm.status = EventInfoStatus::TxTimeout;
            self.post(MacEvent::McpsConfirm);
        }
    }

    fn open_window(&mut self, window: RxWindowParams, frequency: u32, continuous: bool) {
        let config = self.phy.rx_config(&window, frequency, continuous);
        self.rx_frequency = frequency;
        self.rx_datarate = window.datarate;
        let opened = self
            .radio
            .set_channel(frequency)
            .and_then(|_| self.radio.set_rx_config(&config))
            .and_then(|_| self.radio.receive());
        match opened {
            Ok(()) => trace!("rx window at {} Hz DR{}", frequency, window.datarate),
            Err(err) => {
                radio_error(err);
                self.on_rx_failed(false);
            }
        }
    }

    fn open_continuous_rx2(&mut self) {
        self.rx_slot = RxSlot::ClassC;
        let window = self.window_params(self.params.rx2_datarate);
        self.open_window(window, self.params.rx2_frequency, true);
    }

    fn on_rx1_window(&mut self) {
        if self.state != MacState::AwaitingRx1 {
            return;
        }
        let frequency = self
            .phy
            .channel(self.channel as usize)
            .map_or(0, |ch| if ch.rx1_frequency != 0 { ch.rx1_frequency } else { ch.frequency });
        self.rx_slot = RxSlot::Rx1;
        self.state = MacState::InRx1;
        self.open_window(self.rx1_window, frequency, false);
    }

    fn on_rx2_window(&mut self) {
        match self.state {
            MacState::AwaitingRx1 | MacState::InRx1 => {
                self.rx2_deferred = true;
                return;
            }
            MacState::AwaitingRx2 => {}
            _ => return,
        }
        self.rx2_deferred = false;
        self.rx_slot = RxSlot::Rx2;
        self.state = MacState::InRx2;
        self.open_window(self.rx2_window, self.params.rx2_frequency, false);
    }

    fn on_rx_failed(&mut self, timeout: bool) {
        match self.state {
            MacState::InRx1 => {
                let status = if timeout {
                    EventInfoStatus::Rx1Timeout
                } else {
                    EventInfoStatus::Rx1Error
                };
                self.record_window_status(status);
                if self.params.dev_class == DeviceClass::C {
                    self.on_rx_windows_closed();
                    if self.state != MacState::Idle {
                        self.open_continuous_rx2();
                    }
                    return;
                }
                if let Err(err) = self.radio.sleep() {
                    radio_error(err);
                }
                self.state = MacState::AwaitingRx2;
                if self.rx2_deferred {
                    self.on_rx2_window();
                }
            }
            MacState::InRx2 => {
                let status = if timeout {
                    EventInfoStatus::Rx2Timeout
                } else {
                    EventInfoStatus::Rx2Error
                };
                self.record_window_status(status);
                if let Err(err) = self.radio.sleep() {
                    radio_error(err);
                }
                self.on_rx_windows_closed();
            }
            _ if self.rx_slot == RxSlot::ClassC => self.open_continuous_rx2(),
            _ => {}
        }
    }

    fn record_window_status(&mut self, status: EventInfoStatus) {
        if self.last_tx_join {
            self.mlme_confirm.status = status;
        } else if self.node_ack_requested && !self.mcps_confirm.ack_received {
            self.mcps_confirm.status = status;
        }
    }

    fn on_rx_windows_closed(&mut self) {
        if self.last_tx_join {
            self.continue_joining_process();
        } else if self.node_ack_requested {
            if self.mcps_confirm.ack_received {
                self.finish_uplink();
            } else if self.ack_timeout_expired {
                self.retry_confirmed();
            } else {
                self.state = MacState::AckTimeoutPending;
            }
        } else if self.nb_tx_done < self.params.nb_rep {
            debug!("repetition {} of {}", self.nb_tx_done + 1, self.params.nb_rep);
            self.state = MacState::Idle;
            if let Err(err) = self.schedule_tx() {
                warn!("repetition not sent: {}", err);
                self.finish_uplink();
            }
        } else {
            self.finish_uplink();
        }
    }

    fn on_ack_timeout(&mut self) {
        if !self.node_ack_requested || self.mcps_confirm.ack_received {
            return;
        }
        if self.state != MacState::AckTimeoutPending {
            self.ack_timeout_expired = true;
            return;
        }
        self.retry_confirmed();
    }

    fn retry_confirmed(&mut self) {
        self.ack_timeout_expired = false;
        if self.nb_tx_done >= self.params.max_ack_retries {
            warn!("no ACK after {} transmissions", self.nb_tx_done);
            self.mcps_confirm.status = EventInfoStatus::Error;
            self.finish_uplink();
            return;
        }
        if self.nb_tx_done % 2 == 0 {
            self.params.channel_data_rate = self.phy.get_next_lower_tx_datarate(self.params.channel_data_rate);
        }
        let frame_payload = self.tx_buffer.len().saturating_sub(FRAME_HEADER_LEN + MIC_SIZE + 1);
        if frame_payload > self.phy.max_payload(self.params.channel_data_rate) {
            self.mcps_confirm.status = EventInfoStatus::TxDrPayloadSizeError;
            self.finish_uplink();
            return;
        }
        info!("ACK timeout, retransmission {}", self.nb_tx_done + 1);
        self.state = MacState::Idle;
        if let Err(err) = self.schedule_tx() {
            error!("retransmission failed: {}", err);
            self.mcps_confirm.status = EventInfoStatus::Error;
            self.finish_uplink();
            self.post(MacEvent::SchedulingFailed(err));
        }
    }

    fn finish_uplink(&mut self) {
        self.timer.stop(TimerId::AckTimeout);
        self.params.ul_frame_counter = self.params.ul_frame_counter.wrapping_add(1);
        self.params.adr_ack_counter = self.params.adr_ack_counter.saturating_add(1);
        self.mcps_confirm.nb_retries = self.nb_tx_done;
        self.node_ack_requested = false;
        self.enter_idle();
        self.post(MacEvent::McpsConfirm);
    }

    fn enter_idle(&mut self) {
        self.state = MacState::Idle;
        if self.params.dev_class == DeviceClass::C {
            self.open_continuous_rx2();
        }
    }

    // ---------------------------------------------------------------------
    // Downlink
    // ---------------------------------------------------------------------

    fn on_rx_done(&mut self, payload: &[u8], rssi: i16, snr: i8) {
        let in_window = matches!(self.state, MacState::InRx1 | MacState::InRx2);
        if !in_window && self.rx_slot != RxSlot::ClassC {
            warn!("frame outside a receive window dropped");
            return;
        }
        self.rx_metadata = Some(RxMetadata {
            rssi,
            snr,
            rx_datarate: self.rx_datarate,
            channel: self.rx_frequency,
        });
        if self.params.dev_class != DeviceClass::C {
            if let Err(err) = self.radio.sleep() {
                radio_error(err);
            }
        }

        let Some(first) = payload.first() else {
            self.on_rx_failed(false);
            return;
        };
        let result = match Mhdr::from_byte(*first).mtype {
            MType::JoinAccept => self.handle_join_accept(payload),
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown => self.handle_data_frame(payload, rssi, snr),
            _ => Err(Error::ParameterInvalid),
        };

        if let Err(err) = result {
            warn!("downlink dropped: {}", err);
            self.on_rx_failed(false);
            return;
        }

        if !in_window {
            // Class C reception outside the transaction.
            if self.state == MacState::AckTimeoutPending && self.mcps_confirm.ack_received {
                self.finish_uplink();
            } else if self.state == MacState::Idle {
                self.open_continuous_rx2();
            }
            return;
        }

        self.timer.stop(TimerId::Rx2Window);
        self.rx2_deferred = false;
        if self.last_tx_join {
            return;
        }
        if self.node_ack_requested && !self.mcps_confirm.ack_received {
            self.on_rx_windows_closed();
            if self.params.dev_class == DeviceClass::C {
                self.open_continuous_rx2();
            }
        } else {
            self.finish_uplink();
        }
    }

    fn handle_join_accept(&mut self, payload: &[u8]) -> Result<()> {
        if !self.last_tx_join || self.params.is_joined() {
            return Err(Error::ParameterInvalid);
        }
        let Some(Activation::Otaa(otaa)) = self.credentials else {
            return Err(Error::ParameterInvalid);
        };
        let len = payload.len();
        if len != JOIN_ACCEPT_LEN && len != JOIN_ACCEPT_CFLIST_LEN {
            return Err(Error::LengthError);
        }

        let mut buf: Vec<u8, JOIN_ACCEPT_CFLIST_LEN> = Vec::from_slice(payload).map_err(|_| Error::LengthError)?;
        self.crypto
            .decrypt_join_accept(&otaa.app_key, &mut buf[1..])
            .map_err(|_| Error::CryptoFail)?;
        let (msg, mic) = buf.split_at(len - MIC_SIZE);
        let expected = self
            .crypto
            .compute_join_mic(&otaa.app_key, msg)
            .map_err(|_| Error::CryptoFail)?;
        if expected[..] != mic[..] {
            self.mlme_confirm.status = EventInfoStatus::MicFail;
            return Err(Error::MicFail);
        }

        let accept = JoinAccept::parse(msg)?;
        let (nwk_skey, app_skey) = self
            .crypto
            .derive_session_keys(&otaa.app_key, &accept.app_nonce, &accept.net_id, self.params.dev_nonce)
            .map_err(|_| Error::CryptoFail)?;

        self.params.activation = ActivationState::Otaa;
        self.params.dev_addr = accept.dev_addr;
        self.params.net_id = accept.net_id_value();
        self.params.nwk_skey = nwk_skey;
        self.params.app_skey = app_skey;
        self.params.ul_frame_counter = 0;
        self.params.dl_frame_counter = None;
        self.params.adr_ack_counter = 0;
        self.params.rx1_dr_offset = accept.rx1_dr_offset;
        self.params.rx2_datarate = accept.rx2_datarate;
        self.params.recv_delay1 = u32::from(accept.rx_delay.max(1)) * 1000;
        self.params.recv_delay2 = self.params.recv_delay1 + 1000;
        if let Some(cf_list) = accept.cf_list {
            self.phy.apply_cf_list(&cf_list);
        }

        self.mlme_confirm.status = EventInfoStatus::Ok;
        self.mlme_confirm.nb_retries = self.params.join_trials.min(255) as u8;
        self.enter_idle();
        self.post(MacEvent::MlmeConfirm);
        info!("joined, DevAddr {:x}", accept.dev_addr.value());
        Ok(())
    }

    fn handle_data_frame(&mut self, payload: &[u8], rssi: i16, snr: i8) -> Result<()> {
        if !self.params.is_joined() {
            return Err(Error::NoNetworkJoined);
        }
        let frame = DataFrame::parse(payload)?;
        if frame.f_port == Some(0) && !frame.fhdr.f_opts.is_empty() {
            return Err(Error::ParameterInvalid);
        }

        let address = frame.fhdr.dev_addr;
        let (nwk_skey, app_skey, last_fcnt, group) = if address == self.params.dev_addr {
            (self.params.nwk_skey, self.params.app_skey, self.params.dl_frame_counter, None)
        } else if let Some(i) = self.params.multicast.iter().position(|m| m.address == address) {
            let g = self.params.multicast[i];
            (g.nwk_skey, g.app_skey, g.dl_frame_counter, Some(i))
        } else {
            self.mcps_indication.status = EventInfoStatus::AddressFail;
            return Err(Error::ParameterInvalid);
        };

        let fcnt = match frame::reconstruct_fcnt(last_fcnt, frame.fhdr.f_cnt, self.params.max_fcnt_gap) {
            Ok(fcnt) => fcnt,
            Err(Error::ParameterInvalid) => {
                self.mcps_indication.status = EventInfoStatus::DownlinkRepeated;
                return Err(Error::ParameterInvalid);
            }
            Err(err) => {
                self.mcps_indication.status = EventInfoStatus::DownlinkTooManyFramesLoss;
                return Err(err);
            }
        };
        let mic = self
            .crypto
            .compute_mic(&nwk_skey, frame.mic_input, address, Direction::Down, fcnt)
            .map_err(|_| Error::CryptoFail)?;
        if mic != frame.mic {
            self.mcps_indication.status = EventInfoStatus::MicFail;
            return Err(Error::MicFail);
        }

        let confirmed = frame.mhdr.mtype == MType::ConfirmedDataDown;
        let mut indication = McpsIndication {
            ind_type: match (group, confirmed) {
                (Some(_), _) => McpsType::Multicast,
                (None, true) => McpsType::Confirmed,
                (None, false) => McpsType::Unconfirmed,
            },
            status: EventInfoStatus::Ok,
            fpending: frame.fhdr.f_ctrl.f_pending,
            rx_datarate: self.rx_datarate,
            rssi,
            snr,
            rx_slot: self.rx_slot,
            dl_frame_counter: fcnt,
            ..McpsIndication::default()
        };

        match group {
            Some(i) => self.params.multicast[i].dl_frame_counter = Some(fcnt),
            None => {
                self.params.dl_frame_counter = Some(fcnt);
                self.params.adr_ack_counter = 0;
                self.params.srv_ack_requested = confirmed;
                self.commands.clear_repeat_buffer();
                self.commands.clear_sticky_mac_cmd();
                if frame.fhdr.f_ctrl.ack && self.node_ack_requested {
                    self.mcps_confirm.ack_received = true;
                    self.mcps_confirm.status = EventInfoStatus::Ok;
                    indication.is_ack_recvd = true;
                    self.timer.stop(TimerId::AckTimeout);
                }
                if !frame.fhdr.f_opts.is_empty() {
                    self.process_commands(&frame.fhdr.f_opts, snr);
                }
            }
        }

        match frame.f_port {
            Some(0) if group.is_none() => {
                let mut cmds: Vec<u8, MAX_APP_PAYLOAD> =
                    Vec::from_slice(frame.frm_payload).map_err(|_| Error::LengthError)?;
                self.crypto
                    .encrypt_payload(&nwk_skey, address, Direction::Down, fcnt, &mut cmds)
                    .map_err(|_| Error::CryptoFail)?;
                self.process_commands(&cmds, snr);
            }
            Some(0) => {}
            Some(port) => {
                indication.buffer = Vec::from_slice(frame.frm_payload).map_err(|_| Error::LengthError)?;
                self.crypto
                    .encrypt_payload(&app_skey, address, Direction::Down, fcnt, &mut indication.buffer)
                    .map_err(|_| Error::CryptoFail)?;
                indication.port = port;
                indication.is_data_recvd = true;
            }
            None => {}
        }

        debug!(
            "downlink fcnt {} port {} {} bytes",
            fcnt,
            indication.port,
            indication.buffer.len()
        );
        self.mcps_indication = indication;
        self.post(MacEvent::McpsIndication);

        if self.commands.has_sticky_mac_cmd() {
            self.mlme_indication = MlmeIndication {
                ind_type: MlmeType::ScheduleUplink,
                pending: true,
            };
            self.post(MacEvent::MlmeIndication);
        }
        Ok(())
    }

    fn process_commands(&mut self, payload: &[u8], snr: i8) {
        let battery = self.battery_level.map_or(255, |level| level());
        let radio = &mut self.radio;
        let result = self.commands.process_mac_commands(
            payload,
            snr,
            &mut self.params,
            &mut self.phy,
            battery,
            |frequency| radio.check_rf_frequency(frequency),
        );
        match result {
            Ok(outcome) => {
                if let Some(link) = outcome.link_check {
                    self.mlme_confirm = MlmeConfirm {
                        req_type: MlmeType::LinkCheck,
                        status: EventInfoStatus::Ok,
                        nb_retries: 0,
                        demod_margin: link.margin,
                        nb_gateways: link.gateway_count,
                    };
                    self.post(MacEvent::MlmeConfirm);
                }
            }
            Err(err) => warn!("MAC command processing stopped: {}", err),
        }
    }

    // ---------------------------------------------------------------------
    // Session controls
    // ---------------------------------------------------------------------

    /// Switch device class. Class B is not supported.
    pub fn set_device_class(&mut self, class: DeviceClass) -> Result<()> {
        match class {
            DeviceClass::B => Err(Error::Unsupported),
            DeviceClass::A => {
                if self.params.dev_class == DeviceClass::C {
                    self.rx_slot = RxSlot::Rx1;
                    self.radio.sleep().map_err(radio_error)?;
                }
                self.params.dev_class = DeviceClass::A;
                info!("switched to class A");
                Ok(())
            }
            DeviceClass::C => {
                self.params.dev_class = DeviceClass::C;
                if self.state == MacState::Idle {
                    self.open_continuous_rx2();
                }
                info!("switched to class C");
                Ok(())
            }
        }
    }

    /// Ask for a LinkCheckReq in the next uplink
    pub fn add_link_check_request(&mut self) -> Result<()> {
        if !self.params.is_joined() {
            return Err(Error::NoNetworkJoined);
        }
        self.commands.add_link_check_req()
    }

    /// Turn ADR on or off
    pub fn enable_adaptive_datarate(&mut self, on: bool) {
        self.params.adr_on = on;
        if !on {
            self.params.adr_ack_counter = 0;
        }
    }

    /// Fix the uplink datarate; only allowed while ADR is off
    pub fn set_datarate(&mut self, datarate: u8) -> Result<()> {
        if self.params.adr_on {
            return Err(Error::ParameterInvalid);
        }
        let supported = self.phy.verify_tx_datarate(datarate)
            && self
                .phy
                .channel_mask()
                .iter()
                .filter_map(|id| self.phy.channel(id))
                .any(|ch| ch.dr_range.contains(datarate));
        if !supported {
            return Err(Error::DatarateInvalid);
        }
        self.params.channel_data_rate = datarate;
        Ok(())
    }

    /// Transmissions of a confirmed uplink before it is reported failed
    pub fn set_confirmed_msg_retries(&mut self, count: u8) -> Result<()> {
        if count == 0 {
            return Err(Error::ParameterInvalid);
        }
        self.params.max_ack_retries = count;
        Ok(())
    }

    /// Follow a multicast group
    pub fn link_multicast(&mut self, channel: MulticastChannel) -> Result<()> {
        self.params.link_multicast(channel)
    }

    /// Stop following a multicast group
    pub fn unlink_multicast(&mut self, address: DevAddr) -> Result<()> {
        self.params.unlink_multicast(address)
    }

    /// Stop every timer, drop the session and put the radio to sleep
    pub fn disconnect(&mut self) {
        for id in [
            TimerId::TxDelayed,
            TimerId::Rx1Window,
            TimerId::Rx2Window,
            TimerId::AckTimeout,
        ] {
            self.timer.stop(id);
        }
        if let Err(err) = self.radio.sleep() {
            radio_error(err);
        }
        let init_time = self.params.init_time;
        self.phy.reset();
        self.params = ProtocolParams::new(self.phy.tables());
        self.params.init_time = init_time;
        self.commands = MacCommandCodec::new();
        self.tx_buffer.clear();
        self.events.clear();
        self.tx_metadata = None;
        self.rx_metadata = None;
        self.state = MacState::Idle;
        self.rx_slot = RxSlot::Rx1;
        info!("MAC disconnected");
    }
}
