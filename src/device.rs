//! High-level LoRaWAN device interface
//!
//! [`LoRaWANDevice`] is the application-facing session. It owns the
//! [`LoRaMac`], tracks whether the device is connected, queues radio and
//! timer events posted from interrupt context and turns MAC records into
//! [`AppEvent`]s and buffered receives.
//!
//! Nothing here blocks. The platform posts events with
//! [`LoRaWANDevice::post_radio_event`] / [`LoRaWANDevice::post_timer_event`]
//! and calls [`LoRaWANDevice::process`] from its dispatcher loop.

use heapless::{Deque, Vec};

use crate::{
    config::device::{DevAddr, DeviceClass, DeviceConfig},
    crypto::Crypto,
    error::{Error, EventInfoStatus, Result},
    lorawan::{
        channel_plan::{ChannelParams, Plan},
        frame::MType,
        mac::LoRaMac,
        params::MulticastChannel,
        region::Region,
        types::{MacEvent, McpsType, MlmeType, RxMetadata, TxMetadata, MAX_APP_PAYLOAD},
    },
    radio::{Radio, RadioEvent},
    timer::{Timer, TimerId},
};

const PENDING_EVENTS_LEN: usize = 8;
const APP_EVENTS_LEN: usize = 8;

/// Highest application port
pub const MAX_APP_PORT: u8 = 223;

bitflags::bitflags! {
    /// Message type selection for [`LoRaWANDevice::send`] and
    /// [`LoRaWANDevice::receive`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Unconfirmed data
        const UNCONFIRMED = 0x01;
        /// Confirmed data
        const CONFIRMED = 0x02;
        /// Multicast data (receive only)
        const MULTICAST = 0x04;
        /// Proprietary frame
        const PROPRIETARY = 0x08;
    }
}

impl From<McpsType> for MsgFlags {
    fn from(kind: McpsType) -> Self {
        match kind {
            McpsType::Unconfirmed => MsgFlags::UNCONFIRMED,
            McpsType::Confirmed => MsgFlags::CONFIRMED,
            McpsType::Multicast => MsgFlags::MULTICAST,
            McpsType::Proprietary => MsgFlags::PROPRIETARY,
        }
    }
}

/// Connection state of the session
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// [`LoRaWANDevice::initialize`] not called yet
    NotInitialized,
    /// Initialized, no session
    Idle,
    /// Join procedure running
    ConnectInProgress,
    /// Session established
    Connected,
    /// Shut down
    DeviceOff,
}

/// Event delivered to the application
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    /// Session established
    Connected,
    /// Session torn down
    Disconnected,
    /// Uplink completed
    TxDone,
    /// Radio did not finish transmitting
    TxTimeout,
    /// Uplink failed
    TxError,
    /// Crypto collaborator failed on an uplink
    CryptoError,
    /// A delayed or repeated transmission could not be scheduled
    TxSchedulingError,
    /// Application data is waiting for [`LoRaWANDevice::receive`]
    RxDone,
    /// Confirmed uplink got no answer in its windows
    RxTimeout,
    /// Confirmed uplink answer could not be received
    RxError,
    /// Join procedure failed
    JoinFailure,
    /// The network expects an uplink
    UplinkRequired,
}

/// Outcome of a [`LoRaWANDevice::receive`] call
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Port the message arrived on
    pub port: u8,
    /// Message type
    pub flags: u8,
    /// Bytes copied into the caller buffer
    pub len: usize,
    /// Bytes of the message still waiting for a later call
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingEvent {
    Radio(RadioEvent),
    Timer(TimerId),
}

struct RxMessage {
    port: u8,
    flags: MsgFlags,
    data: Vec<u8, MAX_APP_PAYLOAD>,
    read: usize,
}

/// LoRaWAN device implementation
pub struct LoRaWANDevice<R: Radio, T: Timer, C: Crypto> {
    mac: LoRaMac<R, T, C>,
    state: DeviceState,
    config: Option<DeviceConfig>,
    pending: Deque<PendingEvent, PENDING_EVENTS_LEN>,
    events: Deque<AppEvent, APP_EVENTS_LEN>,
    rx: Option<RxMessage>,
    link_check_resp: Option<fn(u8, u8)>,
}

impl<R: Radio, T: Timer, C: Crypto> LoRaWANDevice<R, T, C> {
    /// Create a device for `region`
    pub fn new(radio: R, timer: T, crypto: C, region: Region) -> Self {
        Self {
            mac: LoRaMac::new(radio, timer, crypto, region),
            state: DeviceState::NotInitialized,
            config: None,
            pending: Deque::new(),
            events: Deque::new(),
            rx: None,
            link_check_resp: None,
        }
    }

    /// Bring up the radio and the MAC. Calling it again is a no-op unless
    /// the device was shut down.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            DeviceState::NotInitialized | DeviceState::DeviceOff => {
                self.mac.initialize()?;
                self.state = DeviceState::Idle;
                self.pending.clear();
                self.events.clear();
                self.rx = None;
                info!("device initialized");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Session state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Underlying MAC
    pub fn mac(&self) -> &LoRaMac<R, T, C> {
        &self.mac
    }

    /// Underlying MAC, mutably
    pub fn mac_mut(&mut self) -> &mut LoRaMac<R, T, C> {
        &mut self.mac
    }

    fn check_initialized(&self) -> Result<()> {
        match self.state {
            DeviceState::NotInitialized => Err(Error::NotInitialized),
            DeviceState::DeviceOff => Err(Error::DeviceOff),
            _ => Ok(()),
        }
    }

    /// Connect with the configuration of the previous [`connect_with`](Self::connect_with)
    pub fn connect(&mut self) -> Result<()> {
        let config = self.config.ok_or(Error::ParameterInvalid)?;
        self.connect_with(config)
    }

    /// Start a session.
    ///
    /// ABP sessions are connected on return. OTAA returns once the first
    /// join request is scheduled; [`AppEvent::Connected`] or
    /// [`AppEvent::JoinFailure`] follows.
    pub fn connect_with(&mut self, config: DeviceConfig) -> Result<()> {
        self.check_initialized()?;
        match self.state {
            DeviceState::ConnectInProgress => return Err(Error::ConnectInProgress),
            DeviceState::Connected => return Err(Error::AlreadyConnected),
            _ => {}
        }

        self.mac.prepare_join(&config)?;
        self.config = Some(config);
        if config.is_otaa() {
            self.mac.join(true)?;
            self.state = DeviceState::ConnectInProgress;
            info!("join procedure started");
        } else {
            self.mac.join(false)?;
            self.on_connected();
        }
        Ok(())
    }

    fn on_connected(&mut self) {
        self.state = DeviceState::Connected;
        let class = self.config.map_or(DeviceClass::A, |c| c.device_class);
        if class != DeviceClass::A {
            if let Err(err) = self.mac.set_device_class(class) {
                warn!("device class not applied: {}", err);
            }
        }
        self.push_event(AppEvent::Connected);
    }

    /// Drop the session and stop every pending transaction
    pub fn disconnect(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.disconnect();
        self.pending.clear();
        self.rx = None;
        self.state = DeviceState::Idle;
        self.push_event(AppEvent::Disconnected);
        Ok(())
    }

    /// Disconnect and switch the device off until the next [`initialize`](Self::initialize)
    pub fn shutdown(&mut self) -> Result<()> {
        self.disconnect()?;
        self.state = DeviceState::DeviceOff;
        Ok(())
    }

    /// Queue an uplink. Returns the number of application bytes accepted,
    /// zero when pending MAC commands take the frame on FPort 0.
    pub fn send(&mut self, port: u8, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.check_initialized()?;
        if self.state != DeviceState::Connected {
            return Err(Error::NoActiveSessions);
        }
        let mtype = if flags == MsgFlags::PROPRIETARY {
            MType::Proprietary
        } else if flags == MsgFlags::CONFIRMED {
            MType::ConfirmedDataUp
        } else if flags == MsgFlags::UNCONFIRMED {
            MType::UnconfirmedDataUp
        } else {
            return Err(Error::ParameterInvalid);
        };
        if mtype != MType::Proprietary && !(1..=MAX_APP_PORT).contains(&port) {
            return Err(Error::PortInvalid);
        }
        let result = self.mac.send(mtype, port, data);
        self.dispatch_mac_events();
        result
    }

    /// Copy the pending downlink of `port` matching `flags` into `buf`.
    ///
    /// A message larger than `buf` is handed out over several calls;
    /// [`Received::remaining`] counts what is left.
    pub fn receive(&mut self, port: u8, buf: &mut [u8], flags: MsgFlags) -> nb::Result<Received, Error> {
        self.check_receive()?;
        match &self.rx {
            Some(msg) if msg.port == port && flags.intersects(msg.flags) => Ok(self.drain(buf)),
            _ => Err(nb::Error::WouldBlock),
        }
    }

    /// Copy the pending downlink, whatever its port and type
    pub fn receive_any(&mut self, buf: &mut [u8]) -> nb::Result<Received, Error> {
        self.check_receive()?;
        if self.rx.is_none() {
            return Err(nb::Error::WouldBlock);
        }
        Ok(self.drain(buf))
    }

    fn check_receive(&self) -> core::result::Result<(), nb::Error<Error>> {
        self.check_initialized().map_err(nb::Error::Other)?;
        if self.state != DeviceState::Connected {
            return Err(nb::Error::Other(Error::NoActiveSessions));
        }
        Ok(())
    }

    fn drain(&mut self, buf: &mut [u8]) -> Received {
        let Some(msg) = self.rx.as_mut() else {
            return Received {
                port: 0,
                flags: 0,
                len: 0,
                remaining: 0,
            };
        };
        let available = &msg.data[msg.read..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        msg.read += len;
        let received = Received {
            port: msg.port,
            flags: msg.flags.bits(),
            len,
            remaining: msg.data.len() - msg.read,
        };
        if received.remaining == 0 {
            self.rx = None;
        }
        received
    }

    // ---------------------------------------------------------------------
    // Session controls
    // ---------------------------------------------------------------------

    /// Install application channels
    pub fn set_channel_plan(&mut self, plan: &[ChannelParams]) -> Result<()> {
        self.check_initialized()?;
        self.mac.channel_plan().set_plan(plan)
    }

    /// Enabled channels
    pub fn get_channel_plan(&mut self) -> Result<Plan> {
        self.check_initialized()?;
        self.mac.channel_plan().get_plan()
    }

    /// Remove every non-default channel
    pub fn remove_channel_plan(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.channel_plan().remove_plan()
    }

    /// Remove one non-default channel
    pub fn remove_channel(&mut self, id: u8) -> Result<()> {
        self.check_initialized()?;
        self.mac.channel_plan().remove_single_channel(id)
    }

    /// Transmissions of a confirmed uplink before it is reported failed
    pub fn set_confirmed_msg_retries(&mut self, count: u8) -> Result<()> {
        self.check_initialized()?;
        self.mac.set_confirmed_msg_retries(count)
    }

    /// Turn ADR on
    pub fn enable_adaptive_datarate(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.enable_adaptive_datarate(true);
        Ok(())
    }

    /// Turn ADR off
    pub fn disable_adaptive_datarate(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.enable_adaptive_datarate(false);
        Ok(())
    }

    /// Fix the uplink datarate; ADR must be off
    pub fn set_datarate(&mut self, datarate: u8) -> Result<()> {
        self.check_initialized()?;
        self.mac.set_datarate(datarate)
    }

    /// Switch device class
    pub fn set_device_class(&mut self, class: DeviceClass) -> Result<()> {
        self.check_initialized()?;
        let result = self.mac.set_device_class(class);
        self.dispatch_mac_events();
        result
    }

    /// Ask the network for a LinkCheckAns in the next uplink
    pub fn add_link_check_request(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.add_link_check_request()
    }

    /// Cancel an uplink waiting for its duty cycle slot
    pub fn cancel_sending(&mut self) -> Result<()> {
        self.check_initialized()?;
        self.mac.clear_tx_pipe()?;
        self.dispatch_mac_events();
        Ok(())
    }

    /// Follow a multicast group
    pub fn add_multicast(&mut self, channel: MulticastChannel) -> Result<()> {
        self.check_initialized()?;
        self.mac.link_multicast(channel)
    }

    /// Stop following a multicast group
    pub fn remove_multicast(&mut self, address: DevAddr) -> Result<()> {
        self.check_initialized()?;
        self.mac.unlink_multicast(address)
    }

    /// Metadata of the last uplink
    pub fn tx_metadata(&mut self) -> Result<TxMetadata> {
        self.mac.tx_metadata()
    }

    /// Metadata of the last downlink
    pub fn rx_metadata(&mut self) -> Result<RxMetadata> {
        self.mac.rx_metadata()
    }

    /// Called with `(margin, gateway count)` when a LinkCheckAns arrives
    pub fn set_link_check_callback(&mut self, callback: Option<fn(u8, u8)>) {
        self.link_check_resp = callback;
    }

    /// Battery level reported to the network (0 external power, 1..254
    /// level, 255 unknown)
    pub fn set_battery_level_callback(&mut self, callback: Option<fn() -> u8>) {
        self.mac.set_battery_level_callback(callback);
    }

    // ---------------------------------------------------------------------
    // Event plumbing
    // ---------------------------------------------------------------------

    /// Queue a radio interrupt for the next [`process`](Self::process)
    pub fn post_radio_event(&mut self, event: RadioEvent) -> Result<()> {
        self.pending
            .push_back(PendingEvent::Radio(event))
            .map_err(|_| Error::LengthError)
    }

    /// Queue a timer expiry for the next [`process`](Self::process)
    pub fn post_timer_event(&mut self, id: TimerId) -> Result<()> {
        self.pending
            .push_back(PendingEvent::Timer(id))
            .map_err(|_| Error::LengthError)
    }

    /// Run every queued event through the MAC
    pub fn process(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            if matches!(self.state, DeviceState::NotInitialized | DeviceState::DeviceOff) {
                continue;
            }
            match event {
                PendingEvent::Radio(event) => self.mac.handle_radio_event(event),
                PendingEvent::Timer(id) => self.mac.handle_timer_event(id),
            }
            self.dispatch_mac_events();
        }
    }

    /// Next application event
    pub fn next_event(&mut self) -> Option<AppEvent> {
        self.events.pop_front()
    }

    fn push_event(&mut self, event: AppEvent) {
        if self.events.push_back(event).is_err() {
            warn!("application event queue full, {:?} dropped", event);
        }
    }

    fn dispatch_mac_events(&mut self) {
        while let Some(event) = self.mac.poll_event() {
            match event {
                MacEvent::McpsConfirm => self.on_mcps_confirm(),
                MacEvent::McpsIndication => self.on_mcps_indication(),
                MacEvent::MlmeConfirm => self.on_mlme_confirm(),
                MacEvent::MlmeIndication => {
                    let indication = *self.mac.mlme_indication();
                    if indication.ind_type == MlmeType::ScheduleUplink && indication.pending {
                        self.push_event(AppEvent::UplinkRequired);
                    }
                }
                MacEvent::SchedulingFailed(err) => {
                    error!("transmission could not be scheduled: {}", err);
                    self.push_event(AppEvent::TxSchedulingError);
                    if self.state == DeviceState::ConnectInProgress {
                        self.state = DeviceState::Idle;
                        self.push_event(AppEvent::JoinFailure);
                    }
                }
            }
        }
    }

    fn on_mcps_confirm(&mut self) {
        let confirm = *self.mac.mcps_confirm();
        let event = match confirm.status {
            EventInfoStatus::Ok => AppEvent::TxDone,
            EventInfoStatus::TxTimeout => AppEvent::TxTimeout,
            EventInfoStatus::CryptoFail => AppEvent::CryptoError,
            EventInfoStatus::Rx1Timeout | EventInfoStatus::Rx2Timeout => AppEvent::RxTimeout,
            EventInfoStatus::Rx1Error | EventInfoStatus::Rx2Error => AppEvent::RxError,
            _ => AppEvent::TxError,
        };
        debug!("uplink finished: {:?}", event);
        self.push_event(event);
    }

    fn on_mcps_indication(&mut self) {
        let indication = self.mac.mcps_indication();
        if indication.status != EventInfoStatus::Ok {
            return;
        }
        let class_a = self.mac.params().dev_class == DeviceClass::A;
        let uplink_required =
            class_a && (indication.ind_type == McpsType::Confirmed || indication.fpending);
        if indication.is_data_recvd {
            self.rx = Some(RxMessage {
                port: indication.port,
                flags: MsgFlags::from(indication.ind_type),
                data: indication.buffer.clone(),
                read: 0,
            });
            self.push_event(AppEvent::RxDone);
        }
        if uplink_required {
            self.push_event(AppEvent::UplinkRequired);
        }
    }

    fn on_mlme_confirm(&mut self) {
        let confirm = *self.mac.mlme_confirm();
        match confirm.req_type {
            MlmeType::Join => {
                if confirm.status == EventInfoStatus::Ok {
                    info!("connected after {} join requests", confirm.nb_retries);
                    self.on_connected();
                } else {
                    warn!("join failed: {:?}", confirm.status);
                    self.state = DeviceState::Idle;
                    self.push_event(AppEvent::JoinFailure);
                }
            }
            MlmeType::LinkCheck => {
                if let Some(callback) = self.link_check_resp {
                    callback(confirm.demod_margin, confirm.nb_gateways);
                }
            }
            MlmeType::ScheduleUplink => {}
        }
    }
}
