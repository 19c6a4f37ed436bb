use lorawan_mac::{
    config::device::{AESKey, DevAddr},
    crypto::{Crypto, LoRaMacCrypto},
    device::{AppEvent, DeviceState, MsgFlags},
    error::{Error, EventInfoStatus},
    lorawan::{mac::MacState, params::MulticastChannel},
    timer::{Timer, TimerId},
};

use mock::*;

/// Drive an uplink through both receive windows without any downlink
fn complete_silent_uplink(device: &mut TestDevice) {
    tx_done(device);
    fire_until(device, TimerId::Rx1Window);
    rx_timeout(device);
    fire_until(device, TimerId::Rx2Window);
    rx_timeout(device);
}

/// Send an uplink and stop once RX1 is open
fn uplink_to_rx1(device: &mut TestDevice, flags: MsgFlags) {
    device.send(1, b"ping", flags).unwrap();
    tx_done(device);
    fire_until(device, TimerId::Rx1Window);
    assert_eq!(device.mac().state(), MacState::InRx1);
}

#[test]
fn otaa_join_with_valid_accept() {
    let mut device = device();
    device.connect_with(otaa_config(2)).unwrap();
    assert_eq!(device.state(), DeviceState::ConnectInProgress);

    let request = radio(&device).sent[0].clone();
    assert_eq!(request.len(), 23);
    assert_eq!(request[0], 0x00);
    assert_eq!(&request[1..9], &APP_EUI);
    assert_eq!(&request[9..17], &DEV_EUI);
    // First attempt goes out at the region default datarate (DR0).
    assert_eq!(radio(&device).tx_configs[0].modulation.spreading_factor, 12);

    tx_done(&mut device);
    let (_, rx1_delay) = device
        .mac()
        .timer()
        .started
        .iter()
        .copied()
        .find(|(id, _)| *id == TimerId::Rx1Window)
        .unwrap();
    // Join accept delay corrected by the window offset.
    assert!((4_900..=5_100).contains(&rx1_delay));
    assert_eq!(fire_next_timer(&mut device), Some(TimerId::Rx1Window));

    let accept = join_accept([1, 2, 3], [0x13, 0, 0], DEV_ADDR, 0x00, 0, None);
    rx_done(&mut device, &accept);

    assert!(device.mac().nwk_joined());
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(events(&mut device), vec![AppEvent::Connected]);

    let params = device.mac().params();
    let (nwk, app) = LoRaMacCrypto::new()
        .derive_session_keys(&APP_KEY, &[1, 2, 3], &[0x13, 0, 0], dev_nonce(&request))
        .unwrap();
    assert_eq!(params.dev_addr, DEV_ADDR);
    assert_eq!(params.net_id, 0x13);
    assert_eq!(params.nwk_skey, nwk);
    assert_eq!(params.app_skey, app);
    assert_eq!(params.recv_delay1, 1_000);
    assert_eq!(params.recv_delay2, 2_000);
    assert!(!device.mac().timer().is_running(TimerId::Rx2Window));
}

#[test]
fn join_accept_applies_dl_settings_and_cf_list() {
    let mut device = device();
    device.connect_with(otaa_config(1)).unwrap();
    tx_done(&mut device);
    fire_until(&mut device, TimerId::Rx1Window);

    let mut cf_list = [0u8; 16];
    for (i, freq) in [867_100_000u32, 867_300_000, 867_500_000, 867_700_000, 867_900_000]
        .iter()
        .enumerate()
    {
        cf_list[i * 3..i * 3 + 3].copy_from_slice(&(freq / 100).to_le_bytes()[..3]);
    }
    let accept = join_accept([9, 9, 9], [1, 0, 0], DEV_ADDR, 0x23, 3, Some(cf_list));
    rx_done(&mut device, &accept);

    assert!(device.mac().nwk_joined());
    let params = device.mac().params();
    assert_eq!(params.rx1_dr_offset, 2);
    assert_eq!(params.rx2_datarate, 3);
    assert_eq!(params.recv_delay1, 3_000);
    assert_eq!(params.recv_delay2, 4_000);
    let plan = device.get_channel_plan().unwrap();
    assert_eq!(plan.len(), 8);
    assert_eq!(plan[7].frequency, 867_900_000);
}

#[test]
fn join_accept_with_bad_mic_is_dropped() {
    let mut device = device();
    device.connect_with(otaa_config(1)).unwrap();
    tx_done(&mut device);
    fire_until(&mut device, TimerId::Rx1Window);

    let mut accept = join_accept([1, 2, 3], [0x13, 0, 0], DEV_ADDR, 0, 0, None);
    accept[5] ^= 0xFF;
    rx_done(&mut device, &accept);

    assert!(!device.mac().nwk_joined());
    assert_eq!(device.state(), DeviceState::ConnectInProgress);
    assert_eq!(device.mac().state(), MacState::AwaitingRx2);
}

#[test]
fn join_fails_after_configured_trials() {
    let mut device = device();
    device.connect_with(otaa_config(2)).unwrap();
    complete_silent_uplink(&mut device);

    // The join duty cycle may hold the second request back.
    while radio(&device).sent.len() < 2 {
        fire_next_timer(&mut device).expect("second join request never scheduled");
    }
    assert_eq!(device.mac().params().join_trials, 1);
    // Second trial alternates to DR5.
    assert_eq!(radio(&device).tx_configs[1].modulation.spreading_factor, 7);

    complete_silent_uplink(&mut device);
    assert_eq!(radio(&device).sent.len(), 2);
    assert_eq!(device.mac().mlme_confirm().status, EventInfoStatus::JoinFail);
    assert_eq!(events(&mut device), vec![AppEvent::JoinFailure]);
    assert_eq!(device.state(), DeviceState::Idle);
}

#[test]
fn unconfirmed_uplink_through_both_windows() {
    let mut device = abp_device();
    assert_eq!(device.send(1, &[0xAB; 15], MsgFlags::UNCONFIRMED), Ok(15));
    assert_eq!(radio(&device).sent.len(), 1);

    let frame = radio(&device).sent[0].clone();
    assert_eq!(frame[0], 0x40);
    assert_eq!(frame[8], 1);
    assert_eq!(uplink_payload(&frame, 0), vec![0xAB; 15]);

    tx_done(&mut device);
    assert_eq!(device.mac().mcps_confirm().status, EventInfoStatus::Ok);
    assert!(radio(&device).rx_configs.is_empty());

    fire_until(&mut device, TimerId::Rx1Window);
    assert_eq!(radio(&device).rx_configs.len(), 1);
    assert_eq!(radio(&device).rx_configs[0].frequency, radio(&device).tx_configs[0].frequency);
    rx_timeout(&mut device);

    fire_until(&mut device, TimerId::Rx2Window);
    assert_eq!(radio(&device).rx_configs.len(), 2);
    assert_eq!(radio(&device).rx_configs[1].frequency, 869_525_000);
    rx_timeout(&mut device);

    assert_eq!(events(&mut device), vec![AppEvent::TxDone]);
    assert_eq!(radio(&device).sent.len(), 1);
    assert_eq!(device.mac().params().ul_frame_counter, 1);
    assert_eq!(device.mac().state(), MacState::Idle);
}

#[test]
fn rx2_waits_for_rx1_to_close() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);

    device.post_timer_event(TimerId::Rx2Window).unwrap();
    device.process();
    assert_eq!(radio(&device).rx_configs.len(), 1);

    rx_timeout(&mut device);
    assert_eq!(radio(&device).rx_configs.len(), 2);
    assert_eq!(device.mac().state(), MacState::InRx2);
}

#[test]
fn downlink_for_another_address_is_ignored() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);

    let frame = Downlink {
        dev_addr: DevAddr::new(0x0102_0304),
        port: Some(1),
        payload: b"not for us",
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    assert_eq!(device.mac().params().dl_frame_counter, None);
    assert_eq!(device.mac().mcps_indication().status, EventInfoStatus::AddressFail);
    assert!(!device.mac().mcps_indication().is_data_recvd);
    assert_eq!(device.mac().state(), MacState::AwaitingRx2);
    assert!(events(&mut device).is_empty());
}

#[test]
fn new_channel_outside_bands_is_refused() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);

    // 915 MHz, DR0..DR5 on channel 3
    let request = [0x07, 3, 0x30, 0x9E, 0x8B, 0x50];
    let frame = Downlink {
        f_opts: &request,
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    assert_eq!(device.mac().commands().commands(), &[0x07, 0x02]);
    assert!(device.mac().phy().channel(3).is_none());
    assert_eq!(events(&mut device), vec![AppEvent::TxDone]);

    device.send(1, b"x", MsgFlags::UNCONFIRMED).unwrap();
    let frame = radio(&device).last_tx().unwrap().to_vec();
    assert_eq!(frame[5] & 0x0F, 2);
    assert_eq!(&frame[8..10], &[0x07, 0x02]);
}

#[test]
fn repeated_downlink_counter_is_rejected() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let frame = Downlink {
        fcnt: 5,
        port: Some(2),
        payload: b"once",
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);
    assert_eq!(device.mac().params().dl_frame_counter, Some(5));
    events(&mut device);

    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    rx_done(&mut device, &frame);
    assert_eq!(device.mac().mcps_indication().status, EventInfoStatus::DownlinkRepeated);
    assert_eq!(device.mac().params().dl_frame_counter, Some(5));
}

#[test]
fn confirmed_uplink_acknowledged_in_rx1() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::CONFIRMED);
    assert_eq!(radio(&device).sent[0][0], 0x80);
    assert!(device.mac().timer().is_running(TimerId::AckTimeout));

    let frame = Downlink {
        ack: true,
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    assert!(device.mac().mcps_confirm().ack_received);
    assert!(!device.mac().timer().is_running(TimerId::AckTimeout));
    assert!(!device.mac().timer().is_running(TimerId::Rx2Window));
    assert_eq!(events(&mut device), vec![AppEvent::TxDone]);
}

#[test]
fn confirmed_uplink_retries_then_fails() {
    let mut device = abp_device();
    device.disable_adaptive_datarate().unwrap();
    device.set_datarate(5).unwrap();
    device.set_confirmed_msg_retries(3).unwrap();
    device.send(1, b"ack me", MsgFlags::CONFIRMED).unwrap();

    for attempt in 1..=3 {
        assert_eq!(radio(&device).sent.len(), attempt);
        complete_silent_uplink(&mut device);
        assert_eq!(device.mac().state(), MacState::AckTimeoutPending);
        fire_until(&mut device, TimerId::AckTimeout);
    }

    let sent = &radio(&device).sent;
    assert_eq!(sent.len(), 3);
    // Retransmissions reuse the frame counter.
    assert_eq!(sent[0], sent[2]);
    let sf: Vec<u8> = radio(&device)
        .tx_configs
        .iter()
        .map(|c| c.modulation.spreading_factor)
        .collect();
    assert_eq!(sf, vec![7, 7, 8]);
    assert_eq!(device.mac().mcps_confirm().nb_retries, 3);
    assert_eq!(events(&mut device), vec![AppEvent::TxError]);
}

#[test]
fn receive_drains_large_message_over_several_calls() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let payload: Vec<u8> = (0..20).collect();
    let frame = Downlink {
        port: Some(5),
        payload: &payload,
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);
    assert_eq!(events(&mut device), vec![AppEvent::RxDone, AppEvent::TxDone]);

    let mut buf = [0u8; 8];
    assert_eq!(
        device.receive(6, &mut buf, MsgFlags::UNCONFIRMED),
        Err(nb::Error::WouldBlock)
    );
    assert_eq!(
        device.receive(5, &mut buf, MsgFlags::CONFIRMED),
        Err(nb::Error::WouldBlock)
    );

    let mut out = Vec::new();
    for expected_remaining in [12, 4, 0] {
        let got = device.receive(5, &mut buf, MsgFlags::UNCONFIRMED).unwrap();
        assert_eq!(got.port, 5);
        assert_eq!(got.remaining, expected_remaining);
        out.extend_from_slice(&buf[..got.len]);
    }
    assert_eq!(out, payload);
    assert_eq!(device.receive_any(&mut buf), Err(nb::Error::WouldBlock));
}

fn battery_level() -> u8 {
    42
}

#[test]
fn mac_commands_on_port_zero() {
    let mut device = abp_device();
    device.set_battery_level_callback(Some(battery_level));
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);

    let frame = Downlink {
        port: Some(0),
        payload: &[0x06],
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    assert_eq!(device.mac().commands().commands(), &[0x06, 42, 7]);
    assert_eq!(events(&mut device), vec![AppEvent::TxDone]);
}

#[test]
fn large_command_answers_ride_on_port_zero() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    // Eight DevStatusReq produce 24 bytes of answers.
    let frame = Downlink {
        port: Some(0),
        payload: &[0x06; 8],
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);
    assert_eq!(device.mac().commands().len(), 24);

    device.send(1, &[], MsgFlags::UNCONFIRMED).unwrap();
    let frame = radio(&device).last_tx().unwrap().to_vec();
    assert_eq!(frame[5] & 0x0F, 0);
    assert_eq!(frame[8], 0);
    let answers = uplink_payload(&frame, 1);
    assert_eq!(answers.len(), 24);
    assert_eq!(answers[0], 0x06);

    tx_done(&mut device);
    assert!(device.mac().commands().is_empty());
}

#[test]
fn large_command_answers_go_before_application_data() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let frame = Downlink {
        port: Some(0),
        payload: &[0x06; 8],
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);
    events(&mut device);

    assert_eq!(device.send(1, b"data", MsgFlags::UNCONFIRMED), Ok(0));
    let frame = radio(&device).last_tx().unwrap().to_vec();
    assert_eq!(frame[8], 0);
    assert_eq!(uplink_payload(&frame, 1).len(), 24);
    complete_silent_uplink(&mut device);
    assert!(device.mac().commands().is_empty());
    assert_eq!(events(&mut device), vec![AppEvent::TxDone]);

    assert_eq!(device.send(1, b"data", MsgFlags::UNCONFIRMED), Ok(4));
    let frame = radio(&device).last_tx().unwrap().to_vec();
    assert_eq!(frame[5] & 0x0F, 0);
    assert_eq!(frame[8], 1);
    assert_eq!(uplink_payload(&frame, 2), b"data");
}

static LINK_CHECK: std::sync::Mutex<Option<(u8, u8)>> = std::sync::Mutex::new(None);

fn on_link_check(margin: u8, gateways: u8) {
    *LINK_CHECK.lock().unwrap() = Some((margin, gateways));
}

#[test]
fn link_check_answer_reaches_callback() {
    let mut device = abp_device();
    device.set_link_check_callback(Some(on_link_check));
    device.add_link_check_request().unwrap();

    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let sent = radio(&device).sent[0].clone();
    assert_eq!(sent[5] & 0x0F, 1);
    assert_eq!(sent[8], 0x02);

    let frame = Downlink {
        f_opts: &[0x02, 20, 3],
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    assert_eq!(*LINK_CHECK.lock().unwrap(), Some((20, 3)));
    assert_eq!(device.mac().mlme_confirm().nb_gateways, 3);
}

#[test]
fn sticky_answer_repeats_until_downlink() {
    let mut device = abp_device();
    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let frame = Downlink {
        f_opts: &[0x08, 0x02],
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);
    assert_eq!(device.mac().params().recv_delay1, 2_000);
    assert_eq!(device.mac().params().recv_delay2, 3_000);
    assert!(events(&mut device).contains(&AppEvent::UplinkRequired));

    for _ in 0..2 {
        device.send(1, b"x", MsgFlags::UNCONFIRMED).unwrap();
        let frame = radio(&device).last_tx().unwrap().to_vec();
        assert_eq!(frame[5] & 0x0F, 1);
        assert_eq!(frame[8], 0x08);
        complete_silent_uplink(&mut device);
    }
}

#[test]
fn adr_ack_req_after_limit() {
    let mut device = abp_device();
    device.disable_adaptive_datarate().unwrap();
    device.set_datarate(5).unwrap();
    device.enable_adaptive_datarate().unwrap();

    for _ in 0..64 {
        device.send(1, b"x", MsgFlags::UNCONFIRMED).unwrap();
        let frame = radio(&device).last_tx().unwrap().to_vec();
        assert_eq!(frame[5] & 0x40, 0);
        complete_silent_uplink(&mut device);
    }
    device.send(1, b"x", MsgFlags::UNCONFIRMED).unwrap();
    let frame = radio(&device).last_tx().unwrap().to_vec();
    assert_eq!(frame[5] & 0xC0, 0xC0);
}

#[test]
fn duty_cycle_delays_and_cancel() {
    let mut device = device();
    device.connect_with(abp_config().with_duty_cycle(true)).unwrap();
    events(&mut device);

    device.send(1, b"first", MsgFlags::UNCONFIRMED).unwrap();
    complete_silent_uplink(&mut device);
    events(&mut device);

    device.send(1, b"second", MsgFlags::UNCONFIRMED).unwrap();
    assert_eq!(radio(&device).sent.len(), 1);
    assert_eq!(device.mac().state(), MacState::TxDelayed);
    assert!(device.mac().timer().is_running(TimerId::TxDelayed));
    assert_eq!(device.send(1, b"third", MsgFlags::UNCONFIRMED), Err(Error::Busy));

    device.mac_mut().timer_mut().refuse_stop = true;
    assert_eq!(device.cancel_sending(), Err(Error::Busy));
    device.mac_mut().timer_mut().refuse_stop = false;

    device.cancel_sending().unwrap();
    assert_eq!(events(&mut device), vec![AppEvent::TxError]);
    assert_eq!(device.cancel_sending(), Err(Error::NoOp));
    assert_eq!(device.mac().state(), MacState::Idle);
}

#[test]
fn disconnect_drops_undelivered_events() {
    let mut device = device();
    device.connect_with(abp_config().with_duty_cycle(true)).unwrap();
    device.send(1, b"first", MsgFlags::UNCONFIRMED).unwrap();
    complete_silent_uplink(&mut device);
    events(&mut device);

    device.send(1, b"second", MsgFlags::UNCONFIRMED).unwrap();
    assert_eq!(device.mac().state(), MacState::TxDelayed);
    // Cancelled behind the device's back, so the TxError stays queued in the MAC.
    device.mac_mut().clear_tx_pipe().unwrap();

    device.disconnect().unwrap();
    assert_eq!(device.mac_mut().poll_event(), None);
    assert_eq!(events(&mut device), vec![AppEvent::Disconnected]);

    device.connect_with(abp_config()).unwrap();
    assert_eq!(events(&mut device), vec![AppEvent::Connected]);
}

#[test]
fn delayed_uplink_goes_out_when_band_frees() {
    let mut device = device();
    device.connect_with(abp_config().with_duty_cycle(true)).unwrap();
    device.send(1, b"first", MsgFlags::UNCONFIRMED).unwrap();
    complete_silent_uplink(&mut device);
    device.send(1, b"second", MsgFlags::UNCONFIRMED).unwrap();

    fire_until(&mut device, TimerId::TxDelayed);
    assert_eq!(radio(&device).sent.len(), 2);
    // 1 % duty cycle after 50 ms on air.
    assert!(device.mac().timer().now >= 50 * 99);
}

#[test]
fn multicast_downlink_uses_group_keys() {
    let mut device = abp_device();
    let group = DevAddr::new(0x0102_0304);
    let keys = (AESKey::new([0x33; 16]), AESKey::new([0x44; 16]));
    device
        .add_multicast(MulticastChannel {
            address: group,
            nwk_skey: keys.0,
            app_skey: keys.1,
            dl_frame_counter: None,
        })
        .unwrap();

    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let frame = Downlink {
        dev_addr: group,
        port: Some(9),
        payload: b"group",
        nwk_skey: keys.0,
        app_skey: keys.1,
        fcnt: 3,
        ..Downlink::new()
    }
    .build();
    rx_done(&mut device, &frame);

    let mut buf = [0u8; 16];
    let got = device.receive(9, &mut buf, MsgFlags::MULTICAST).unwrap();
    assert_eq!(&buf[..got.len], b"group");
    assert_eq!(device.mac().params().dl_frame_counter, None);
    assert_eq!(device.mac().params().multicast[0].dl_frame_counter, Some(3));

    device.remove_multicast(group).unwrap();
    assert_eq!(device.remove_multicast(group), Err(Error::ParameterInvalid));
}

#[test]
fn metadata_available_once() {
    let mut device = abp_device();
    assert_eq!(device.tx_metadata(), Err(Error::MetadataNotAvailable));
    assert_eq!(device.rx_metadata(), Err(Error::MetadataNotAvailable));

    uplink_to_rx1(&mut device, MsgFlags::UNCONFIRMED);
    let tx = device.tx_metadata().unwrap();
    assert_eq!(tx.tx_toa, 50);
    assert_eq!(tx.nb_retries, 1);
    assert_eq!(device.tx_metadata(), Err(Error::MetadataNotAvailable));

    rx_done(&mut device, &Downlink::new().build());
    let rx = device.rx_metadata().unwrap();
    assert_eq!(rx.rssi, -60);
    assert_eq!(rx.snr, 7);
}

#[test]
fn radio_send_failure_is_reported() {
    let mut device = abp_device();
    device.mac_mut().radio_mut().fail_send = true;
    assert_eq!(device.send(1, b"x", MsgFlags::UNCONFIRMED), Err(Error::Radio));
    assert_eq!(device.mac().state(), MacState::Idle);
}

#[test]
fn tx_timeout_ends_transaction() {
    let mut device = abp_device();
    device.send(1, b"x", MsgFlags::UNCONFIRMED).unwrap();
    post_radio(&mut device, lorawan_mac::radio::RadioEvent::TxTimeout);
    assert_eq!(events(&mut device), vec![AppEvent::TxTimeout]);
    assert_eq!(device.mac().state(), MacState::Idle);
}
