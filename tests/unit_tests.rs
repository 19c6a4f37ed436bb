use lorawan_mac::{
    config::device::{Activation, AESKey, DevAddr, DeviceClass, DeviceConfig, DEFAULT_NB_TRIALS},
    device::{DeviceState, LoRaWANDevice, MsgFlags},
    error::Error,
    lorawan::{
        channel_plan::ChannelParams,
        commands::{CommandIdentifier, MacCommandCodec},
        params::ProtocolParams,
        phy::RegionalPhy,
        region::{ChannelMask, DrRange, Region, EU868},
    },
};

use mock::*;

#[test]
fn device_config_builders() {
    let config = DeviceConfig::new_otaa([0x01; 8], [0x02; 8], AESKey::new([0x03; 16]));
    assert!(config.is_otaa());
    assert_eq!(config.device_class, DeviceClass::A);
    assert!(config.adr_enabled && config.duty_cycle_on && config.public_network);
    match config.activation {
        Activation::Otaa(otaa) => {
            assert_eq!(otaa.app_key.as_bytes(), &[0x03; 16]);
            assert_eq!(otaa.nb_trials, DEFAULT_NB_TRIALS);
        }
        Activation::Abp(_) => panic!("expected OTAA"),
    }

    let config = DeviceConfig::new_abp(1, DevAddr::new(0x0102_0304), AESKey::new([1; 16]), AESKey::new([2; 16]))
        .with_nb_trials(3)
        .with_adr(false)
        .with_class(DeviceClass::C);
    assert!(!config.is_otaa());
    assert!(!config.adr_enabled);
    assert_eq!(config.device_class, DeviceClass::C);
    assert_eq!(DevAddr::new(0x0102_0304).to_le_bytes(), [4, 3, 2, 1]);
}

#[test]
fn channel_mask_operations() {
    let mut mask = ChannelMask::first(3);
    assert_eq!(mask.count(), 3);
    assert!(mask.test(2) && !mask.test(3));
    mask.set(9);
    mask.clear(0);
    assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 2, 9]);
    assert_eq!(mask.word(0), 0b10_0000_0110);
    mask.set(200);
    assert_eq!(mask.count(), 3);
    assert!(ChannelMask::empty().is_empty());
}

#[test]
fn eu868_defaults() {
    let phy = RegionalPhy::new(Region::Eu868);
    assert_eq!(phy.default_channel_count(), 3);
    let frequencies: Vec<u32> = phy.channel_mask().iter().filter_map(|id| phy.channel(id)).map(|c| c.frequency).collect();
    assert_eq!(frequencies, vec![868_100_000, 868_300_000, 868_500_000]);
    assert_eq!(phy.get_alternate_dr(0), 0);
    assert_eq!(phy.get_alternate_dr(1), 5);
    assert_eq!(phy.get_next_lower_tx_datarate(0), 0);
    assert_eq!(phy.get_next_lower_tx_datarate(3), 2);
    assert!(phy.verify_frequency(867_100_000));
    assert!(!phy.verify_frequency(915_000_000));
    assert_eq!(phy.max_payload(0), 51);
    assert_eq!(phy.max_payload(3), 115);
    assert_eq!(phy.max_payload(5), 242);
}

#[test]
fn full_application_payload_at_dr5() {
    let mut device = abp_device();
    device.disable_adaptive_datarate().unwrap();
    device.set_datarate(5).unwrap();
    let data = [0xA5; 242];
    assert_eq!(device.send(1, &data, MsgFlags::UNCONFIRMED), Ok(242));
    assert_eq!(radio(&device).last_tx().unwrap().len(), 255);

    let mut device = abp_device();
    device.disable_adaptive_datarate().unwrap();
    device.set_datarate(3).unwrap();
    assert_eq!(device.send(1, &data[..116], MsgFlags::UNCONFIRMED), Err(Error::LengthError));
}

#[test]
fn codec_queues_answers_in_order() {
    let mut codec = MacCommandCodec::new();
    assert!(codec.is_empty());
    codec.add_link_adr_ans(0x07).unwrap();
    codec.add_dev_status_ans(200, 0xFF).unwrap();
    assert!(!codec.has_sticky_mac_cmd());
    codec.add_rx_timing_setup_ans().unwrap();
    assert!(codec.has_sticky_mac_cmd());
    assert_eq!(codec.commands(), &[0x03, 0x07, 0x06, 200, 0x3F, 0x08]);

    codec.clear_command_buffer();
    assert!(codec.is_empty());
    assert_eq!(CommandIdentifier::from_u8(0x0A), Some(CommandIdentifier::DlChannel));
    assert_eq!(CommandIdentifier::from_u8(0x0B), None);
}

#[test]
fn codec_rejects_overflow() {
    let mut codec = MacCommandCodec::with_capacity(3);
    codec.add_link_adr_ans(0).unwrap();
    assert_eq!(codec.add_link_adr_ans(0), Err(Error::LengthError));
    assert_eq!(codec.len(), 2);
}

#[test]
fn downlink_commands_stop_when_answers_no_longer_fit() {
    let mut codec = MacCommandCodec::with_capacity(4);
    let mut params = ProtocolParams::new(&EU868);
    let mut phy = RegionalPhy::new(Region::Eu868);
    // Three DutyCycleReq, then a NewChannelReq for channel 3
    let cmds = [0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x07, 3, 0x18, 0x4F, 0x84, 0x50];
    let result = codec.process_mac_commands(&cmds, 0, &mut params, &mut phy, 255, |_| true);
    assert_eq!(result, Err(Error::LengthError));
    assert_eq!(codec.commands(), &[0x04, 0x04, 0x04]);
    assert!(phy.channel(3).is_none());
}

#[test]
fn errors_display_their_cause() {
    assert_eq!(
        Error::DutyCycleRestricted { retry_after_ms: 1200 }.to_string(),
        "duty cycle restricted, retry in 1200 ms"
    );
    assert_eq!(Error::PortInvalid.to_string(), "invalid port");
}

#[cfg(feature = "std")]
#[test]
fn errors_box_into_std_error() {
    let boxed: Box<dyn std::error::Error> = Box::new(Error::NoNetworkJoined);
    assert_eq!(boxed.to_string(), "no network joined");
}

#[test]
fn channel_plan_through_device() {
    let mut device = device();
    let extra = ChannelParams {
        id: 3,
        frequency: 867_100_000,
        rx1_frequency: 0,
        dr_range: DrRange::new(0, 5),
    };
    device.set_channel_plan(&[extra]).unwrap();
    let plan = device.get_channel_plan().unwrap();
    assert_eq!(plan.len(), 4);
    assert_eq!(plan[3], extra);

    assert_eq!(device.remove_channel(0), Err(Error::ParameterInvalid));
    device.remove_channel(3).unwrap();
    assert_eq!(device.remove_channel(3), Err(Error::ParameterInvalid));
    device.set_channel_plan(&[extra]).unwrap();
    device.remove_channel_plan().unwrap();
    assert_eq!(device.get_channel_plan().unwrap().len(), 3);
}

#[test]
fn operations_before_initialize() {
    let mut device = LoRaWANDevice::new(MockRadio::new(), MockTimer::new(), lorawan_mac::crypto::LoRaMacCrypto::new(), Region::Eu868);
    assert_eq!(device.state(), DeviceState::NotInitialized);
    assert_eq!(device.connect_with(abp_config()), Err(Error::NotInitialized));
    assert_eq!(device.send(1, b"x", MsgFlags::UNCONFIRMED), Err(Error::NotInitialized));
}

#[test]
fn send_requires_session() {
    let mut device = device();
    assert_eq!(device.send(1, b"x", MsgFlags::UNCONFIRMED), Err(Error::NoActiveSessions));
    assert_eq!(device.connect(), Err(Error::ParameterInvalid));
}

#[test]
fn connect_state_errors() {
    let mut device = abp_device();
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(device.connect_with(abp_config()), Err(Error::AlreadyConnected));

    let mut joining = device_with_join();
    assert_eq!(joining.connect_with(otaa_config(2)), Err(Error::ConnectInProgress));
}

fn device_with_join() -> TestDevice {
    let mut device = device();
    device.connect_with(otaa_config(2)).unwrap();
    assert_eq!(device.state(), DeviceState::ConnectInProgress);
    device
}

#[test]
fn send_validates_port_and_flags() {
    let mut device = abp_device();
    assert_eq!(device.send(0, b"x", MsgFlags::UNCONFIRMED), Err(Error::PortInvalid));
    assert_eq!(device.send(224, b"x", MsgFlags::CONFIRMED), Err(Error::PortInvalid));
    assert_eq!(
        device.send(1, b"x", MsgFlags::CONFIRMED | MsgFlags::UNCONFIRMED),
        Err(Error::ParameterInvalid)
    );
    assert_eq!(device.send(1, b"x", MsgFlags::empty()), Err(Error::ParameterInvalid));
    assert_eq!(device.send(223, b"hello", MsgFlags::UNCONFIRMED), Ok(5));
}

#[test]
fn datarate_and_retry_controls() {
    let mut device = abp_device();
    assert_eq!(device.set_datarate(3), Err(Error::ParameterInvalid));
    device.disable_adaptive_datarate().unwrap();
    device.set_datarate(3).unwrap();
    assert_eq!(device.mac().params().channel_data_rate, 3);
    assert_eq!(device.set_datarate(7), Err(Error::DatarateInvalid));

    assert_eq!(device.set_confirmed_msg_retries(0), Err(Error::ParameterInvalid));
    device.set_confirmed_msg_retries(4).unwrap();
    assert_eq!(device.mac().params().max_ack_retries, 4);
}

#[test]
fn link_check_needs_session() {
    let mut device = device();
    assert_eq!(device.add_link_check_request(), Err(Error::NoNetworkJoined));
    let mut device = abp_device();
    device.add_link_check_request().unwrap();
    assert_eq!(device.mac().commands().commands(), &[0x02]);
}

#[test]
fn shutdown_and_revive() {
    let mut device = abp_device();
    device.shutdown().unwrap();
    assert_eq!(device.state(), DeviceState::DeviceOff);
    assert_eq!(device.send(1, b"x", MsgFlags::UNCONFIRMED), Err(Error::DeviceOff));
    assert_eq!(device.connect(), Err(Error::DeviceOff));

    device.initialize().unwrap();
    assert_eq!(device.state(), DeviceState::Idle);
    device.connect().unwrap();
    assert_eq!(device.state(), DeviceState::Connected);
}
