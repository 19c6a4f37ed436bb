//! EU 863-870 MHz ISM band

use super::{Band, Channel, DataRate, DrRange, RegionTables};
use crate::radio::Modem;

const DEFAULT_CHANNELS: [Channel; 3] = [
    Channel::new(868_100_000, DrRange::new(0, 5), 2),
    Channel::new(868_300_000, DrRange::new(0, 5), 2),
    Channel::new(868_500_000, DrRange::new(0, 5), 2),
];

// ETSI EN 300 220 sub-bands
const BANDS: [Band; 6] = [
    Band::new(1000, 0, 863_000_000, 864_999_999),
    Band::new(100, 0, 865_000_000, 867_999_999),
    Band::new(100, 0, 868_000_000, 868_600_000),
    Band::new(1000, 0, 868_700_000, 869_200_000),
    Band::new(10, 0, 869_400_000, 869_650_000),
    Band::new(100, 0, 869_700_000, 870_000_000),
];

const DATARATES: [DataRate; 8] = [
    DataRate::lora(12, 125_000),
    DataRate::lora(11, 125_000),
    DataRate::lora(10, 125_000),
    DataRate::lora(9, 125_000),
    DataRate::lora(8, 125_000),
    DataRate::lora(7, 125_000),
    DataRate::lora(7, 250_000),
    DataRate {
        modem: Modem::Fsk,
        spreading_factor: 50,
        bandwidth: 50_000,
    },
];

const MAX_PAYLOAD: [u8; 8] = [51, 51, 51, 115, 242, 242, 242, 242];

/// EU868 regional parameters
pub static EU868: RegionTables = RegionTables {
    name: "EU868",
    max_channels: 16,
    default_channels: &DEFAULT_CHANNELS,
    bands: &BANDS,
    datarates: &DATARATES,
    max_payload: &MAX_PAYLOAD,
    min_tx_datarate: 0,
    max_tx_datarate: 7,
    min_rx_datarate: 0,
    max_rx_datarate: 7,
    default_max_datarate: 5,
    default_datarate: 0,
    max_rx1_dr_offset: 5,
    max_tx_power: 0,
    min_tx_power: 7,
    default_tx_power: 0,
    max_eirp: 16,
    antenna_gain_cdb: 215,
    rx2_frequency: 869_525_000,
    rx2_datarate: 0,
    min_frequency: 863_000_000,
    max_frequency: 870_000_000,
    cflist_supported: true,
    custom_channel_plan_supported: true,
    accept_tx_param_setup: false,
    dl_channel_req_supported: true,
    duty_cycle_on: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_channels_sit_in_their_band() {
        for ch in EU868.default_channels {
            assert!(EU868.bands[ch.band as usize].contains(ch.frequency));
        }
    }

    #[test]
    fn tables_cover_every_datarate() {
        let count = EU868.max_tx_datarate as usize + 1;
        assert_eq!(EU868.datarates.len(), count);
        assert_eq!(EU868.max_payload.len(), count);
    }

    #[test]
    fn bands_do_not_overlap() {
        for (i, a) in EU868.bands.iter().enumerate() {
            for b in EU868.bands.iter().skip(i + 1) {
                assert!(a.high_frequency < b.low_frequency || b.high_frequency < a.low_frequency);
            }
        }
    }
}
