//! EU868 regional parameters.
//!
//! Data-rate tables, power table, default channel plan and RX2 settings for
//! the 863-870 MHz band.

use super::sub_band::{LogicalChannel, LogicalChannelManager, SubBand};

/// Spreading factor for each data rate.
pub const DATA_RATE_TO_SF: [u8; 7] = [12, 11, 10, 9, 8, 7, 7];
/// Bandwidth (Hz) for each data rate.
pub const DATA_RATE_TO_BANDWIDTH: [u32; 7] = [125_000, 125_000, 125_000, 125_000, 125_000, 125_000, 250_000];
/// Largest MAC payload (FHDR + FPort + FRMPayload) per data rate.
pub const MAX_MAC_PAYLOAD: [usize; 8] = [59, 59, 59, 123, 230, 230, 230, 230];
/// Transmission power (dBm) per LinkAdrReq power index.
pub const TX_POWER_TABLE: [f64; 8] = [16.0, 14.0, 12.0, 10.0, 8.0, 6.0, 4.0, 2.0];

/// Highest data rate a NewChannelReq may declare.
pub const MAX_CHANNEL_DATA_RATE: u8 = 5;
/// Highest accepted RX1 data-rate offset.
pub const MAX_RX1_DR_OFFSET: u8 = 5;

pub const RX2_FREQUENCY: u32 = 869_525_000;
pub const RX2_DATA_RATE: u8 = 0;

pub const DEFAULT_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];
pub const DEFAULT_TX_POWER_DBM: f64 = 14.0;

pub fn spreading_factor(data_rate: u8) -> Option<u8> {
    DATA_RATE_TO_SF.get(data_rate as usize).copied()
}

pub fn bandwidth(data_rate: u8) -> Option<u32> {
    DATA_RATE_TO_BANDWIDTH.get(data_rate as usize).copied()
}

/// Data rate matching a spreading factor and bandwidth pair.
pub fn data_rate_for(spreading_factor: u8, bandwidth: u32) -> Option<u8> {
    DATA_RATE_TO_SF
        .iter()
        .zip(DATA_RATE_TO_BANDWIDTH.iter())
        .position(|(sf, bw)| *sf == spreading_factor && *bw == bandwidth)
        .map(|dr| dr as u8)
}

pub fn max_mac_payload(data_rate: u8) -> Option<usize> {
    MAX_MAC_PAYLOAD.get(data_rate as usize).copied()
}

pub fn tx_power_dbm(index: u8) -> Option<f64> {
    TX_POWER_TABLE.get(index as usize).copied()
}

pub fn is_valid_data_rate(data_rate: u8) -> bool {
    (data_rate as usize) < DATA_RATE_TO_SF.len()
}

/// Data rate used for the RX1 reply to an uplink at `data_rate`.
pub fn rx1_data_rate(data_rate: u8, offset: u8) -> u8 {
    data_rate.saturating_sub(offset)
}

/// Sub-band plan with (first, last, duty cycle, max power).
pub fn sub_bands() -> Vec<SubBand> {
    vec![
        SubBand::new(868_000_000, 868_600_000, 0.01, 14.0),
        SubBand::new(868_700_000, 869_200_000, 0.001, 14.0),
        SubBand::new(869_400_000, 869_650_000, 0.1, 27.0),
    ]
}

/// Channel manager with the EU868 sub-bands and the three mandatory channels.
pub fn channel_manager() -> LogicalChannelManager {
    let mut manager = LogicalChannelManager::new();
    for sub_band in sub_bands() {
        manager.add_sub_band(sub_band);
    }
    add_default_channels(&mut manager);
    manager
}

/// (Re)install the default channels at indices 0..3.
pub fn add_default_channels(manager: &mut LogicalChannelManager) {
    for (index, frequency) in DEFAULT_CHANNELS.iter().enumerate() {
        if let Err(e) = manager.add_channel(index as u8, LogicalChannel::new(*frequency, 0, MAX_CHANNEL_DATA_RATE)) {
            log::error!("Default channel {} rejected: {}", index, e);
        }
    }
}
