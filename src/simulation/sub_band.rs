//! Regulatory sub-bands and the logical channels that live in them.
//!
//! Duty cycle is tracked per sub-band: a transmission on any channel pushes
//! the next legal transmission time of the whole sub-band forward by
//! `airtime / duty_cycle`. An additional aggregated duty cycle, imposed by the
//! network server, is computed from the last transmission on any sub-band.

use std::collections::BTreeMap;
use std::time::Duration;

/// Highest channel index a device can hold.
pub const MAX_CHANNELS: u8 = 16;

/// A contiguous frequency range with its own duty cycle and power limit.
#[derive(Debug, Clone)]
pub struct SubBand {
    pub first_frequency: u32,
    pub last_frequency: u32,
    /// Fraction of time a transmitter may occupy the sub-band, in (0, 1].
    pub duty_cycle: f64,
    pub max_tx_power_dbm: f64,
    next_transmission_time: Duration,
}

impl SubBand {
    pub fn new(first_frequency: u32, last_frequency: u32, duty_cycle: f64, max_tx_power_dbm: f64) -> Self {
        SubBand {
            first_frequency,
            last_frequency,
            duty_cycle,
            max_tx_power_dbm,
            next_transmission_time: Duration::ZERO,
        }
    }

    /// Membership is strict on both edges.
    pub fn contains(&self, frequency: u32) -> bool {
        self.first_frequency < frequency && frequency < self.last_frequency
    }

    pub fn next_transmission_time(&self) -> Duration {
        self.next_transmission_time
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalChannel {
    pub frequency: u32,
    pub min_data_rate: u8,
    pub max_data_rate: u8,
    pub enabled_for_uplink: bool,
    /// Frequency used for the RX1 reply to uplinks sent on this channel.
    pub reply_frequency: u32,
}

impl LogicalChannel {
    pub fn new(frequency: u32, min_data_rate: u8, max_data_rate: u8) -> Self {
        LogicalChannel {
            frequency,
            min_data_rate,
            max_data_rate,
            enabled_for_uplink: true,
            reply_frequency: frequency,
        }
    }

    pub fn supports_data_rate(&self, data_rate: u8) -> bool {
        self.min_data_rate <= data_rate && data_rate <= self.max_data_rate
    }
}

/// Channel list and duty-cycle state of a single transmitter.
#[derive(Debug, Clone, Default)]
pub struct LogicalChannelManager {
    channels: BTreeMap<u8, LogicalChannel>,
    sub_bands: Vec<SubBand>,
    last_tx_start: Duration,
    last_tx_duration: Duration,
}

impl LogicalChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sub_band(&mut self, sub_band: SubBand) {
        self.sub_bands.push(sub_band);
    }

    pub fn sub_bands(&self) -> &[SubBand] {
        &self.sub_bands
    }

    /// Insert or replace the channel at `index`.
    ///
    /// The channel frequency must fall inside a configured sub-band.
    pub fn add_channel(&mut self, index: u8, channel: LogicalChannel) -> Result<(), String> {
        if index >= MAX_CHANNELS {
            return Err(format!("Channel index {} exceeds maximum of {}", index, MAX_CHANNELS - 1));
        }
        if self.sub_band_for_frequency(channel.frequency).is_none() {
            return Err(format!("Channel frequency {} Hz is outside every sub-band", channel.frequency));
        }
        self.channels.insert(index, channel);
        Ok(())
    }

    pub fn remove_channel(&mut self, index: u8) -> Option<LogicalChannel> {
        self.channels.remove(&index)
    }

    pub fn channel(&self, index: u8) -> Option<&LogicalChannel> {
        self.channels.get(&index)
    }

    pub fn channel_mut(&mut self, index: u8) -> Option<&mut LogicalChannel> {
        self.channels.get_mut(&index)
    }

    pub fn channels(&self) -> impl Iterator<Item = (u8, &LogicalChannel)> {
        self.channels.iter().map(|(i, c)| (*i, c))
    }

    /// Indices of channels enabled for uplink, in index order.
    pub fn enabled_channels(&self) -> Vec<u8> {
        self.channels.iter().filter(|(_, c)| c.enabled_for_uplink).map(|(i, _)| *i).collect()
    }

    pub fn set_reply_frequency(&mut self, index: u8, frequency: u32) -> bool {
        match self.channels.get_mut(&index) {
            Some(channel) => {
                channel.reply_frequency = frequency;
                true
            }
            None => false,
        }
    }

    pub fn sub_band_for_frequency(&self, frequency: u32) -> Option<&SubBand> {
        self.sub_bands.iter().find(|sb| sb.contains(frequency))
    }

    fn sub_band_for_frequency_mut(&mut self, frequency: u32) -> Option<&mut SubBand> {
        self.sub_bands.iter_mut().find(|sb| sb.contains(frequency))
    }

    /// Record a transmission of `duration` starting at `now` on `frequency`.
    pub fn add_event(&mut self, now: Duration, duration: Duration, frequency: u32) {
        self.last_tx_start = now;
        self.last_tx_duration = duration;
        match self.sub_band_for_frequency_mut(frequency) {
            Some(sub_band) => {
                sub_band.next_transmission_time = now + duration.div_f64(sub_band.duty_cycle);
                log::trace!("Sub-band {}-{} blocked until {:?}", sub_band.first_frequency, sub_band.last_frequency, sub_band.next_transmission_time);
            }
            None => log::error!("Transmission on {} Hz outside every sub-band", frequency),
        }
    }

    /// Time left before `frequency`'s sub-band may be used again.
    pub fn waiting_time(&self, now: Duration, frequency: u32) -> Duration {
        match self.sub_band_for_frequency(frequency) {
            Some(sub_band) => sub_band.next_transmission_time.saturating_sub(now),
            None => {
                log::warn!("No sub-band for {} Hz, treating it as unusable", frequency);
                Duration::MAX
            }
        }
    }

    /// Time left under a server-imposed aggregated duty cycle.
    ///
    /// An aggregated duty cycle of zero silences the transmitter: the result
    /// is `Duration::MAX`.
    pub fn aggregated_waiting_time(&self, now: Duration, aggregated_duty_cycle: f64) -> Duration {
        if aggregated_duty_cycle <= 0.0 {
            return Duration::MAX;
        }
        let next = self.last_tx_start + self.last_tx_duration.div_f64(aggregated_duty_cycle);
        next.saturating_sub(now)
    }

    /// Maximum transmission power allowed on `frequency`.
    pub fn tx_power_for_frequency(&self, frequency: u32) -> Option<f64> {
        self.sub_band_for_frequency(frequency).map(|sb| sb.max_tx_power_dbm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn two_band_manager() -> LogicalChannelManager {
        let mut manager = LogicalChannelManager::new();
        manager.add_sub_band(SubBand::new(868_000_000, 868_600_000, 0.01, 14.0));
        manager.add_sub_band(SubBand::new(869_000_000, 869_400_000, 0.1, 27.0));
        for (index, frequency) in [868_100_000, 868_300_000, 868_500_000, 869_100_000, 869_300_000].into_iter().enumerate() {
            manager.add_channel(index as u8, LogicalChannel::new(frequency, 0, 5)).unwrap();
        }
        manager
    }

    #[test]
    fn sub_band_membership_is_strict() {
        let sb = SubBand::new(868_000_000, 868_600_000, 0.01, 14.0);
        assert!(sb.contains(868_100_000));
        assert!(!sb.contains(868_000_000));
        assert!(!sb.contains(868_600_000));
    }

    #[test]
    fn waiting_time_is_shared_by_the_whole_sub_band() {
        let mut manager = two_band_manager();
        manager.add_event(secs(0), secs(2), 868_100_000);

        let now = secs(2);
        for frequency in [868_100_000, 868_300_000, 868_500_000] {
            assert_eq!(manager.waiting_time(now, frequency), secs(198));
        }
        for frequency in [869_100_000, 869_300_000] {
            assert_eq!(manager.waiting_time(now, frequency), Duration::ZERO);
        }
    }

    #[test]
    fn waiting_time_decays_linearly() {
        let mut manager = two_band_manager();
        manager.add_event(secs(0), secs(2), 868_300_000);
        assert_eq!(manager.waiting_time(secs(0), 868_100_000), secs(200));
        assert_eq!(manager.waiting_time(secs(50), 868_100_000), secs(150));
        assert_eq!(manager.waiting_time(secs(150), 868_100_000), secs(50));
        assert_eq!(manager.waiting_time(secs(200), 868_100_000), Duration::ZERO);
        assert_eq!(manager.waiting_time(secs(500), 868_100_000), Duration::ZERO);
    }

    #[test]
    fn aggregated_duty_cycle_uses_the_last_transmission() {
        let mut manager = two_band_manager();
        assert_eq!(manager.aggregated_waiting_time(secs(0), 1.0), Duration::ZERO);

        manager.add_event(secs(10), secs(1), 869_100_000);
        assert_eq!(manager.aggregated_waiting_time(secs(11), 1.0), Duration::ZERO);
        assert_eq!(manager.aggregated_waiting_time(secs(11), 0.125), secs(7));
        assert_eq!(manager.aggregated_waiting_time(secs(11), 0.0), Duration::MAX);
    }

    #[test]
    fn channels_outside_sub_bands_are_rejected() {
        let mut manager = two_band_manager();
        assert!(manager.add_channel(5, LogicalChannel::new(870_000_000, 0, 5)).is_err());
        assert!(manager.add_channel(MAX_CHANNELS, LogicalChannel::new(868_100_000, 0, 5)).is_err());
        assert!(manager.channel(5).is_none());
    }

    #[test]
    fn enabled_channels_skip_disabled_ones() {
        let mut manager = two_band_manager();
        manager.channel_mut(1).unwrap().enabled_for_uplink = false;
        assert_eq!(manager.enabled_channels(), vec![0, 2, 3, 4]);
    }

    #[test]
    fn reply_frequency_defaults_to_uplink() {
        let mut manager = two_band_manager();
        assert_eq!(manager.channel(0).unwrap().reply_frequency, 868_100_000);
        assert!(manager.set_reply_frequency(0, 868_500_000));
        assert_eq!(manager.channel(0).unwrap().reply_frequency, 868_500_000);
        assert!(!manager.set_reply_frequency(9, 868_500_000));
    }

    #[test]
    fn tx_power_limit_comes_from_the_sub_band() {
        let manager = two_band_manager();
        assert_eq!(manager.tx_power_for_frequency(868_100_000), Some(14.0));
        assert_eq!(manager.tx_power_for_frequency(869_300_000), Some(27.0));
        assert_eq!(manager.tx_power_for_frequency(870_000_000), None);
    }
}
