//! Class A end-device MAC.
//!
//! Owns the channel plan and duty-cycle state of one device, picks a legal
//! channel for every uplink, frames packets, tracks the confirmed-message
//! retry context, drives the two receive windows after each uplink, and
//! applies MAC commands received from the network server.

use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use super::end_device_phy::{EndDevicePhy, RadioState, ReceptionOutcome};
use super::events::{SimContext, SimEvent};
use super::receive_windows::{RX2_AFTER_RX1, ReceiveWindow, ReceiveWindowManager, WindowSettings};
use super::region;
use super::scheduler::EventId;
use super::signal_calculations::{LoraTxParameters, symbol_time, time_on_air};
use super::sub_band::{LogicalChannel, LogicalChannelManager};
use super::trace::TraceEvent;
use super::types::{DeviceAddress, Frame, MacCommand, MessageType, Packet, RadioId, Transmission};

/// Added to a postponement so the retry lands strictly after the wait expires.
const POSTPONE_MARGIN: Duration = Duration::from_nanos(10);

const ADR_ACK_LIMIT: u16 = 64;
const ADR_ACK_DELAY: u16 = 32;

/// Timing knobs shared by every end-device MAC.
#[derive(Debug, Clone)]
pub struct MacSettings {
    pub retransmit_timeout: Duration,
    pub busy_delay_min: Duration,
    pub busy_delay_max: Duration,
    pub receive_window_symbols: u32,
}

impl Default for MacSettings {
    fn default() -> Self {
        MacSettings {
            retransmit_timeout: Duration::from_secs(5),
            busy_delay_min: Duration::from_secs(4),
            busy_delay_max: Duration::from_secs(5),
            receive_window_symbols: 8,
        }
    }
}

/// Per-device uplink configuration.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub address: DeviceAddress,
    pub data_rate: u8,
    pub tx_power_dbm: f64,
    pub confirmed: bool,
    pub max_transmissions: u8,
    pub adr: bool,
}

/// State of the application packet currently being delivered.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    pub packet: Option<Packet>,
    pub first_attempt: Duration,
    pub transmissions_left: u8,
    pub waiting_ack: bool,
    pub busy: bool,
    frame_counter: u16,
}

/// What the last exchange produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeOutcome {
    Nothing,
    Received,
    Ack,
    Failed,
}

pub struct EndDeviceMac {
    device: usize,
    radio: RadioId,
    address: DeviceAddress,
    channels: LogicalChannelManager,
    data_rate: u8,
    tx_power_dbm: f64,
    max_transmissions: u8,
    aggregated_duty_cycle: f64,
    message_type: MessageType,
    adr: bool,
    frame_counter: u16,
    adr_ack_counter: u16,
    pending_commands: Vec<MacCommand>,
    context: TxContext,
    next_send: Option<EventId>,
    last_channel: Option<u8>,
    last_data_rate: u8,
    rx1_dr_offset: u8,
    rx2_data_rate: u8,
    windows: ReceiveWindowManager,
    link_margin: Option<u8>,
    gateway_count: Option<u8>,
    settings: MacSettings,
}

impl EndDeviceMac {
    pub fn new(device: usize, profile: &DeviceProfile, settings: MacSettings) -> Result<Self, String> {
        if !region::is_valid_data_rate(profile.data_rate) {
            return Err(format!("Device {} has unknown data rate {}", profile.address, profile.data_rate));
        }
        if profile.max_transmissions == 0 {
            return Err(format!("Device {} needs at least one transmission per packet", profile.address));
        }

        let rx2 = Self::window_settings(region::RX2_FREQUENCY, region::RX2_DATA_RATE, settings.receive_window_symbols)?;
        Ok(EndDeviceMac {
            device,
            radio: RadioId::EndDevice(device),
            address: profile.address,
            channels: region::channel_manager(),
            data_rate: profile.data_rate,
            tx_power_dbm: profile.tx_power_dbm,
            max_transmissions: profile.max_transmissions,
            aggregated_duty_cycle: 1.0,
            message_type: if profile.confirmed {
                MessageType::ConfirmedDataUp
            } else {
                MessageType::UnconfirmedDataUp
            },
            adr: profile.adr,
            frame_counter: 0,
            adr_ack_counter: 0,
            pending_commands: Vec::new(),
            context: TxContext::default(),
            next_send: None,
            last_channel: None,
            last_data_rate: profile.data_rate,
            rx1_dr_offset: 0,
            rx2_data_rate: region::RX2_DATA_RATE,
            windows: ReceiveWindowManager::new(device, rx2, rx2),
            link_margin: None,
            gateway_count: None,
            settings,
        })
    }

    fn window_settings(frequency: u32, data_rate: u8, symbols: u32) -> Result<WindowSettings, String> {
        let spreading_factor = region::spreading_factor(data_rate).ok_or_else(|| format!("Unknown data rate {}", data_rate))?;
        let bandwidth = region::bandwidth(data_rate).ok_or_else(|| format!("Unknown data rate {}", data_rate))?;
        Ok(WindowSettings {
            frequency,
            spreading_factor,
            duration: Duration::from_secs_f64(symbols as f64 * symbol_time(spreading_factor, bandwidth)),
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn channels(&self) -> &LogicalChannelManager {
        &self.channels
    }

    pub fn data_rate(&self) -> u8 {
        self.data_rate
    }

    pub fn tx_power_dbm(&self) -> f64 {
        self.tx_power_dbm
    }

    pub fn max_transmissions(&self) -> u8 {
        self.max_transmissions
    }

    pub fn aggregated_duty_cycle(&self) -> f64 {
        self.aggregated_duty_cycle
    }

    pub fn context(&self) -> &TxContext {
        &self.context
    }

    pub fn pending_commands(&self) -> &[MacCommand] {
        &self.pending_commands
    }

    pub fn rx1_dr_offset(&self) -> u8 {
        self.rx1_dr_offset
    }

    pub fn rx1_delay(&self) -> Duration {
        self.windows.rx1_delay()
    }

    pub fn rx2_window(&self) -> WindowSettings {
        self.windows.second_window()
    }

    pub fn last_link_check(&self) -> Option<(u8, u8)> {
        self.link_margin.zip(self.gateway_count)
    }

    /// Queue a MAC command for the next uplink.
    pub fn add_mac_command(&mut self, command: MacCommand) {
        self.pending_commands.push(command);
    }

    /// Delay before any uplink is legal.
    ///
    /// The largest sub-band wait over enabled channels, the busy-radio backoff
    /// and the aggregated duty cycle are combined with `max`. `Duration::MAX`
    /// means the device may not transmit at all.
    pub fn next_transmission_delay(&self, ctx: &mut SimContext) -> Duration {
        let now = ctx.now();
        let enabled = self.channels.enabled_channels();
        if enabled.is_empty() {
            return Duration::MAX;
        }

        let mut delay = enabled
            .iter()
            .filter_map(|i| self.channels.channel(*i))
            .map(|c| self.channels.waiting_time(now, c.frequency))
            .max()
            .unwrap_or(Duration::ZERO);

        if self.context.busy {
            let min = self.settings.busy_delay_min.as_secs_f64();
            let max = self.settings.busy_delay_max.as_secs_f64().max(min);
            delay = delay.max(Duration::from_secs_f64(ctx.rng.gen_range(min..=max)));
        }

        delay.max(self.channels.aggregated_waiting_time(now, self.aggregated_duty_cycle))
    }

    /// Send `packet` now if the regulations allow it, otherwise postpone it.
    pub fn send(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, packet: Packet) -> Option<Transmission> {
        if let Some(id) = self.next_send.take() {
            ctx.queue.cancel(id);
        }

        let delay = self.next_transmission_delay(ctx);
        if delay == Duration::MAX {
            log::warn!("Device {} may not transmit, dropping packet {}", self.address, packet.id);
            return None;
        }
        if !delay.is_zero() {
            if self.context.busy {
                log::warn!("Device {} is busy, postponing packet {} by {:?}", self.address, packet.id, delay);
            } else {
                log::debug!("Device {} postpones packet {} by {:?}", self.address, packet.id, delay);
            }
            ctx.emit(TraceEvent::CannotSendDutyCycle { radio: self.radio, packet: packet.id, delay });
            self.next_send = Some(ctx.schedule(delay + POSTPONE_MARGIN, SimEvent::MacSend { device: self.device, packet }));
            return None;
        }

        self.do_send(ctx, phy, packet)
    }

    fn do_send(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, mut packet: Packet) -> Option<Transmission> {
        let now = ctx.now();
        let is_new = self.context.packet.as_ref().map(|p| p.id) != Some(packet.id);

        if is_new {
            if self.context.packet.is_some() && self.context.transmissions_left > 0 && self.context.waiting_ack {
                self.report_delivery(ctx, false);
            }
            self.context = TxContext {
                packet: Some(packet.clone()),
                first_attempt: now,
                transmissions_left: self.max_transmissions,
                waiting_ack: self.message_type.is_confirmed(),
                busy: false,
                frame_counter: self.frame_counter,
            };
        }
        if self.adr {
            self.adr_backoff();
        }
        packet.frame = Some(Frame {
            message_type: self.message_type,
            address: self.address,
            frame_counter: self.context.frame_counter,
            ack: false,
            adr: self.adr,
            adr_ack_req: self.adr && self.adr_ack_counter >= ADR_ACK_LIMIT,
            port: 1,
            commands: self.pending_commands.clone(),
        });

        let limit = region::max_mac_payload(self.data_rate).unwrap_or(0);
        if packet.mac_payload_len() > limit {
            log::error!(
                "Device {} packet {} MAC payload {} B exceeds {} B allowed at DR{}",
                self.address,
                packet.id,
                packet.mac_payload_len(),
                limit,
                self.data_rate
            );
            return None;
        }
        self.pending_commands.retain(MacCommand::is_sticky_answer);

        let transmission = self.send_to_phy(ctx, phy, packet)?;
        self.context.busy = true;
        self.context.transmissions_left = self.context.transmissions_left.saturating_sub(1);

        if is_new {
            self.frame_counter = self.frame_counter.wrapping_add(1);
            self.adr_ack_counter = self.adr_ack_counter.saturating_add(1);
            ctx.emit(TraceEvent::SentNewPacket { radio: self.radio, packet: transmission.packet.id });
        }
        Some(transmission)
    }

    /// Lower power, then data rate, while the network stays silent (LoRaWAN 1.0.4 backoff).
    fn adr_backoff(&mut self) {
        if self.adr_ack_counter < ADR_ACK_LIMIT + ADR_ACK_DELAY {
            return;
        }
        let over = self.adr_ack_counter - ADR_ACK_LIMIT;
        if over % ADR_ACK_DELAY != 0 {
            return;
        }
        if over == ADR_ACK_DELAY {
            self.tx_power_dbm = region::DEFAULT_TX_POWER_DBM;
        } else if self.data_rate > 0 {
            self.data_rate -= 1;
        } else {
            region::add_default_channels(&mut self.channels);
            self.max_transmissions = 1;
        }
        log::info!("Device {} ADR backoff: DR{} at {} dBm", self.address, self.data_rate, self.tx_power_dbm);
    }

    /// Pick a channel with no duty-cycle wait from a uniformly shuffled enabled list.
    fn channel_for_tx(&self, ctx: &mut SimContext) -> Option<u8> {
        let now = ctx.now();
        let mut enabled = self.channels.enabled_channels();
        enabled.shuffle(&mut ctx.rng);
        enabled.into_iter().find(|index| {
            self.channels
                .channel(*index)
                .is_some_and(|c| self.channels.waiting_time(now, c.frequency).is_zero())
        })
    }

    fn send_to_phy(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, packet: Packet) -> Option<Transmission> {
        if matches!(phy.state(), RadioState::Tx | RadioState::Rx) {
            log::warn!("Device {} radio is in {:?}, cannot send packet {}", self.address, phy.state(), packet.id);
            return None;
        }
        let spreading_factor = region::spreading_factor(self.data_rate)?;
        let bandwidth = region::bandwidth(self.data_rate)?;
        let params = LoraTxParameters::for_sf_bw(spreading_factor, bandwidth);

        let Some(index) = self.channel_for_tx(ctx) else {
            log::warn!("Device {} found no free channel for packet {}", self.address, packet.id);
            return None;
        };
        let frequency = self.channels.channel(index)?.frequency;

        let mut tx_power_dbm = self.tx_power_dbm;
        if let Some(limit) = self.channels.tx_power_for_frequency(frequency) {
            if tx_power_dbm > limit {
                log::warn!("Device {} power {} dBm clamped to sub-band limit {} dBm", self.address, tx_power_dbm, limit);
                tx_power_dbm = limit;
            }
        }

        let duration = time_on_air(&params, packet.size());
        self.channels.add_event(ctx.now(), duration, frequency);
        phy.switch_to_standby();
        let transmission = phy.send(ctx, packet, params, tx_power_dbm, frequency)?;

        self.last_channel = Some(index);
        self.last_data_rate = self.data_rate;
        Some(transmission)
    }

    /// The radio finished the uplink: sleep and schedule the receive windows.
    pub fn tx_finished(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy) {
        phy.switch_to_sleep();

        let reply_frequency = self
            .last_channel
            .and_then(|i| self.channels.channel(i))
            .map(|c| c.reply_frequency)
            .unwrap_or(region::DEFAULT_CHANNELS[0]);
        let rx1_data_rate = region::rx1_data_rate(self.last_data_rate, self.rx1_dr_offset);
        match Self::window_settings(reply_frequency, rx1_data_rate, self.settings.receive_window_symbols) {
            Ok(first) => self.windows.set_first_window(first),
            Err(e) => log::error!("Device {} RX1 setup failed: {}", self.address, e),
        }
        self.windows.start(ctx);
    }

    pub fn open_window(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, window: ReceiveWindow) {
        self.windows.open(ctx, phy, window);
    }

    pub fn close_window(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, window: ReceiveWindow) {
        if self.windows.close(phy, window) {
            self.no_reception(ctx);
        }
    }

    pub fn reception_outcome(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, outcome: ReceptionOutcome) {
        match outcome {
            ReceptionOutcome::Received { packet, .. } => self.receive(ctx, phy, packet),
            ReceptionOutcome::Failed => self.failed_reception(ctx, phy),
        }
    }

    fn receive(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, packet: Packet) {
        let Some(frame) = packet.frame else {
            log::warn!("Device {} received an unframed packet {}", self.address, packet.id);
            self.failed_reception(ctx, phy);
            return;
        };

        self.windows.stop(ctx, phy);
        self.context.busy = false;
        self.adr_ack_counter = 0;
        self.pending_commands.clear();
        self.apply_mac_commands(&frame.commands);

        let outcome = if frame.ack { ExchangeOutcome::Ack } else { ExchangeOutcome::Received };
        self.manage_retransmissions(ctx, outcome);
    }

    fn failed_reception(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy) {
        self.windows.force_sleep(ctx, phy);
        if self.windows.no_more_windows(ctx) {
            self.manage_retransmissions(ctx, ExchangeOutcome::Failed);
            self.context.busy = false;
        }
    }

    fn no_reception(&mut self, ctx: &mut SimContext) {
        self.manage_retransmissions(ctx, ExchangeOutcome::Nothing);
        self.context.busy = false;
    }

    fn manage_retransmissions(&mut self, ctx: &mut SimContext, outcome: ExchangeOutcome) {
        let received = matches!(outcome, ExchangeOutcome::Received | ExchangeOutcome::Ack);
        let got_ack = outcome == ExchangeOutcome::Ack;
        let need_ack = self.context.waiting_ack;
        let send_pending = self.next_send.is_some_and(|id| ctx.queue.is_pending(id));
        let can_retransmit = self.context.transmissions_left > 0 && !send_pending;

        if (!received || (need_ack && !got_ack)) && can_retransmit {
            if let Some(packet) = self.context.packet.clone() {
                log::debug!(
                    "Device {} retransmits packet {} in {:?} ({} left)",
                    self.address,
                    packet.id,
                    self.settings.retransmit_timeout,
                    self.context.transmissions_left
                );
                self.next_send = Some(ctx.schedule(self.settings.retransmit_timeout, SimEvent::MacSend { device: self.device, packet }));
            }
            return;
        }

        if received && need_ack && got_ack {
            self.report_delivery(ctx, true);
        } else if need_ack && !got_ack {
            self.report_delivery(ctx, false);
        }
    }

    /// Fire the delivery result for the current context and close it.
    fn report_delivery(&mut self, ctx: &mut SimContext, success: bool) {
        let Some(packet) = self.context.packet.as_ref().map(|p| p.id) else {
            return;
        };
        let transmissions = self.max_transmissions.saturating_sub(self.context.transmissions_left);
        let first_attempt = self.context.first_attempt;
        let event = if success {
            log::info!("Device {} packet {} delivered after {}/{} transmissions", self.address, packet, transmissions, self.max_transmissions);
            TraceEvent::DeliverySucceeded {
                radio: self.radio,
                packet,
                transmissions,
                max_transmissions: self.max_transmissions,
                first_attempt,
            }
        } else {
            log::info!("Device {} packet {} failed after {}/{} transmissions", self.address, packet, transmissions, self.max_transmissions);
            TraceEvent::DeliveryFailed {
                radio: self.radio,
                packet,
                transmissions,
                max_transmissions: self.max_transmissions,
                first_attempt,
            }
        };
        ctx.emit(event);
        self.context.waiting_ack = false;
        self.context.transmissions_left = 0;
    }

    fn apply_mac_commands(&mut self, commands: &[MacCommand]) {
        for command in commands {
            log::debug!("Device {} applies {:?}", self.address, command);
            match command {
                MacCommand::LinkCheckAns { margin, gateway_count } => {
                    self.link_margin = Some(*margin);
                    self.gateway_count = Some(*gateway_count);
                }
                MacCommand::LinkAdrReq {
                    data_rate,
                    tx_power,
                    enabled_channels,
                    repetitions,
                } => self.on_link_adr_req(*data_rate, *tx_power, enabled_channels, *repetitions),
                MacCommand::DutyCycleReq { max_duty_cycle } => {
                    self.aggregated_duty_cycle = 1.0 / 2f64.powi(*max_duty_cycle as i32);
                    self.pending_commands.push(MacCommand::DutyCycleAns);
                }
                MacCommand::RxParamSetupReq {
                    rx1_dr_offset,
                    rx2_data_rate,
                    frequency,
                } => self.on_rx_param_setup_req(*rx1_dr_offset, *rx2_data_rate, *frequency),
                MacCommand::DevStatusReq => {
                    self.pending_commands.push(MacCommand::DevStatusAns { battery: 10, margin: 10 });
                }
                MacCommand::NewChannelReq {
                    index,
                    frequency,
                    min_data_rate,
                    max_data_rate,
                } => self.on_new_channel_req(*index, *frequency, *min_data_rate, *max_data_rate),
                MacCommand::RxTimingSetupReq { delay } => {
                    // A delay of 0 means 1 s.
                    self.windows.set_rx1_delay(Duration::from_secs((*delay).max(1) as u64));
                    self.pending_commands.push(MacCommand::RxTimingSetupAns);
                }
                MacCommand::DlChannelReq { index, frequency } => {
                    let uplink_frequency_exists = self.channels.channel(*index).is_some();
                    let channel_frequency_ok = self.channels.sub_band_for_frequency(*frequency).is_some();
                    if uplink_frequency_exists && channel_frequency_ok {
                        self.channels.set_reply_frequency(*index, *frequency);
                    }
                    self.pending_commands.push(MacCommand::DlChannelAns {
                        uplink_frequency_exists,
                        channel_frequency_ok,
                    });
                }
                other => log::debug!("Device {} ignores {:?}", self.address, other),
            }
        }
    }

    fn on_link_adr_req(&mut self, data_rate: u8, tx_power: u8, enabled_channels: &[u8], repetitions: u8) {
        let channel_mask_ack = !enabled_channels.is_empty() && enabled_channels.iter().all(|i| self.channels.channel(*i).is_some());
        let data_rate_ack = region::is_valid_data_rate(data_rate)
            && enabled_channels
                .iter()
                .filter_map(|i| self.channels.channel(*i))
                .any(|c| c.supports_data_rate(data_rate));
        let power = region::tx_power_dbm(tx_power);
        let power_ack = power.is_some();

        if let (true, true, Some(power)) = (channel_mask_ack, data_rate_ack, power) {
            let indices: Vec<u8> = self.channels.channels().map(|(i, _)| i).collect();
            for index in indices {
                if let Some(channel) = self.channels.channel_mut(index) {
                    channel.enabled_for_uplink = enabled_channels.contains(&index);
                }
            }
            self.data_rate = data_rate;
            self.tx_power_dbm = power;
            self.max_transmissions = repetitions.max(1);
        }

        self.pending_commands.push(MacCommand::LinkAdrAns {
            power_ack,
            data_rate_ack,
            channel_mask_ack,
        });
    }

    fn on_rx_param_setup_req(&mut self, rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32) {
        let rx1_dr_offset_ack = rx1_dr_offset <= region::MAX_RX1_DR_OFFSET;
        let rx2_data_rate_ack = region::is_valid_data_rate(rx2_data_rate);
        let channel_ack = self.channels.sub_band_for_frequency(frequency).is_some();

        if rx1_dr_offset_ack && rx2_data_rate_ack && channel_ack {
            match Self::window_settings(frequency, rx2_data_rate, self.settings.receive_window_symbols) {
                Ok(second) => {
                    self.rx1_dr_offset = rx1_dr_offset;
                    self.rx2_data_rate = rx2_data_rate;
                    self.windows.set_second_window(second);
                }
                Err(e) => log::error!("Device {} RX2 setup failed: {}", self.address, e),
            }
        }

        self.pending_commands.push(MacCommand::RxParamSetupAns {
            rx1_dr_offset_ack,
            rx2_data_rate_ack,
            channel_ack,
        });
    }

    fn on_new_channel_req(&mut self, index: u8, frequency: u32, min_data_rate: u8, max_data_rate: u8) {
        let data_rate_range_ok = min_data_rate <= max_data_rate && max_data_rate <= region::MAX_CHANNEL_DATA_RATE;
        let channel_frequency_ok = frequency == 0 || self.channels.sub_band_for_frequency(frequency).is_some();

        if data_rate_range_ok && channel_frequency_ok {
            if frequency == 0 {
                self.channels.remove_channel(index);
            } else if let Err(e) = self.channels.add_channel(index, LogicalChannel::new(frequency, min_data_rate, max_data_rate)) {
                log::warn!("Device {} rejected NewChannelReq: {}", self.address, e);
            }
        }

        self.pending_commands.push(MacCommand::NewChannelAns {
            data_rate_range_ok,
            channel_frequency_ok,
        });
    }

    /// RX2 opens this long after the end of an uplink.
    pub fn rx2_delay(&self) -> Duration {
        self.windows.rx1_delay() + RX2_AFTER_RX1
    }

    pub fn rx2_data_rate(&self) -> u8 {
        self.rx2_data_rate
    }
}
