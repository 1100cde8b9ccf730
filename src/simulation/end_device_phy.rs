//! Single-demodulator end-device radio.
//!
//! The radio moves between SLEEP, STANDBY, TX and RX. Every incoming signal
//! is recorded as a potential interferer, but only a radio waiting in STANDBY
//! on the right frequency and spreading factor can lock onto one. Downlinks
//! addressed to another device are dropped once the address has been heard.

use std::time::Duration;

use super::events::{IncomingSignal, SimContext, SimEvent};
use super::interference::{InterferenceTracker, SignalId};
use super::signal_calculations::{END_DEVICE_SENSITIVITY, LoraTxParameters, rx_power_to_snr, sensitivity, time_on_air};
use super::trace::TraceEvent;
use super::types::{DeviceAddress, Packet, RadioId, Transmission};

/// Bytes demodulated before the destination address is known.
const ADDRESS_FILTER_BYTES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Sleep,
    Standby,
    Tx,
    Rx,
}

struct CurrentReception {
    signal: SignalId,
    incoming: IncomingSignal,
    wrong_address: bool,
}

/// Result of a reception the radio locked onto.
#[derive(Debug, Clone)]
pub enum ReceptionOutcome {
    Received { packet: Packet, rx_power_dbm: f64, snr_db: f64 },
    Failed,
}

pub struct EndDevicePhy {
    radio: RadioId,
    address: DeviceAddress,
    state: RadioState,
    tracker: InterferenceTracker,
    rx_frequency: u32,
    rx_spreading_factor: u8,
    current: Option<CurrentReception>,
    noise_figure_db: f64,
}

impl EndDevicePhy {
    pub fn new(radio: RadioId, address: DeviceAddress, tracker: InterferenceTracker, noise_figure_db: f64) -> Self {
        EndDevicePhy {
            radio,
            address,
            state: RadioState::Sleep,
            tracker,
            rx_frequency: 868_100_000,
            rx_spreading_factor: 12,
            current: None,
            noise_figure_db,
        }
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn tracker(&self) -> &InterferenceTracker {
        &self.tracker
    }

    pub fn set_rx_frequency(&mut self, frequency: u32) {
        self.rx_frequency = frequency;
    }

    pub fn set_rx_spreading_factor(&mut self, spreading_factor: u8) {
        self.rx_spreading_factor = spreading_factor;
    }

    pub fn switch_to_standby(&mut self) {
        match self.state {
            RadioState::Sleep | RadioState::Standby => self.state = RadioState::Standby,
            other => log::error!("{} cannot enter STANDBY from {:?}", self.radio, other),
        }
    }

    pub fn switch_to_sleep(&mut self) {
        match self.state {
            RadioState::Standby | RadioState::Sleep => self.state = RadioState::Sleep,
            other => log::warn!("{} cannot sleep while in {:?}", self.radio, other),
        }
    }

    /// Transmit `packet`. Only legal from STANDBY.
    pub fn send(&mut self, ctx: &mut SimContext, packet: Packet, params: LoraTxParameters, tx_power_dbm: f64, frequency: u32) -> Option<Transmission> {
        if self.state != RadioState::Standby {
            log::error!("{} asked to send packet {} while in {:?}", self.radio, packet.id, self.state);
            return None;
        }

        let duration = time_on_air(&params, packet.size());
        self.state = RadioState::Tx;
        ctx.emit(TraceEvent::StartedTransmitting {
            radio: self.radio,
            packet: packet.id,
            frequency,
            spreading_factor: params.spreading_factor,
            duration,
        });
        ctx.schedule(duration, SimEvent::TxFinished { radio: self.radio });

        Some(Transmission {
            sender: self.radio,
            packet,
            params,
            tx_power_dbm,
            frequency,
            duration,
        })
    }

    pub fn tx_finished(&mut self) {
        if self.state == RadioState::Tx {
            self.state = RadioState::Standby;
        }
    }

    pub fn start_receive(&mut self, ctx: &mut SimContext, signal: IncomingSignal) {
        let now = ctx.now();
        let packet = signal.packet.id;
        let signal_id = self.tracker.add(now, signal.duration, signal.rx_power_dbm, signal.spreading_factor(), packet, signal.frequency);

        match self.state {
            RadioState::Standby => {}
            RadioState::Tx => {
                ctx.emit(TraceEvent::LostBecauseTransmitting { radio: self.radio, packet });
                return;
            }
            RadioState::Sleep | RadioState::Rx => {
                log::trace!("{} in {:?}, ignoring packet {}", self.radio, self.state, packet);
                return;
            }
        }

        let mut can_lock = true;
        if signal.frequency != self.rx_frequency {
            ctx.emit(TraceEvent::LostWrongFrequency {
                radio: self.radio,
                packet,
                frequency: signal.frequency,
            });
            can_lock = false;
        }
        if signal.spreading_factor() != self.rx_spreading_factor {
            ctx.emit(TraceEvent::LostWrongSpreadingFactor {
                radio: self.radio,
                packet,
                spreading_factor: signal.spreading_factor(),
            });
            can_lock = false;
        }
        let above_sensitivity = sensitivity(&END_DEVICE_SENSITIVITY, signal.spreading_factor()).is_some_and(|limit| signal.rx_power_dbm >= limit);
        if !above_sensitivity {
            ctx.emit(TraceEvent::LostUnderSensitivity {
                radio: self.radio,
                packet,
                rx_power_dbm: signal.rx_power_dbm,
            });
            can_lock = false;
        }
        if !can_lock {
            return;
        }

        let wrong_address = signal.packet.address().is_some_and(|a| a != self.address);
        let hold: Duration = if wrong_address {
            time_on_air(&signal.params, ADDRESS_FILTER_BYTES).min(signal.duration)
        } else {
            signal.duration
        };

        self.state = RadioState::Rx;
        ctx.schedule(hold, SimEvent::EndReceive { receiver: self.radio, signal: signal_id });
        self.current = Some(CurrentReception {
            signal: signal_id,
            incoming: signal,
            wrong_address,
        });
    }

    pub fn end_receive(&mut self, ctx: &mut SimContext, signal: SignalId) -> Option<ReceptionOutcome> {
        let current = match self.current.take() {
            Some(c) if c.signal == signal => c,
            other => {
                self.current = other;
                log::warn!("{} ended reception of {:?} it was not locked on", self.radio, signal);
                return None;
            }
        };
        self.state = RadioState::Standby;
        let packet = current.incoming.packet.id;

        if current.wrong_address {
            ctx.emit(TraceEvent::LostWrongAddress { radio: self.radio, packet });
            return Some(ReceptionOutcome::Failed);
        }
        if let Some(destroyed_by) = self.tracker.is_destroyed_by_interference(signal) {
            ctx.emit(TraceEvent::LostInterference { radio: self.radio, packet, destroyed_by });
            return Some(ReceptionOutcome::Failed);
        }

        ctx.emit(TraceEvent::Received { radio: self.radio, packet });
        let incoming = current.incoming;
        Some(ReceptionOutcome::Received {
            snr_db: rx_power_to_snr(incoming.rx_power_dbm, incoming.params.bandwidth, self.noise_figure_db),
            rx_power_dbm: incoming.rx_power_dbm,
            packet: incoming.packet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::interference::IsolationMatrix;
    use crate::simulation::trace::Tracer;
    use crate::simulation::types::{Frame, MessageType};

    const ED: RadioId = RadioId::EndDevice(0);
    const OWN: DeviceAddress = DeviceAddress(0x11);
    const RX: u32 = 869_525_000;

    fn radio() -> EndDevicePhy {
        let mut phy = EndDevicePhy::new(ED, OWN, InterferenceTracker::new(IsolationMatrix::Goursaud), 6.0);
        phy.set_rx_frequency(RX);
        phy.set_rx_spreading_factor(12);
        phy
    }

    fn downlink(ctx: &mut SimContext, to: DeviceAddress, sf: u8, frequency: u32, rx_power_dbm: f64) -> IncomingSignal {
        let mut packet = ctx.new_packet(0);
        packet.frame = Some(Frame {
            message_type: MessageType::UnconfirmedDataDown,
            address: to,
            frame_counter: 0,
            ack: true,
            adr: false,
            adr_ack_req: false,
            port: 0,
            commands: vec![],
        });
        let params = LoraTxParameters::for_sf_bw(sf, 125_000);
        IncomingSignal {
            duration: time_on_air(&params, packet.size()),
            packet,
            rx_power_dbm,
            params,
            frequency,
        }
    }

    fn finish(ctx: &mut SimContext, phy: &mut EndDevicePhy) -> Vec<ReceptionOutcome> {
        let mut outcomes = Vec::new();
        while let Some((_, event)) = ctx.queue.pop() {
            match event {
                SimEvent::StartReceive { signal, .. } => phy.start_receive(ctx, signal),
                SimEvent::EndReceive { signal, .. } => outcomes.extend(phy.end_receive(ctx, signal)),
                SimEvent::TxFinished { .. } => phy.tx_finished(),
                _ => {}
            }
        }
        outcomes
    }

    #[test]
    fn starts_asleep_and_ignores_signals_but_tracks_them() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        assert_eq!(phy.state(), RadioState::Sleep);

        let s = downlink(&mut ctx, OWN, 12, RX, -80.0);
        phy.start_receive(&mut ctx, s);
        assert_eq!(phy.state(), RadioState::Sleep);
        assert_eq!(phy.tracker().events().len(), 1);
        assert!(finish(&mut ctx, &mut phy).is_empty());
    }

    #[test]
    fn standby_radio_receives_matching_downlink() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        phy.switch_to_standby();

        let s = downlink(&mut ctx, OWN, 12, RX, -80.0);
        phy.start_receive(&mut ctx, s);
        assert_eq!(phy.state(), RadioState::Rx);

        let outcomes = finish(&mut ctx, &mut phy);
        assert!(matches!(outcomes.as_slice(), [ReceptionOutcome::Received { .. }]));
        assert_eq!(phy.state(), RadioState::Standby);
        assert_eq!(ctx.tracer.counters().received_by_end_devices, 1);
    }

    #[test]
    fn each_failed_check_is_reported() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        phy.switch_to_standby();

        let s = downlink(&mut ctx, OWN, 12, 868_100_000, -80.0);
        phy.start_receive(&mut ctx, s);
        let s = downlink(&mut ctx, OWN, 9, RX, -80.0);
        phy.start_receive(&mut ctx, s);
        let s = downlink(&mut ctx, OWN, 7, 868_300_000, -125.0);
        phy.start_receive(&mut ctx, s);

        let counters = ctx.tracer.counters().clone();
        assert_eq!(counters.lost_wrong_frequency, 2);
        assert_eq!(counters.lost_wrong_spreading_factor, 2);
        assert_eq!(counters.lost_under_sensitivity, 1);
        assert_eq!(phy.state(), RadioState::Standby);
    }

    #[test]
    fn downlink_for_another_device_releases_the_radio_early() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        phy.switch_to_standby();

        let s = downlink(&mut ctx, DeviceAddress(0x22), 12, RX, -80.0);
        let full = s.duration;
        phy.start_receive(&mut ctx, s);
        let outcomes = finish(&mut ctx, &mut phy);

        assert!(matches!(outcomes.as_slice(), [ReceptionOutcome::Failed]));
        assert!(ctx.now() < full);
        assert_eq!(ctx.tracer.counters().lost_wrong_address, 1);
    }

    #[test]
    fn interference_destroys_a_downlink() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        phy.switch_to_standby();

        let wanted = downlink(&mut ctx, OWN, 12, RX, -80.0);
        phy.start_receive(&mut ctx, wanted);
        let other = downlink(&mut ctx, DeviceAddress(0x22), 12, RX, -80.0);
        phy.start_receive(&mut ctx, other);

        let outcomes = finish(&mut ctx, &mut phy);
        assert!(matches!(outcomes.as_slice(), [ReceptionOutcome::Failed]));
        assert_eq!(ctx.tracer.counters().lost_interference, 1);
    }

    #[test]
    fn send_requires_standby() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = radio();
        let params = LoraTxParameters::for_sf_bw(7, 125_000);

        let packet = ctx.new_packet(10);
        assert!(phy.send(&mut ctx, packet, params, 14.0, 868_100_000).is_none());

        phy.switch_to_standby();
        let packet = ctx.new_packet(10);
        let tx = phy.send(&mut ctx, packet, params, 14.0, 868_100_000).unwrap();
        assert_eq!(phy.state(), RadioState::Tx);
        assert_eq!(tx.duration, time_on_air(&params, 10));

        // Cannot sleep mid-transmission.
        phy.switch_to_sleep();
        assert_eq!(phy.state(), RadioState::Tx);

        finish(&mut ctx, &mut phy);
        assert_eq!(phy.state(), RadioState::Standby);
        assert_eq!(ctx.tracer.counters().started_transmitting, 1);
    }
}
