//! Gateway MAC: owns the gateway radio and the downlink duty-cycle state.

use std::time::Duration;

use super::events::{IncomingSignal, SimContext};
use super::gateway_phy::{GatewayPhy, ReceivedUplink};
use super::interference::SignalId;
use super::region;
use super::signal_calculations::{LoraTxParameters, time_on_air};
use super::sub_band::LogicalChannelManager;
use super::types::{Packet, Transmission};

pub struct GatewayMac {
    gateway: usize,
    phy: GatewayPhy,
    channels: LogicalChannelManager,
}

impl GatewayMac {
    pub fn new(gateway: usize, phy: GatewayPhy) -> Self {
        GatewayMac {
            gateway,
            phy,
            channels: region::channel_manager(),
        }
    }

    pub fn index(&self) -> usize {
        self.gateway
    }

    pub fn phy(&self) -> &GatewayPhy {
        &self.phy
    }

    pub fn start_receive(&mut self, ctx: &mut SimContext, signal: IncomingSignal) {
        self.phy.start_receive(ctx, signal);
    }

    /// Finish a reception and return the uplink to forward to the network server.
    ///
    /// Gateways only ever hear end devices, so every decoded frame is an uplink.
    pub fn end_receive(&mut self, ctx: &mut SimContext, signal: SignalId) -> Option<ReceivedUplink> {
        self.phy.end_receive(ctx, signal)
    }

    pub fn tx_finished(&mut self) {
        self.phy.tx_finished();
    }

    /// Time before this gateway may transmit on `frequency`.
    pub fn waiting_time(&self, now: Duration, frequency: u32) -> Duration {
        self.channels.waiting_time(now, frequency)
    }

    pub fn is_available_for(&self, now: Duration, frequency: u32) -> bool {
        !self.phy.is_transmitting() && self.waiting_time(now, frequency).is_zero()
    }

    /// Send a downlink at the sub-band's maximum power.
    pub fn send(&mut self, ctx: &mut SimContext, packet: Packet, data_rate: u8, frequency: u32) -> Option<Transmission> {
        let (Some(spreading_factor), Some(bandwidth)) = (region::spreading_factor(data_rate), region::bandwidth(data_rate)) else {
            log::error!("Gateway {} asked to send at unknown data rate {}", self.gateway, data_rate);
            return None;
        };
        let Some(tx_power_dbm) = self.channels.tx_power_for_frequency(frequency) else {
            log::error!("Gateway {} asked to send on {} Hz outside every sub-band", self.gateway, frequency);
            return None;
        };

        let params = LoraTxParameters::for_sf_bw(spreading_factor, bandwidth);
        self.channels.add_event(ctx.now(), time_on_air(&params, packet.size()), frequency);
        log::debug!("Gateway {} sends packet {} on {} Hz at DR{}", self.gateway, packet.id, frequency, data_rate);
        Some(self.phy.send(ctx, packet, params, tx_power_dbm, frequency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::interference::{InterferenceTracker, IsolationMatrix};
    use crate::simulation::trace::Tracer;
    use crate::simulation::types::{DeviceAddress, Frame, MessageType, RadioId};

    fn gateway() -> GatewayMac {
        let phy = GatewayPhy::new(RadioId::Gateway(0), 8, InterferenceTracker::new(IsolationMatrix::Goursaud), 6.0).unwrap();
        GatewayMac::new(0, phy)
    }

    fn framed(ctx: &mut SimContext, message_type: MessageType) -> Packet {
        let mut packet = ctx.new_packet(5);
        packet.frame = Some(Frame {
            message_type,
            address: DeviceAddress(7),
            frame_counter: 0,
            ack: false,
            adr: false,
            adr_ack_req: false,
            port: 1,
            commands: vec![],
        });
        packet
    }

    fn signal(packet: Packet) -> IncomingSignal {
        let params = LoraTxParameters::for_sf_bw(7, 125_000);
        IncomingSignal {
            duration: time_on_air(&params, packet.size()),
            packet,
            rx_power_dbm: -100.0,
            params,
            frequency: 868_100_000,
        }
    }

    #[test]
    fn downlink_uses_sub_band_power_and_blocks_the_band() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut gw = gateway();
        assert!(gw.is_available_for(ctx.now(), region::RX2_FREQUENCY));

        let packet = ctx.new_packet(0);
        let tx = gw.send(&mut ctx, packet, region::RX2_DATA_RATE, region::RX2_FREQUENCY).unwrap();
        assert_eq!(tx.tx_power_dbm, 27.0);
        assert_eq!(tx.params.spreading_factor, 12);
        assert!(!gw.is_available_for(ctx.now(), region::RX2_FREQUENCY));

        // 10% duty cycle: ten times the airtime, counted from the start.
        gw.tx_finished();
        let wait = gw.waiting_time(ctx.now(), region::RX2_FREQUENCY);
        assert!(wait.abs_diff(tx.duration * 10) < Duration::from_micros(1));
        assert!(gw.is_available_for(ctx.now(), 868_100_000));
    }

    #[test]
    fn unknown_frequency_or_data_rate_is_refused() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut gw = gateway();
        let packet = ctx.new_packet(0);
        assert!(gw.send(&mut ctx, packet, 0, 870_000_000).is_none());
        let packet = ctx.new_packet(0);
        assert!(gw.send(&mut ctx, packet, 9, region::RX2_FREQUENCY).is_none());
        assert!(!gw.phy().is_transmitting());
    }

    #[test]
    fn decoded_uplink_is_forwarded_with_its_radio_metadata() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut gw = gateway();

        let up = framed(&mut ctx, MessageType::ConfirmedDataUp);
        let up_id = up.id;
        let incoming = signal(up);
        let (rx_power_dbm, frequency) = (incoming.rx_power_dbm, incoming.frequency);
        gw.start_receive(&mut ctx, incoming);

        let mut forwarded = Vec::new();
        while let Some((_, event)) = ctx.queue.pop() {
            if let crate::simulation::events::SimEvent::EndReceive { signal, .. } = event {
                forwarded.extend(gw.end_receive(&mut ctx, signal));
            }
        }
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].packet.id, up_id);
        assert_eq!(forwarded[0].rx_power_dbm, rx_power_dbm);
        assert_eq!(forwarded[0].frequency, frequency);
    }
}
