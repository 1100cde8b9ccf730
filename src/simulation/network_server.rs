//! Simple network server.
//!
//! Keeps a status record per registered device, acknowledges confirmed
//! uplinks and answers link checks. A reply goes out one second after the
//! uplink through the strongest gateway that may transmit on the RX1
//! frequency; when none can, RX2 is tried one second later.

use std::collections::HashMap;
use std::time::Duration;

use super::events::{SimContext, SimEvent};
use super::gateway_mac::GatewayMac;
use super::gateway_phy::ReceivedUplink;
use super::receive_windows::{DEFAULT_RX1_DELAY, RX2_AFTER_RX1, ReceiveWindow};
use super::region;
use super::signal_calculations::calculate_snr_limit;
use super::trace::TraceEvent;
use super::types::{DeviceAddress, Frame, MacCommand, MessageType, Transmission};

/// One gateway's copy of the latest uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayReception {
    pub gateway: usize,
    pub rx_power_dbm: f64,
    pub snr_db: f64,
}

#[derive(Debug, Clone)]
struct PendingReply {
    uplink_packet: u64,
    ack: bool,
    link_check: bool,
    spreading_factor: u8,
    rx1_frequency: u32,
    rx1_data_rate: u8,
}

/// What the server knows about one end device.
#[derive(Debug, Default)]
pub struct DeviceStatus {
    last_packet: Option<u64>,
    last_reception: Duration,
    last_frame_counter: Option<u16>,
    downlink_counter: u16,
    uplinks: u64,
    /// Gateways that heard the latest uplink, strongest first.
    gateways: Vec<GatewayReception>,
    reply: Option<PendingReply>,
}

impl DeviceStatus {
    pub fn gateways(&self) -> &[GatewayReception] {
        &self.gateways
    }

    pub fn last_frame_counter(&self) -> Option<u16> {
        self.last_frame_counter
    }

    pub fn uplinks(&self) -> u64 {
        self.uplinks
    }

    pub fn has_pending_reply(&self) -> bool {
        self.reply.is_some()
    }

    fn add_gateway(&mut self, reception: GatewayReception) {
        match self.gateways.iter_mut().find(|g| g.gateway == reception.gateway) {
            Some(existing) => *existing = reception,
            None => self.gateways.push(reception),
        }
        self.gateways.sort_by(|a, b| b.rx_power_dbm.total_cmp(&a.rx_power_dbm));
    }

    fn best_snr(&self) -> Option<f64> {
        self.gateways.iter().map(|g| g.snr_db).reduce(f64::max)
    }
}

#[derive(Default)]
pub struct NetworkServer {
    devices: HashMap<DeviceAddress, DeviceStatus>,
}

impl NetworkServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, address: DeviceAddress) {
        self.devices.entry(address).or_default();
    }

    pub fn device_status(&self, address: DeviceAddress) -> Option<&DeviceStatus> {
        self.devices.get(&address)
    }

    /// Handle an uplink forwarded by `gateway`.
    ///
    /// Copies of the same packet heard within the reply delay only update the
    /// gateway list; a retransmission arrives later and is handled afresh.
    pub fn on_uplink(&mut self, ctx: &mut SimContext, gateway: usize, uplink: &ReceivedUplink) {
        let Some(frame) = uplink.packet.frame.as_ref() else {
            log::warn!("Gateway {} forwarded unframed packet {}", gateway, uplink.packet.id);
            return;
        };
        let Some(status) = self.devices.get_mut(&frame.address) else {
            log::warn!("Uplink from unknown device {}", frame.address);
            return;
        };

        let now = ctx.now();
        let reception = GatewayReception {
            gateway,
            rx_power_dbm: uplink.rx_power_dbm,
            snr_db: uplink.snr_db,
        };
        let duplicate = status.last_packet == Some(uplink.packet.id) && now.saturating_sub(status.last_reception) < DEFAULT_RX1_DELAY;
        if duplicate {
            log::trace!("Duplicate of packet {} from gateway {}", uplink.packet.id, gateway);
            status.add_gateway(reception);
            return;
        }

        status.last_packet = Some(uplink.packet.id);
        status.last_reception = now;
        status.last_frame_counter = Some(frame.frame_counter);
        status.uplinks += 1;
        status.gateways.clear();
        status.gateways.push(reception);

        let ack = frame.message_type == MessageType::ConfirmedDataUp;
        let link_check = frame.commands.contains(&MacCommand::LinkCheckReq);
        if !ack && !link_check {
            return;
        }
        if status.reply.is_some() {
            log::debug!("Device {} already has a reply pending", frame.address);
            return;
        }

        let Some(uplink_data_rate) = region::data_rate_for(uplink.params.spreading_factor, uplink.params.bandwidth) else {
            log::warn!("Uplink {} uses SF{} at {} Hz, no matching data rate", uplink.packet.id, uplink.params.spreading_factor, uplink.params.bandwidth);
            return;
        };
        status.reply = Some(PendingReply {
            uplink_packet: uplink.packet.id,
            ack,
            link_check,
            spreading_factor: uplink.params.spreading_factor,
            rx1_frequency: uplink.frequency,
            rx1_data_rate: region::rx1_data_rate(uplink_data_rate, 0),
        });
        log::debug!("Scheduling a reply for device {}", frame.address);
        ctx.schedule(
            DEFAULT_RX1_DELAY,
            SimEvent::ServerReply {
                address: frame.address,
                window: ReceiveWindow::First,
            },
        );
    }

    /// Try to send the pending reply for `address` in `window`.
    pub fn send_reply(&mut self, ctx: &mut SimContext, address: DeviceAddress, window: ReceiveWindow, gateways: &mut [GatewayMac]) -> Option<Transmission> {
        let status = self.devices.get_mut(&address)?;
        let reply = status.reply.clone()?;
        let now = ctx.now();

        let (frequency, data_rate) = match window {
            ReceiveWindow::First => (reply.rx1_frequency, reply.rx1_data_rate),
            ReceiveWindow::Second => (region::RX2_FREQUENCY, region::RX2_DATA_RATE),
        };
        let chosen = status
            .gateways
            .iter()
            .map(|g| g.gateway)
            .find(|g| gateways.get(*g).is_some_and(|gw| gw.is_available_for(now, frequency)));

        let Some(gateway) = chosen else {
            match window {
                ReceiveWindow::First => {
                    log::debug!("No gateway for device {} in RX1, trying RX2", address);
                    ctx.schedule(RX2_AFTER_RX1, SimEvent::ServerReply { address, window: ReceiveWindow::Second });
                }
                ReceiveWindow::Second => {
                    log::info!("Giving up on reply to device {}, no gateway available for RX2", address);
                    status.reply = None;
                    ctx.emit(TraceEvent::NoDownlinkGateway {
                        address,
                        packet: reply.uplink_packet,
                    });
                }
            }
            return None;
        };

        let mut commands = Vec::new();
        if reply.link_check {
            let margin = status.best_snr().map_or(0.0, |snr| snr - calculate_snr_limit(reply.spreading_factor));
            commands.push(MacCommand::LinkCheckAns {
                margin: margin.clamp(0.0, 254.0).round() as u8,
                gateway_count: status.gateways.len().min(u8::MAX as usize) as u8,
            });
        }

        let mut packet = ctx.new_packet(0);
        packet.frame = Some(Frame {
            message_type: MessageType::UnconfirmedDataDown,
            address,
            frame_counter: status.downlink_counter,
            ack: reply.ack,
            adr: false,
            adr_ack_req: false,
            port: 0,
            commands,
        });
        status.downlink_counter = status.downlink_counter.wrapping_add(1);
        status.reply = None;

        log::debug!("Replying to device {} through gateway {} in {:?}", address, gateway, window);
        gateways.get_mut(gateway)?.send(ctx, packet, data_rate, frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::gateway_phy::GatewayPhy;
    use crate::simulation::interference::{InterferenceTracker, IsolationMatrix};
    use crate::simulation::signal_calculations::LoraTxParameters;
    use crate::simulation::trace::Tracer;
    use crate::simulation::types::{Packet, RadioId};

    const DEVICE: DeviceAddress = DeviceAddress(0x42);

    fn gateways(count: usize) -> Vec<GatewayMac> {
        (0..count)
            .map(|i| {
                let phy = GatewayPhy::new(RadioId::Gateway(i), 8, InterferenceTracker::new(IsolationMatrix::Goursaud), 6.0).unwrap();
                GatewayMac::new(i, phy)
            })
            .collect()
    }

    fn uplink(ctx: &mut SimContext, message_type: MessageType, commands: Vec<MacCommand>, rx_power_dbm: f64) -> ReceivedUplink {
        let mut packet = ctx.new_packet(10);
        packet.frame = Some(Frame {
            message_type,
            address: DEVICE,
            frame_counter: 3,
            ack: false,
            adr: false,
            adr_ack_req: false,
            port: 1,
            commands,
        });
        ReceivedUplink {
            packet,
            rx_power_dbm,
            snr_db: rx_power_dbm + 174.0 - 51.0 - 6.0,
            frequency: 868_300_000,
            params: LoraTxParameters::for_sf_bw(9, 125_000),
        }
    }

    fn copy_of(uplink: &ReceivedUplink, packet: &Packet, rx_power_dbm: f64) -> ReceivedUplink {
        ReceivedUplink {
            packet: packet.clone(),
            rx_power_dbm,
            snr_db: rx_power_dbm + 174.0 - 51.0 - 6.0,
            ..uplink.clone()
        }
    }

    /// Deliver server replies until the queue is empty.
    fn run(ctx: &mut SimContext, server: &mut NetworkServer, gws: &mut [GatewayMac]) -> Vec<Transmission> {
        let mut sent = Vec::new();
        while let Some((_, event)) = ctx.queue.pop() {
            match event {
                SimEvent::ServerReply { address, window } => sent.extend(server.send_reply(ctx, address, window, gws)),
                SimEvent::TxFinished { radio: RadioId::Gateway(i) } => gws[i].tx_finished(),
                _ => {}
            }
        }
        sent
    }

    #[test]
    fn confirmed_uplink_is_acknowledged_in_rx1_by_the_strongest_gateway() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut server = NetworkServer::new();
        server.add_device(DEVICE);
        let mut gws = gateways(2);

        let first = uplink(&mut ctx, MessageType::ConfirmedDataUp, vec![], -110.0);
        server.on_uplink(&mut ctx, 0, &first);
        server.on_uplink(&mut ctx, 1, &copy_of(&first, &first.packet, -95.0));
        assert_eq!(server.device_status(DEVICE).unwrap().gateways().len(), 2);
        assert_eq!(server.device_status(DEVICE).unwrap().uplinks(), 1);

        let sent = run(&mut ctx, &mut server, &mut gws);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender, RadioId::Gateway(1));
        assert_eq!(sent[0].frequency, 868_300_000);
        assert_eq!(sent[0].params.spreading_factor, 9);
        assert_eq!(ctx.now(), DEFAULT_RX1_DELAY + sent[0].duration);
        let frame = sent[0].packet.frame.as_ref().unwrap();
        assert!(frame.ack);
        assert_eq!(frame.address, DEVICE);
        assert!(!server.device_status(DEVICE).unwrap().has_pending_reply());
    }

    #[test]
    fn unconfirmed_uplink_gets_no_reply() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut server = NetworkServer::new();
        server.add_device(DEVICE);
        let mut gws = gateways(1);

        let up = uplink(&mut ctx, MessageType::UnconfirmedDataUp, vec![], -100.0);
        server.on_uplink(&mut ctx, 0, &up);
        assert!(run(&mut ctx, &mut server, &mut gws).is_empty());
        assert_eq!(server.device_status(DEVICE).unwrap().last_frame_counter(), Some(3));
    }

    #[test]
    fn link_check_reports_margin_and_gateway_count() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut server = NetworkServer::new();
        server.add_device(DEVICE);
        let mut gws = gateways(2);

        let up = uplink(&mut ctx, MessageType::UnconfirmedDataUp, vec![MacCommand::LinkCheckReq], -120.0);
        server.on_uplink(&mut ctx, 0, &up);
        server.on_uplink(&mut ctx, 1, &copy_of(&up, &up.packet, -125.0));
        let sent = run(&mut ctx, &mut server, &mut gws);

        // Best SNR is -3 dB, SF9 needs -12.5 dB.
        let frame = sent[0].packet.frame.as_ref().unwrap();
        assert!(!frame.ack);
        assert_eq!(frame.commands, vec![MacCommand::LinkCheckAns { margin: 10, gateway_count: 2 }]);
    }

    #[test]
    fn busy_rx1_gateway_falls_back_to_rx2() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut server = NetworkServer::new();
        server.add_device(DEVICE);
        let mut gws = gateways(1);

        // A previous downlink on the same 1% sub-band keeps the gateway silent.
        let earlier = ctx.new_packet(40);
        gws[0].send(&mut ctx, earlier, 0, 868_100_000).unwrap();
        gws[0].tx_finished();

        let up = uplink(&mut ctx, MessageType::ConfirmedDataUp, vec![], -100.0);
        server.on_uplink(&mut ctx, 0, &up);
        let sent = run(&mut ctx, &mut server, &mut gws);

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frequency, region::RX2_FREQUENCY);
        assert_eq!(sent[0].params.spreading_factor, 12);
    }

    #[test]
    fn no_gateway_in_either_window_is_reported() {
        let mut ctx = SimContext::new(1, Tracer::recording());
        let mut server = NetworkServer::new();
        server.add_device(DEVICE);
        let mut gws = gateways(1);

        let up = uplink(&mut ctx, MessageType::ConfirmedDataUp, vec![], -100.0);
        server.on_uplink(&mut ctx, 0, &up);
        // The only gateway that heard the uplink does not exist on the server side.
        let sent = run(&mut ctx, &mut server, &mut gws[..0]);

        assert!(sent.is_empty());
        assert_eq!(ctx.tracer.counters().no_downlink_gateway, 1);
        assert_eq!(ctx.now(), DEFAULT_RX1_DELAY + RX2_AFTER_RX1);
    }

    #[test]
    fn uplinks_from_unknown_devices_are_ignored() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut server = NetworkServer::new();
        let up = uplink(&mut ctx, MessageType::ConfirmedDataUp, vec![], -100.0);
        server.on_uplink(&mut ctx, 0, &up);
        assert!(ctx.queue.pop().is_none());
        assert!(server.device_status(DEVICE).is_none());
    }
}
