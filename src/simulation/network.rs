//! Simulation world.
//!
//! Owns every node, the shared radio channel and the network server, and
//! drives the timeline: each step pops the earliest event, hands it to the
//! component it concerns, and fans any resulting transmission out through
//! the propagation channel.

use std::time::Duration;

use serde::Serialize;

use crate::common::config::SimulatorConfig;
use crate::common::scene::Scene;

use super::end_device_mac::{DeviceProfile, EndDeviceMac};
use super::end_device_phy::EndDevicePhy;
use super::events::{SimContext, SimEvent};
use super::gateway_mac::GatewayMac;
use super::gateway_phy::GatewayPhy;
use super::interference::InterferenceTracker;
use super::network_server::NetworkServer;
use super::propagation::PropagationChannel;
use super::trace::{LogTraceSink, TraceCounters, Tracer};
use super::traffic::PeriodicSender;
use super::types::{DeviceAddress, Packet, RadioId, Transmission};

/// An end device: radio, Class A MAC and optional application traffic.
pub struct EndDevice {
    id: u32,
    pub phy: EndDevicePhy,
    pub mac: EndDeviceMac,
    pub traffic: Option<PeriodicSender>,
}

impl EndDevice {
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Aggregate results of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub simulated_seconds: f64,
    pub events_processed: u64,
    pub gateways: usize,
    pub end_devices: usize,
    pub counters: TraceCounters,
    /// Acknowledged share of the confirmed packets whose delivery concluded.
    pub delivery_ratio: Option<f64>,
}

pub struct Simulation {
    ctx: SimContext,
    channel: PropagationChannel,
    gateways: Vec<GatewayMac>,
    end_devices: Vec<EndDevice>,
    server: NetworkServer,
    events_processed: u64,
}

impl Simulation {
    /// Build the world described by `scene` and start every traffic generator.
    pub fn from_scene(scene: &Scene, config: &SimulatorConfig) -> Result<Self, String> {
        config.validate()?;

        let mut tracer = if config.record_trace { Tracer::recording() } else { Tracer::new() };
        tracer.add_sink(Box::new(LogTraceSink));
        let mut ctx = SimContext::new(config.seed, tracer);
        let mut channel = PropagationChannel::new(scene.path_loss_parameters.clone());
        let tracker = || InterferenceTracker::with_retention(config.isolation_matrix, config.event_retention(), config.event_prune_threshold);

        let mut gateways = Vec::with_capacity(scene.gateways.len());
        for (index, gateway) in scene.gateways.iter().enumerate() {
            let radio = channel.add_gateway(gateway.position);
            let phy = GatewayPhy::new(radio, config.reception_paths, tracker(), config.noise_figure_db)?;
            gateways.push(GatewayMac::new(index, phy));
            log::debug!("Gateway {} registered as {}", gateway.id, radio);
        }

        let mut server = NetworkServer::new();
        let mut end_devices = Vec::with_capacity(scene.end_devices.len());
        for (index, device) in scene.end_devices.iter().enumerate() {
            let radio = channel.add_end_device(device.position);
            let address = DeviceAddress(device.id);
            let profile = DeviceProfile {
                address,
                data_rate: device.data_rate,
                tx_power_dbm: device.tx_power,
                confirmed: device.confirmed,
                max_transmissions: device.max_transmissions,
                adr: device.adr,
            };
            let mac = EndDeviceMac::new(index, &profile, config.mac_settings())?;
            let phy = EndDevicePhy::new(radio, address, tracker(), config.noise_figure_db);
            let traffic = match &device.traffic {
                Some(t) => Some(PeriodicSender::new(
                    index,
                    Duration::from_secs_f64(t.period),
                    t.payload_size,
                    t.start_offset.map(Duration::from_secs_f64),
                )?),
                None => None,
            };
            if let Some(traffic) = &traffic {
                traffic.start(&mut ctx);
            }
            server.add_device(address);
            end_devices.push(EndDevice { id: device.id, phy, mac, traffic });
        }

        log::info!("Simulation built with {} gateways and {} end devices", gateways.len(), end_devices.len());
        Ok(Simulation {
            ctx,
            channel,
            gateways,
            end_devices,
            server,
            events_processed: 0,
        })
    }

    pub fn now(&self) -> Duration {
        self.ctx.now()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.ctx.tracer
    }

    pub fn end_device(&self, index: usize) -> Option<&EndDevice> {
        self.end_devices.get(index)
    }

    pub fn gateway(&self, index: usize) -> Option<&GatewayMac> {
        self.gateways.get(index)
    }

    pub fn server(&self) -> &NetworkServer {
        &self.server
    }

    /// Hand an application packet to end device `index` right now.
    pub fn send_packet(&mut self, index: usize, payload_len: usize) -> Option<u64> {
        let packet = self.ctx.new_packet(payload_len);
        let id = packet.id;
        self.mac_send(index, packet);
        self.end_devices.get(index).map(|_| id)
    }

    /// Process the earliest pending event. Returns `false` when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((_, event)) = self.ctx.queue.pop() else {
            return false;
        };
        self.events_processed += 1;
        self.dispatch(event);
        true
    }

    /// Process every event up to and including `until`, then move the clock there.
    pub fn run_until(&mut self, until: Duration) -> u64 {
        let start = self.events_processed;
        while self.ctx.queue.peek_time().is_some_and(|t| t <= until) {
            self.step();
        }
        self.ctx.queue.advance_to(until);
        let processed = self.events_processed - start;
        log::info!("Reached {:.3} s after {} events", until.as_secs_f64(), processed);
        processed
    }

    pub fn summary(&self) -> SimulationSummary {
        let counters = self.ctx.tracer.counters().clone();
        let concluded = counters.deliveries_succeeded + counters.deliveries_failed;
        SimulationSummary {
            simulated_seconds: self.now().as_secs_f64(),
            events_processed: self.events_processed,
            gateways: self.gateways.len(),
            end_devices: self.end_devices.len(),
            delivery_ratio: (concluded > 0).then(|| counters.deliveries_succeeded as f64 / concluded as f64),
            counters,
        }
    }

    fn dispatch(&mut self, event: SimEvent) {
        match event {
            SimEvent::StartReceive { receiver, signal } => match receiver {
                RadioId::Gateway(i) => {
                    if let Some(gateway) = self.gateways.get_mut(i) {
                        gateway.start_receive(&mut self.ctx, signal);
                    }
                }
                RadioId::EndDevice(i) => {
                    if let Some(device) = self.end_devices.get_mut(i) {
                        device.phy.start_receive(&mut self.ctx, signal);
                    }
                }
            },
            SimEvent::EndReceive { receiver, signal } => match receiver {
                RadioId::Gateway(i) => {
                    let uplink = self.gateways.get_mut(i).and_then(|g| g.end_receive(&mut self.ctx, signal));
                    if let Some(uplink) = uplink {
                        self.server.on_uplink(&mut self.ctx, i, &uplink);
                    }
                }
                RadioId::EndDevice(i) => {
                    if let Some(device) = self.end_devices.get_mut(i) {
                        if let Some(outcome) = device.phy.end_receive(&mut self.ctx, signal) {
                            device.mac.reception_outcome(&mut self.ctx, &mut device.phy, outcome);
                        }
                    }
                }
            },
            SimEvent::TxFinished { radio } => match radio {
                RadioId::Gateway(i) => {
                    if let Some(gateway) = self.gateways.get_mut(i) {
                        gateway.tx_finished();
                    }
                }
                RadioId::EndDevice(i) => {
                    if let Some(device) = self.end_devices.get_mut(i) {
                        device.phy.tx_finished();
                        device.mac.tx_finished(&mut self.ctx, &mut device.phy);
                    }
                }
            },
            SimEvent::MacSend { device, packet } => self.mac_send(device, packet),
            SimEvent::OpenWindow { device, window } => {
                if let Some(d) = self.end_devices.get_mut(device) {
                    d.mac.open_window(&mut self.ctx, &mut d.phy, window);
                }
            }
            SimEvent::CloseWindow { device, window } => {
                if let Some(d) = self.end_devices.get_mut(device) {
                    d.mac.close_window(&mut self.ctx, &mut d.phy, window);
                }
            }
            SimEvent::ServerReply { address, window } => {
                if let Some(tx) = self.server.send_reply(&mut self.ctx, address, window, &mut self.gateways) {
                    self.transmit(&tx);
                }
            }
            SimEvent::AppSend { device } => {
                let packet = self
                    .end_devices
                    .get_mut(device)
                    .and_then(|d| d.traffic.as_mut())
                    .map(|t| t.next_packet(&mut self.ctx));
                if let Some(packet) = packet {
                    self.mac_send(device, packet);
                }
            }
        }
    }

    fn mac_send(&mut self, index: usize, packet: Packet) {
        let Some(device) = self.end_devices.get_mut(index) else {
            log::warn!("Send for unknown end device {}", index);
            return;
        };
        if let Some(tx) = device.mac.send(&mut self.ctx, &mut device.phy, packet) {
            self.transmit(&tx);
        }
    }

    fn transmit(&mut self, tx: &Transmission) {
        let reached = self.channel.deliver(&mut self.ctx, tx);
        log::trace!("{} packet {} reaches {} receivers", tx.sender, tx.packet.id, reached);
    }
}
