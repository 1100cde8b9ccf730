//! Gateway radio with a pool of parallel reception paths.
//!
//! A gateway can demodulate several packets at once, one per reception path.
//! Paths are searched in insertion order; a path is locked when a signal
//! clears the sensitivity check and freed when that reception ends. While the
//! gateway transmits it hears nothing, and starting a transmission aborts
//! every reception in progress.

use std::time::Duration;

use super::events::{IncomingSignal, SimContext, SimEvent};
use super::interference::{InterferenceTracker, SignalId};
use super::scheduler::EventId;
use super::signal_calculations::{GATEWAY_SENSITIVITY, LoraTxParameters, rx_power_to_snr, sensitivity, time_on_air};
use super::trace::TraceEvent;
use super::types::{Packet, RadioId, Transmission};

/// Number of reception paths of a typical 8-channel gateway.
pub const DEFAULT_RECEPTION_PATHS: usize = 8;

struct LockedReception {
    signal: SignalId,
    end_event: EventId,
    incoming: IncomingSignal,
}

/// One demodulator slot.
#[derive(Default)]
pub struct ReceptionPath {
    locked: Option<LockedReception>,
}

impl ReceptionPath {
    pub fn is_available(&self) -> bool {
        self.locked.is_none()
    }

    pub fn locked_signal(&self) -> Option<SignalId> {
        self.locked.as_ref().map(|l| l.signal)
    }
}

/// An uplink the gateway demodulated successfully.
#[derive(Debug, Clone)]
pub struct ReceivedUplink {
    pub packet: Packet,
    pub rx_power_dbm: f64,
    pub snr_db: f64,
    pub frequency: u32,
    pub params: LoraTxParameters,
}

pub struct GatewayPhy {
    radio: RadioId,
    paths: Vec<ReceptionPath>,
    occupied: usize,
    transmitting: bool,
    tracker: InterferenceTracker,
    noise_figure_db: f64,
}

impl GatewayPhy {
    /// Build a gateway radio with `reception_paths` demodulators.
    ///
    /// A gateway without reception paths can never receive, so zero is rejected.
    pub fn new(radio: RadioId, reception_paths: usize, tracker: InterferenceTracker, noise_figure_db: f64) -> Result<Self, String> {
        if reception_paths == 0 {
            return Err(format!("Gateway {} must have at least one reception path", radio));
        }
        let paths = (0..reception_paths).map(|_| ReceptionPath::default()).collect();
        Ok(GatewayPhy {
            radio,
            paths,
            occupied: 0,
            transmitting: false,
            tracker,
            noise_figure_db,
        })
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn occupied_paths(&self) -> usize {
        self.occupied
    }

    pub fn reception_paths(&self) -> &[ReceptionPath] {
        &self.paths
    }

    pub fn tracker(&self) -> &InterferenceTracker {
        &self.tracker
    }

    pub fn start_receive(&mut self, ctx: &mut SimContext, signal: IncomingSignal) {
        let packet = signal.packet.id;

        if self.transmitting {
            log::debug!("{} is transmitting, dropping packet {}", self.radio, packet);
            ctx.emit(TraceEvent::LostBecauseTransmitting { radio: self.radio, packet });
            return;
        }

        let now = ctx.now();
        let signal_id = self.tracker.add(now, signal.duration, signal.rx_power_dbm, signal.spreading_factor(), packet, signal.frequency);

        let Some(path_index) = self.paths.iter().position(ReceptionPath::is_available) else {
            log::debug!("{} has no free reception path for packet {}", self.radio, packet);
            ctx.emit(TraceEvent::LostNoMoreDemodulators { radio: self.radio, packet });
            return;
        };

        let above_sensitivity = sensitivity(&GATEWAY_SENSITIVITY, signal.spreading_factor()).is_some_and(|limit| signal.rx_power_dbm >= limit);
        if !above_sensitivity {
            ctx.emit(TraceEvent::LostUnderSensitivity {
                radio: self.radio,
                packet,
                rx_power_dbm: signal.rx_power_dbm,
            });
            return;
        }

        let end_event = ctx.schedule(signal.duration, SimEvent::EndReceive { receiver: self.radio, signal: signal_id });
        self.paths[path_index].locked = Some(LockedReception {
            signal: signal_id,
            end_event,
            incoming: signal,
        });
        self.occupied += 1;
        ctx.emit(TraceEvent::ReceptionPathsOccupied { radio: self.radio, occupied: self.occupied });
    }

    /// Finish the reception locked on `signal` and free its path.
    pub fn end_receive(&mut self, ctx: &mut SimContext, signal: SignalId) -> Option<ReceivedUplink> {
        let Some(path) = self.paths.iter_mut().find(|p| p.locked_signal() == Some(signal)) else {
            log::warn!("{} ended reception of {:?} without a locked path", self.radio, signal);
            return None;
        };
        let locked = path.locked.take()?;
        self.occupied -= 1;
        ctx.emit(TraceEvent::ReceptionPathsOccupied { radio: self.radio, occupied: self.occupied });

        let incoming = locked.incoming;
        let packet = incoming.packet.id;
        if let Some(destroyed_by) = self.tracker.is_destroyed_by_interference(signal) {
            ctx.emit(TraceEvent::LostInterference { radio: self.radio, packet, destroyed_by });
            return None;
        }

        ctx.emit(TraceEvent::Received { radio: self.radio, packet });
        Some(ReceivedUplink {
            snr_db: rx_power_to_snr(incoming.rx_power_dbm, incoming.params.bandwidth, self.noise_figure_db),
            rx_power_dbm: incoming.rx_power_dbm,
            frequency: incoming.frequency,
            params: incoming.params,
            packet: incoming.packet,
        })
    }

    /// Start a downlink transmission, aborting every reception in progress.
    pub fn send(&mut self, ctx: &mut SimContext, packet: Packet, params: LoraTxParameters, tx_power_dbm: f64, frequency: u32) -> Transmission {
        let mut interrupted = 0;
        for path in self.paths.iter_mut() {
            if let Some(locked) = path.locked.take() {
                ctx.queue.cancel(locked.end_event);
                ctx.emit(TraceEvent::LostBecauseTransmitting {
                    radio: self.radio,
                    packet: locked.incoming.packet.id,
                });
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            self.occupied = 0;
            ctx.emit(TraceEvent::ReceptionPathsOccupied { radio: self.radio, occupied: 0 });
        }

        let duration: Duration = time_on_air(&params, packet.size());
        self.transmitting = true;
        ctx.emit(TraceEvent::StartedTransmitting {
            radio: self.radio,
            packet: packet.id,
            frequency,
            spreading_factor: params.spreading_factor,
            duration,
        });
        ctx.schedule(duration, SimEvent::TxFinished { radio: self.radio });

        Transmission {
            sender: self.radio,
            packet,
            params,
            tx_power_dbm,
            frequency,
            duration,
        }
    }

    pub fn tx_finished(&mut self) {
        self.transmitting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::interference::IsolationMatrix;
    use crate::simulation::trace::Tracer;

    const GW: RadioId = RadioId::Gateway(0);
    const FREQUENCIES: [u32; 4] = [868_100_000, 868_300_000, 868_500_000, 867_100_000];

    fn gateway(paths: usize) -> GatewayPhy {
        GatewayPhy::new(GW, paths, InterferenceTracker::new(IsolationMatrix::Goursaud), 6.0).unwrap()
    }

    fn signal(ctx: &mut SimContext, sf: u8, frequency: u32, rx_power_dbm: f64, duration: f64) -> IncomingSignal {
        IncomingSignal {
            packet: ctx.new_packet(10),
            rx_power_dbm,
            params: LoraTxParameters::for_sf_bw(sf, 125_000),
            duration: Duration::from_secs_f64(duration),
            frequency,
        }
    }

    fn arrive_at(ctx: &mut SimContext, at: Duration, signal: IncomingSignal) {
        ctx.queue.schedule_at(at, SimEvent::StartReceive { receiver: GW, signal });
    }

    /// Run the queue, dispatching only the gateway's own events.
    fn run(ctx: &mut SimContext, phy: &mut GatewayPhy) -> Vec<ReceivedUplink> {
        let mut received = Vec::new();
        while let Some((_, event)) = ctx.queue.pop() {
            match event {
                SimEvent::StartReceive { signal, .. } => phy.start_receive(ctx, signal),
                SimEvent::EndReceive { signal, .. } => received.extend(phy.end_receive(ctx, signal)),
                SimEvent::TxFinished { .. } => phy.tx_finished(),
                _ => {}
            }
        }
        received
    }

    #[test]
    fn zero_reception_paths_is_a_construction_error() {
        assert!(GatewayPhy::new(GW, 0, InterferenceTracker::new(IsolationMatrix::Goursaud), 6.0).is_err());
    }

    #[test]
    fn packets_at_different_times_are_all_received() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(8);
        for (i, sf) in (7..=12).enumerate() {
            let s = signal(&mut ctx, sf, FREQUENCIES[0], -60.0, 1.0);
            arrive_at(&mut ctx, Duration::from_secs(2 * i as u64), s);
        }
        let received = run(&mut ctx, &mut phy);
        assert_eq!(received.len(), 6);
        assert_eq!(ctx.tracer.counters().received_by_gateways, 6);
        assert_eq!(phy.occupied_paths(), 0);
    }

    #[test]
    fn concurrent_same_sf_packets_destroy_each_other() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(8);
        for _ in 0..2 {
            let s = signal(&mut ctx, 7, FREQUENCIES[0], -60.0, 1.0);
            arrive_at(&mut ctx, Duration::from_secs(1), s);
        }
        assert!(run(&mut ctx, &mut phy).is_empty());
        assert_eq!(ctx.tracer.counters().lost_interference, 2);
    }

    #[test]
    fn one_path_per_packet_until_the_pool_is_exhausted() {
        let mut ctx = SimContext::new(1, Tracer::recording());
        let mut phy = gateway(6);
        for frequency in &FREQUENCIES[..3] {
            for sf in [7, 8] {
                let s = signal(&mut ctx, sf, *frequency, -60.0, 1.0);
                arrive_at(&mut ctx, Duration::from_secs(1), s);
            }
        }
        let extra = signal(&mut ctx, 9, FREQUENCIES[3], -60.0, 1.0);
        arrive_at(&mut ctx, Duration::from_secs(1), extra);

        let received = run(&mut ctx, &mut phy);
        assert_eq!(received.len(), 6);
        assert_eq!(ctx.tracer.counters().lost_no_more_demodulators, 1);

        let peak = ctx
            .tracer
            .records()
            .iter()
            .filter_map(|r| match r.event {
                TraceEvent::ReceptionPathsOccupied { occupied, .. } => Some(occupied),
                _ => None,
            })
            .max();
        assert_eq!(peak, Some(6));
    }

    #[test]
    fn path_is_busy_for_exactly_the_reception_time() {
        let one_ns = Duration::from_nanos(1);
        let end = Duration::from_secs(6);

        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(1);
        let first = signal(&mut ctx, 7, FREQUENCIES[0], -60.0, 4.0);
        arrive_at(&mut ctx, Duration::from_secs(2), first);
        let early = signal(&mut ctx, 7, FREQUENCIES[1], -60.0, 1.0);
        arrive_at(&mut ctx, end - one_ns, early);
        run(&mut ctx, &mut phy);
        assert_eq!(ctx.tracer.counters().received_by_gateways, 1);
        assert_eq!(ctx.tracer.counters().lost_no_more_demodulators, 1);

        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(1);
        let first = signal(&mut ctx, 7, FREQUENCIES[0], -60.0, 4.0);
        arrive_at(&mut ctx, Duration::from_secs(2), first);
        let late = signal(&mut ctx, 7, FREQUENCIES[1], -60.0, 1.0);
        arrive_at(&mut ctx, end + one_ns, late);
        run(&mut ctx, &mut phy);
        assert_eq!(ctx.tracer.counters().received_by_gateways, 2);
        assert_eq!(ctx.tracer.counters().lost_no_more_demodulators, 0);
    }

    #[test]
    fn under_sensitivity_does_not_consume_a_path() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(1);
        let weak = signal(&mut ctx, 7, FREQUENCIES[0], -127.0, 1.0);
        arrive_at(&mut ctx, Duration::from_secs(1), weak);
        let strong = signal(&mut ctx, 12, FREQUENCIES[1], -139.0, 1.0);
        arrive_at(&mut ctx, Duration::from_secs(1), strong);

        let received = run(&mut ctx, &mut phy);
        assert_eq!(received.len(), 1);
        assert_eq!(ctx.tracer.counters().lost_under_sensitivity, 1);
        assert_eq!(ctx.tracer.counters().lost_no_more_demodulators, 0);
    }

    #[test]
    fn received_uplink_carries_power_and_snr() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(1);
        let s = signal(&mut ctx, 7, FREQUENCIES[0], -100.0, 1.0);
        arrive_at(&mut ctx, Duration::ZERO, s);
        let received = run(&mut ctx, &mut phy);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].rx_power_dbm, -100.0);
        assert!((received[0].snr_db - 17.031).abs() < 1e-3);
    }

    #[test]
    fn transmitting_interrupts_and_blocks_reception() {
        let mut ctx = SimContext::new(1, Tracer::new());
        let mut phy = gateway(8);
        for frequency in &FREQUENCIES[..2] {
            let s = signal(&mut ctx, 7, *frequency, -60.0, 2.0);
            arrive_at(&mut ctx, Duration::ZERO, s);
        }
        // Deliver the two arrivals, then transmit while both are in progress.
        for _ in 0..2 {
            if let Some((_, SimEvent::StartReceive { signal, .. })) = ctx.queue.pop() {
                phy.start_receive(&mut ctx, signal);
            }
        }
        assert_eq!(phy.occupied_paths(), 2);

        let reply = ctx.new_packet(0);
        let tx = phy.send(&mut ctx, reply, LoraTxParameters::for_sf_bw(12, 125_000), 27.0, 869_525_000);
        assert!(phy.is_transmitting());
        assert_eq!(phy.occupied_paths(), 0);
        assert_eq!(tx.sender, GW);

        let during = signal(&mut ctx, 7, FREQUENCIES[0], -60.0, 0.1);
        phy.start_receive(&mut ctx, during);
        let tracked = phy.tracker().events().len();

        let received = run(&mut ctx, &mut phy);
        assert!(received.is_empty());
        assert!(!phy.is_transmitting());
        assert_eq!(ctx.tracer.counters().lost_because_transmitting, 3);
        assert_eq!(ctx.tracer.counters().received_by_gateways, 0);
        assert_eq!(tracked, 2);
    }
}
