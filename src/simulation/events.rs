//! Scheduled simulation events and the shared context every component
//! receives while handling one.

use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::interference::SignalId;
use super::receive_windows::ReceiveWindow;
use super::scheduler::{EventId, EventQueue};
use super::signal_calculations::LoraTxParameters;
use super::trace::{TraceEvent, Tracer};
use super::types::{DeviceAddress, Packet, RadioId};

/// A signal arriving at one receiver, after propagation.
#[derive(Debug, Clone)]
pub struct IncomingSignal {
    pub packet: Packet,
    pub rx_power_dbm: f64,
    pub params: LoraTxParameters,
    pub duration: Duration,
    pub frequency: u32,
}

impl IncomingSignal {
    pub fn spreading_factor(&self) -> u8 {
        self.params.spreading_factor
    }
}

pub enum SimEvent {
    /// First symbol of a signal reaches `receiver`.
    StartReceive { receiver: RadioId, signal: IncomingSignal },
    /// A locked reception on `receiver` completes.
    EndReceive { receiver: RadioId, signal: SignalId },
    TxFinished { radio: RadioId },
    /// A postponed send or a retransmission of `packet`.
    MacSend { device: usize, packet: Packet },
    OpenWindow { device: usize, window: ReceiveWindow },
    CloseWindow { device: usize, window: ReceiveWindow },
    /// The network server tries to answer `address` in `window`.
    ServerReply { address: DeviceAddress, window: ReceiveWindow },
    /// The application of `device` produces a new packet.
    AppSend { device: usize },
}

/// State shared by every component: the clock, the tracer and the random source.
pub struct SimContext {
    pub queue: EventQueue<SimEvent>,
    pub tracer: Tracer,
    pub rng: StdRng,
    next_packet_id: u64,
}

impl SimContext {
    pub fn new(seed: u64, tracer: Tracer) -> Self {
        SimContext {
            queue: EventQueue::new(),
            tracer,
            rng: StdRng::seed_from_u64(seed),
            next_packet_id: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    pub fn schedule(&mut self, delay: Duration, event: SimEvent) -> EventId {
        self.queue.schedule(delay, event)
    }

    pub fn emit(&mut self, event: TraceEvent) {
        let now = self.queue.now();
        self.tracer.emit(now, event);
    }

    /// A fresh, unframed packet with a unique id.
    pub fn new_packet(&mut self, payload_len: usize) -> Packet {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        Packet::new(id, payload_len)
    }
}
