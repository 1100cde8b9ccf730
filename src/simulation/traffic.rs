//! Periodic application traffic.

use std::time::Duration;

use rand::Rng;

use super::events::{SimContext, SimEvent};
use super::scheduler::EventId;
use super::types::Packet;

/// Produces a packet of `payload_size` bytes every `period`.
#[derive(Debug, Clone)]
pub struct PeriodicSender {
    device: usize,
    period: Duration,
    payload_size: usize,
    start_offset: Option<Duration>,
    packets_sent: u64,
}

impl PeriodicSender {
    pub fn new(device: usize, period: Duration, payload_size: usize, start_offset: Option<Duration>) -> Result<Self, String> {
        if period.is_zero() {
            return Err(format!("Device {} has a zero traffic period", device));
        }
        Ok(PeriodicSender {
            device,
            period,
            payload_size,
            start_offset,
            packets_sent: 0,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Schedule the first send at the configured offset, or at a random
    /// point within the first period.
    pub fn start(&self, ctx: &mut SimContext) -> EventId {
        let offset = match self.start_offset {
            Some(offset) => offset,
            None => Duration::from_secs_f64(ctx.rng.gen_range(0.0..self.period.as_secs_f64())),
        };
        log::debug!("Device {} starts sending at {:?}", self.device, offset);
        ctx.schedule(offset, SimEvent::AppSend { device: self.device })
    }

    /// Create the next application packet and schedule the one after it.
    pub fn next_packet(&mut self, ctx: &mut SimContext) -> Packet {
        ctx.schedule(self.period, SimEvent::AppSend { device: self.device });
        self.packets_sent += 1;
        ctx.new_packet(self.payload_size)
    }
}
