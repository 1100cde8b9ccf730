//! Trace notifications published by the simulation core.
//!
//! Components report every terminal outcome (a reception, a loss, a postponed
//! send, a delivery result) as a [`TraceEvent`]. The [`Tracer`] counts them,
//! optionally keeps the full history and forwards each one to registered
//! [`TraceSink`]s. Sinks only observe: nothing they do flows back into the core.

use std::time::Duration;

use serde::Serialize;

use super::types::{DeviceAddress, RadioId};

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    StartedTransmitting { radio: RadioId, packet: u64, frequency: u32, spreading_factor: u8, duration: Duration },
    Received { radio: RadioId, packet: u64 },
    LostUnderSensitivity { radio: RadioId, packet: u64, rx_power_dbm: f64 },
    LostNoMoreDemodulators { radio: RadioId, packet: u64 },
    LostInterference { radio: RadioId, packet: u64, destroyed_by: u8 },
    LostBecauseTransmitting { radio: RadioId, packet: u64 },
    LostWrongFrequency { radio: RadioId, packet: u64, frequency: u32 },
    LostWrongSpreadingFactor { radio: RadioId, packet: u64, spreading_factor: u8 },
    /// A downlink preamble addressed to another device.
    LostWrongAddress { radio: RadioId, packet: u64 },
    ReceptionPathsOccupied { radio: RadioId, occupied: usize },
    CannotSendDutyCycle { radio: RadioId, packet: u64, delay: Duration },
    SentNewPacket { radio: RadioId, packet: u64 },
    DeliverySucceeded { radio: RadioId, packet: u64, transmissions: u8, max_transmissions: u8, first_attempt: Duration },
    DeliveryFailed { radio: RadioId, packet: u64, transmissions: u8, max_transmissions: u8, first_attempt: Duration },
    /// The network server found no gateway able to send a reply.
    NoDownlinkGateway { address: DeviceAddress, packet: u64 },
}

/// Aggregate counts of every trace event kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceCounters {
    pub started_transmitting: u64,
    pub received_by_gateways: u64,
    pub received_by_end_devices: u64,
    pub lost_under_sensitivity: u64,
    pub lost_no_more_demodulators: u64,
    pub lost_interference: u64,
    pub lost_because_transmitting: u64,
    pub lost_wrong_frequency: u64,
    pub lost_wrong_spreading_factor: u64,
    pub lost_wrong_address: u64,
    pub cannot_send_duty_cycle: u64,
    pub sent_new_packets: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub no_downlink_gateway: u64,
}

impl TraceCounters {
    fn record(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::StartedTransmitting { .. } => self.started_transmitting += 1,
            TraceEvent::Received { radio: RadioId::Gateway(_), .. } => self.received_by_gateways += 1,
            TraceEvent::Received { radio: RadioId::EndDevice(_), .. } => self.received_by_end_devices += 1,
            TraceEvent::LostUnderSensitivity { .. } => self.lost_under_sensitivity += 1,
            TraceEvent::LostNoMoreDemodulators { .. } => self.lost_no_more_demodulators += 1,
            TraceEvent::LostInterference { .. } => self.lost_interference += 1,
            TraceEvent::LostBecauseTransmitting { .. } => self.lost_because_transmitting += 1,
            TraceEvent::LostWrongFrequency { .. } => self.lost_wrong_frequency += 1,
            TraceEvent::LostWrongSpreadingFactor { .. } => self.lost_wrong_spreading_factor += 1,
            TraceEvent::LostWrongAddress { .. } => self.lost_wrong_address += 1,
            TraceEvent::ReceptionPathsOccupied { .. } => {}
            TraceEvent::CannotSendDutyCycle { .. } => self.cannot_send_duty_cycle += 1,
            TraceEvent::SentNewPacket { .. } => self.sent_new_packets += 1,
            TraceEvent::DeliverySucceeded { .. } => self.deliveries_succeeded += 1,
            TraceEvent::DeliveryFailed { .. } => self.deliveries_failed += 1,
            TraceEvent::NoDownlinkGateway { .. } => self.no_downlink_gateway += 1,
        }
    }
}

/// Observer of trace events.
pub trait TraceSink {
    fn on_event(&mut self, time: Duration, event: &TraceEvent);
}

/// Mirrors every trace event to the `log` facade at debug level.
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn on_event(&mut self, time: Duration, event: &TraceEvent) {
        log::debug!("[{:>12.6}s] {:?}", time.as_secs_f64(), event);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub time: Duration,
    pub event: TraceEvent,
}

#[derive(Default)]
pub struct Tracer {
    counters: TraceCounters,
    recorded: Option<Vec<TraceRecord>>,
    sinks: Vec<Box<dyn TraceSink>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracer that also keeps every event in memory.
    pub fn recording() -> Self {
        Tracer {
            recorded: Some(Vec::new()),
            ..Default::default()
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&mut self, time: Duration, event: TraceEvent) {
        self.counters.record(&event);
        for sink in self.sinks.iter_mut() {
            sink.on_event(time, &event);
        }
        if let Some(records) = self.recorded.as_mut() {
            records.push(TraceRecord { time, event });
        }
    }

    pub fn counters(&self) -> &TraceCounters {
        &self.counters
    }

    /// Recorded history, empty unless created with [`Tracer::recording`].
    pub fn records(&self) -> &[TraceRecord] {
        self.recorded.as_deref().unwrap_or(&[])
    }
}
