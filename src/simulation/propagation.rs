//! Shared radio medium.
//!
//! Uplinks from end devices reach every gateway and downlinks from gateways
//! reach every end device. For each receiver the channel samples the path
//! loss, derives the propagation delay from the distance, and schedules a
//! `StartReceive` at `now + delay`.

use std::time::Duration;

use serde::Deserialize;

use super::events::{IncomingSignal, SimContext, SimEvent};
use super::signal_calculations::{PathLossParameters, SPEED_OF_LIGHT, calculate_path_loss};
use super::types::{RadioId, Transmission};

/// Position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

pub struct PropagationChannel {
    path_loss: PathLossParameters,
    end_devices: Vec<Position>,
    gateways: Vec<Position>,
}

impl PropagationChannel {
    pub fn new(path_loss: PathLossParameters) -> Self {
        PropagationChannel {
            path_loss,
            end_devices: Vec::new(),
            gateways: Vec::new(),
        }
    }

    /// Register an end-device radio and return its id.
    pub fn add_end_device(&mut self, position: Position) -> RadioId {
        self.end_devices.push(position);
        RadioId::EndDevice(self.end_devices.len() - 1)
    }

    /// Register a gateway radio and return its id.
    pub fn add_gateway(&mut self, position: Position) -> RadioId {
        self.gateways.push(position);
        RadioId::Gateway(self.gateways.len() - 1)
    }

    pub fn position(&self, radio: RadioId) -> Option<Position> {
        match radio {
            RadioId::EndDevice(i) => self.end_devices.get(i).copied(),
            RadioId::Gateway(i) => self.gateways.get(i).copied(),
        }
    }

    /// Propagation delay over `distance` meters.
    pub fn delay(distance: f64) -> Duration {
        Duration::from_secs_f64(distance / SPEED_OF_LIGHT)
    }

    /// Schedule the arrival of `tx` at every radio of the opposite kind.
    ///
    /// Returns the number of receivers reached.
    pub fn deliver(&self, ctx: &mut SimContext, tx: &Transmission) -> usize {
        let Some(origin) = self.position(tx.sender) else {
            log::error!("Transmission from unregistered radio {}", tx.sender);
            return 0;
        };

        let receivers: Vec<(RadioId, Position)> = match tx.sender {
            RadioId::EndDevice(_) => self.gateways.iter().enumerate().map(|(i, p)| (RadioId::Gateway(i), *p)).collect(),
            RadioId::Gateway(_) => self.end_devices.iter().enumerate().map(|(i, p)| (RadioId::EndDevice(i), *p)).collect(),
        };

        for (receiver, position) in &receivers {
            let distance = origin.distance_to(position);
            let rx_power_dbm = tx.tx_power_dbm - calculate_path_loss(distance, &self.path_loss, &mut ctx.rng);
            log::trace!("{} -> {}: {:.1} m, {:.1} dBm", tx.sender, receiver, distance, rx_power_dbm);
            ctx.schedule(
                Self::delay(distance),
                SimEvent::StartReceive {
                    receiver: *receiver,
                    signal: IncomingSignal {
                        packet: tx.packet.clone(),
                        rx_power_dbm,
                        params: tx.params,
                        duration: tx.duration,
                        frequency: tx.frequency,
                    },
                },
            );
        }
        receivers.len()
    }
}
