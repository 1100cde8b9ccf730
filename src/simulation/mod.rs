//! LoRa/LoRaWAN shared-medium simulation core.
//!
//! ## Module Organization
//!
//! - `scheduler`: Discrete-event queue over virtual time
//! - `events`: Scheduled events and the context handed to every component
//! - `trace`: Trace events, counters and sinks
//! - `types`: Radio ids, addresses, frames, packets and transmissions
//! - `signal_calculations`: Time on air, path loss, sensitivity and SNR
//! - `interference`: Per-receiver interference tracking with isolation matrices
//! - `propagation`: Shared medium delivering transmissions to receivers
//! - `gateway_phy`, `end_device_phy`: Radio models
//! - `sub_band`, `region`: Duty-cycle bookkeeping and the EU868 plan
//! - `end_device_mac`, `receive_windows`: Class A MAC with retransmissions
//! - `gateway_mac`, `network_server`: Downlink path
//! - `traffic`: Periodic application senders
//! - `network`: The world that owns every node and dispatches events

pub mod end_device_mac;
pub mod end_device_phy;
pub mod events;
pub mod gateway_mac;
pub mod gateway_phy;
pub mod interference;
pub mod network;
pub mod network_server;
pub mod propagation;
pub mod receive_windows;
pub mod region;
pub mod scheduler;
pub mod signal_calculations;
pub mod sub_band;
pub mod trace;
pub mod traffic;
pub mod types;

pub use network::{Simulation, SimulationSummary};
