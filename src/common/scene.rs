//! Scene loading, parsing, and validation logic.
//!
//! A scene describes the radio environment (path loss model), the gateways
//! and the end devices with their uplink settings and traffic.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

use crate::simulation::propagation::Position;
use crate::simulation::region;
use crate::simulation::signal_calculations::PathLossParameters;

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SceneLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneLoadError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneLoadError {}

/// A gateway with its antenna position.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub id: u32,
    pub position: Position,
}

/// Application traffic of one end device.
#[derive(Debug, Deserialize, Clone)]
pub struct TrafficConfig {
    /// Seconds between two application packets.
    pub period: f64,
    /// Application payload in bytes.
    pub payload_size: usize,
    /// Seconds before the first packet. Random within the first period when absent.
    #[serde(default)]
    pub start_offset: Option<f64>,
}

fn default_data_rate() -> u8 {
    5
}

fn default_tx_power() -> f64 {
    region::DEFAULT_TX_POWER_DBM
}

fn default_max_transmissions() -> u8 {
    1
}

/// An end device and its uplink settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EndDeviceConfig {
    /// Also used as the device address.
    pub id: u32,
    pub position: Position,
    #[serde(default = "default_data_rate")]
    pub data_rate: u8,
    /// Transmission power in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: f64,
    #[serde(default)]
    pub confirmed: bool,
    /// Attempts per packet (NbTrans).
    #[serde(default = "default_max_transmissions")]
    pub max_transmissions: u8,
    #[serde(default)]
    pub adr: bool,
    #[serde(default)]
    pub traffic: Option<TrafficConfig>,
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize, Clone)]
pub struct Scene {
    pub path_loss_parameters: PathLossParameters,
    pub gateways: Vec<GatewayConfig>,
    pub end_devices: Vec<EndDeviceConfig>,
}

/// Load, parse and validate a scene file.
pub fn load_scene(path: &str) -> Result<Scene, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;

    parse_scene(&data)
}

/// Parse and validate a scene from JSON text.
pub fn parse_scene(data: &str) -> Result<Scene, SceneLoadError> {
    let scene: Scene = serde_json::from_str(data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(e.to_string()))?;

    validate_scene(&scene).map_err(SceneLoadError::ValidationError)?;

    Ok(scene)
}

/// Validate a parsed scene.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_WORLD_COORD: f64 = 1_000_000.0;
    const MAX_NODES: usize = 100_000;
    const MIN_TX_POWER: f64 = -10.0;
    const MAX_TX_POWER: f64 = 30.0;
    const MAX_TRANSMISSIONS: u8 = 15;
    const MIN_PERIOD: f64 = 1.0;

    if scene.gateways.is_empty() {
        return Err("Scene must contain at least one gateway".to_string());
    }
    if scene.end_devices.is_empty() {
        return Err("Scene must contain at least one end device".to_string());
    }
    if scene.gateways.len() + scene.end_devices.len() > MAX_NODES {
        return Err(format!(
            "Node count {} exceeds maximum of {}",
            scene.gateways.len() + scene.end_devices.len(),
            MAX_NODES
        ));
    }

    let path_loss = &scene.path_loss_parameters;
    if path_loss.path_loss_exponent <= 0.0 {
        return Err("Invalid path_loss_exponent, must be positive".to_string());
    }
    if path_loss.shadowing_sigma < 0.0 {
        return Err("Invalid shadowing_sigma, must be non-negative".to_string());
    }
    if path_loss.reference_distance <= 0.0 {
        return Err("Invalid reference_distance, must be positive".to_string());
    }

    let out_of_bounds = |p: &Position| p.x.abs() > MAX_WORLD_COORD || p.y.abs() > MAX_WORLD_COORD || p.z.abs() > MAX_WORLD_COORD;

    let mut gateway_ids = HashSet::new();
    for gateway in &scene.gateways {
        if !gateway_ids.insert(gateway.id) {
            return Err(format!("Duplicate gateway id found: {}", gateway.id));
        }
        if out_of_bounds(&gateway.position) {
            return Err(format!("Gateway {} position exceeds world bounds (±{})", gateway.id, MAX_WORLD_COORD));
        }
    }

    let mut device_ids = HashSet::new();
    for device in &scene.end_devices {
        if !device_ids.insert(device.id) {
            return Err(format!("Duplicate end device id found: {}", device.id));
        }
        if out_of_bounds(&device.position) {
            return Err(format!("End device {} position exceeds world bounds (±{})", device.id, MAX_WORLD_COORD));
        }
        if !region::is_valid_data_rate(device.data_rate) {
            return Err(format!("End device {} has invalid data_rate {}, must be 0-6", device.id, device.data_rate));
        }
        if device.tx_power < MIN_TX_POWER || device.tx_power > MAX_TX_POWER {
            return Err(format!(
                "End device {} tx_power {} dBm outside realistic range ({} to {} dBm)",
                device.id, device.tx_power, MIN_TX_POWER, MAX_TX_POWER
            ));
        }
        if device.max_transmissions == 0 || device.max_transmissions > MAX_TRANSMISSIONS {
            return Err(format!(
                "End device {} max_transmissions {} must be 1-{}",
                device.id, device.max_transmissions, MAX_TRANSMISSIONS
            ));
        }
        if let Some(traffic) = &device.traffic {
            if traffic.period < MIN_PERIOD {
                return Err(format!("End device {} traffic period must be at least {} s", device.id, MIN_PERIOD));
            }
            if traffic.start_offset.is_some_and(|offset| offset < 0.0) {
                return Err(format!("End device {} traffic start_offset must be non-negative", device.id));
            }
            // Framing adds 8 bytes of FHDR and FPort to the application payload.
            let limit = region::max_mac_payload(device.data_rate).unwrap_or(0).saturating_sub(8);
            if traffic.payload_size > limit {
                return Err(format!(
                    "End device {} payload_size {} exceeds {} bytes allowed at DR{}",
                    device.id, traffic.payload_size, limit, device.data_rate
                ));
            }
        }
    }

    Ok(())
}
