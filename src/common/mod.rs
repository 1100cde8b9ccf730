//! Input loading shared by the command line and the tests.
//!
//! - `scene`: JSON scene with the path loss model, gateways and end devices
//! - `config`: TOML simulator configuration

pub mod config;
pub mod scene;
