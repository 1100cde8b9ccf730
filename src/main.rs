//! LoRa/LoRaWAN shared-medium simulator.
//!
//! Loads a JSON scene and an optional TOML configuration, runs the
//! discrete-event simulation to the stop time and prints a summary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::{LevelFilter, info};
use serde::Serialize;

use crate::common::config::SimulatorConfig;
use crate::common::scene::load_scene;
use crate::simulation::{Simulation, SimulationSummary};

mod common;
mod simulation;

#[derive(Parser)]
#[command(name = "lora-medium-simulator", about = "Discrete-event LoRa/LoRaWAN shared-medium simulator", version)]
struct Cli {
    /// Scene JSON file
    scene: String,

    /// Simulator configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the stop time, in seconds
    #[arg(long)]
    stop_time: Option<f64>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write a JSON report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable debug logging for the simulator
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: String,
    scene: &'a str,
    seed: u64,
    summary: &'a SimulationSummary,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging setup; RUST_LOG takes precedence when set.
    let crate_level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("lora_medium_simulator"), crate_level)
        .parse_default_env()
        .init();

    let mut config = match &cli.config {
        Some(path) => SimulatorConfig::load(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Loading configuration {}", path.display()))?,
        None => SimulatorConfig::default(),
    };
    if let Some(stop_time) = cli.stop_time {
        config.stop_time_seconds = stop_time;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.validate().map_err(anyhow::Error::msg).context("Invalid configuration")?;

    let scene = load_scene(&cli.scene).with_context(|| format!("Loading scene {}", cli.scene))?;
    info!(
        "Loaded scene {} with {} gateways and {} end devices",
        cli.scene,
        scene.gateways.len(),
        scene.end_devices.len()
    );

    let mut sim = Simulation::from_scene(&scene, &config).map_err(anyhow::Error::msg).context("Building simulation")?;
    sim.run_until(config.stop_time());

    let summary = sim.summary();
    print_summary(&summary);

    if let Some(path) = &cli.report {
        let report = Report {
            generated_at: chrono::Utc::now().to_rfc3339(),
            scene: &cli.scene,
            seed: config.seed,
            summary: &summary,
        };
        let json = serde_json::to_string_pretty(&report).context("Serializing report")?;
        std::fs::write(path, json).with_context(|| format!("Writing report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}

fn print_summary(summary: &SimulationSummary) {
    let c = &summary.counters;
    println!("Simulated time:        {:?}", Duration::from_secs_f64(summary.simulated_seconds));
    println!("Events processed:      {}", summary.events_processed);
    println!("Gateways / devices:    {} / {}", summary.gateways, summary.end_devices);
    println!("New packets sent:      {}", c.sent_new_packets);
    println!("Transmissions:         {}", c.started_transmitting);
    println!("Gateway receptions:    {}", c.received_by_gateways);
    println!("Device receptions:     {}", c.received_by_end_devices);
    println!("Lost (interference):   {}", c.lost_interference);
    println!("Lost (sensitivity):    {}", c.lost_under_sensitivity);
    println!("Lost (no demodulator): {}", c.lost_no_more_demodulators);
    println!("Lost (transmitting):   {}", c.lost_because_transmitting);
    println!("Duty-cycle delays:     {}", c.cannot_send_duty_cycle);
    println!("Deliveries ok / fail:  {} / {}", c.deliveries_succeeded, c.deliveries_failed);
    if let Some(ratio) = summary.delivery_ratio {
        println!("Delivery ratio:        {:.3}", ratio);
    }
}
