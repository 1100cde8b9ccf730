//! Simulator configuration loaded from TOML.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::simulation::end_device_mac::MacSettings;
use crate::simulation::gateway_phy::DEFAULT_RECEPTION_PATHS;
use crate::simulation::interference::{DEFAULT_PRUNE_THRESHOLD, DEFAULT_RETENTION, IsolationMatrix};

/// Run-wide settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulatorConfig {
    pub seed: u64,
    pub stop_time_seconds: f64,
    pub isolation_matrix: IsolationMatrix,
    pub reception_paths: usize,
    pub retransmit_timeout_seconds: f64,
    pub busy_delay_min_seconds: f64,
    pub busy_delay_max_seconds: f64,
    pub receive_window_symbols: u32,
    pub noise_figure_db: f64,
    pub event_retention_seconds: f64,
    pub event_prune_threshold: usize,
    /// Keep every trace event in memory (needed for per-event analysis).
    pub record_trace: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            seed: 1,
            stop_time_seconds: 3600.0,
            isolation_matrix: IsolationMatrix::default(),
            reception_paths: DEFAULT_RECEPTION_PATHS,
            retransmit_timeout_seconds: 5.0,
            busy_delay_min_seconds: 4.0,
            busy_delay_max_seconds: 5.0,
            receive_window_symbols: 8,
            noise_figure_db: 6.0,
            event_retention_seconds: DEFAULT_RETENTION.as_secs_f64(),
            event_prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            record_trace: false,
        }
    }
}

impl SimulatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Returns
    /// * `Ok(SimulatorConfig)` if the file was successfully loaded, parsed and validated
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: SimulatorConfig = toml::from_str(content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let non_negative = [
            ("stop-time-seconds", self.stop_time_seconds),
            ("retransmit-timeout-seconds", self.retransmit_timeout_seconds),
            ("busy-delay-min-seconds", self.busy_delay_min_seconds),
            ("busy-delay-max-seconds", self.busy_delay_max_seconds),
            ("event-retention-seconds", self.event_retention_seconds),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, value));
            }
        }
        if self.busy_delay_min_seconds > self.busy_delay_max_seconds {
            return Err("busy-delay-min-seconds must not exceed busy-delay-max-seconds".to_string());
        }
        if self.reception_paths == 0 {
            return Err("reception-paths must be at least 1".to_string());
        }
        if self.receive_window_symbols == 0 {
            return Err("receive-window-symbols must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn stop_time(&self) -> Duration {
        Duration::from_secs_f64(self.stop_time_seconds)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs_f64(self.event_retention_seconds)
    }

    pub fn mac_settings(&self) -> MacSettings {
        MacSettings {
            retransmit_timeout: Duration::from_secs_f64(self.retransmit_timeout_seconds),
            busy_delay_min: Duration::from_secs_f64(self.busy_delay_min_seconds),
            busy_delay_max: Duration::from_secs_f64(self.busy_delay_max_seconds),
            receive_window_symbols: self.receive_window_symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SimulatorConfig::parse("").unwrap();
        assert_eq!(config.isolation_matrix, IsolationMatrix::Goursaud);
        assert_eq!(config.reception_paths, 8);
        assert_eq!(config.event_prune_threshold, 100);
        assert_eq!(config.event_retention(), Duration::from_secs(2));
        assert_eq!(config.mac_settings().retransmit_timeout, Duration::from_secs(5));
        assert!(!config.record_trace);
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let config = SimulatorConfig::parse(
            r#"
            seed = 42
            stop-time-seconds = 86400
            isolation-matrix = "aloha"
            reception-paths = 16
            busy-delay-min-seconds = 1.5
            record-trace = true
            "#,
        )
        .unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.stop_time(), Duration::from_secs(86_400));
        assert_eq!(config.isolation_matrix, IsolationMatrix::Aloha);
        assert_eq!(config.reception_paths, 16);
        assert_eq!(config.mac_settings().busy_delay_min, Duration::from_millis(1500));
        assert!(config.record_trace);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SimulatorConfig::parse("reception-paths = 0").is_err());
        assert!(SimulatorConfig::parse("busy-delay-min-seconds = 6").is_err());
        assert!(SimulatorConfig::parse("stop-time-seconds = -1").is_err());
        assert!(SimulatorConfig::parse("isolation-matrix = \"unknown\"").is_err());
    }
}
