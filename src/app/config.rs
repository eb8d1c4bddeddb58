use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    pub command_path: String,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            command_timeout_secs: 10,
            transfer_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSettings {
    pub boot_poll_interval_ms: u64,
    pub boot_max_wait_ms: u64,
    pub reboot_settle_ms: u64,
    pub emulator_settle_ms: u64,
    pub recovery_settle_ms: u64,
    pub sdcard_mount_settle_ms: u64,
    pub operator_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            boot_poll_interval_ms: 2_000,
            boot_max_wait_ms: 120_000,
            reboot_settle_ms: 15_000,
            emulator_settle_ms: 60_000,
            recovery_settle_ms: 30_000,
            sdcard_mount_settle_ms: 5_000,
            operator_poll_ms: 30_000,
        }
    }
}

impl TimingSettings {
    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }

    pub fn boot_max_wait(&self) -> Duration {
        Duration::from_millis(self.boot_max_wait_ms)
    }

    pub fn operator_poll(&self) -> Duration {
        Duration::from_millis(self.operator_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StimulationSettings {
    pub event_count: u32,
    pub throttle_ms: u32,
}

impl Default for StimulationSettings {
    fn default() -> Self {
        Self {
            event_count: 500,
            throttle_ms: 6_000,
        }
    }
}

/// Values rendered into the agent configuration pushed onto the device.
/// `elasticsearch_ip` defaults to the host address as seen from an emulated
/// device; physical deployments point it at a reachable sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportingSettings {
    pub elasticsearch_mode: String,
    pub elasticsearch_nb_thread: u32,
    pub elasticsearch_ip: String,
    pub elasticsearch_port: u16,
    pub elasticsearch_index: String,
    pub elasticsearch_doctype: String,
    pub file_mode: String,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            elasticsearch_mode: "network".to_string(),
            elasticsearch_nb_thread: 1,
            elasticsearch_ip: "10.0.2.2".to_string(),
            elasticsearch_port: 9200,
            elasticsearch_index: "experiments".to_string(),
            elasticsearch_doctype: "event".to_string(),
            file_mode: "enabled".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub timings: TimingSettings,
    #[serde(default)]
    pub stimulation: StimulationSettings,
    #[serde(default)]
    pub reporting: ReportingSettings,
    #[serde(default = "default_agent_package")]
    pub agent_package: String,
    #[serde(default)]
    pub results_dir: String,
}

fn default_agent_package() -> String {
    "com.droidlab.agent".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            timings: TimingSettings::default(),
            stimulation: StimulationSettings::default(),
            reporting: ReportingSettings::default(),
            agent_package: default_agent_package(),
            results_dir: String::new(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDLAB_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".droidlab_config.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(config: &AppConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = 10;
    }
    if config.adb.transfer_timeout_secs == 0 {
        config.adb.transfer_timeout_secs = 600;
    }
    if config.timings.boot_poll_interval_ms == 0 {
        config.timings.boot_poll_interval_ms = 2_000;
    }
    if config.timings.boot_max_wait_ms < config.timings.boot_poll_interval_ms {
        config.timings.boot_max_wait_ms = 120_000;
    }
    if config.timings.operator_poll_ms == 0 {
        config.timings.operator_poll_ms = 30_000;
    }
    if config.stimulation.event_count == 0 {
        config.stimulation.event_count = 500;
    }
    if config.reporting.elasticsearch_nb_thread == 0 {
        config.reporting.elasticsearch_nb_thread = 1;
    }
    if config.agent_package.trim().is_empty() {
        config.agent_package = default_agent_package();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let config = load_config_from_path(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.adb.command_path = "/opt/platform-tools/adb".to_string();
        config.reporting.elasticsearch_ip = "192.168.1.20".to_string();
        save_config_to_path(&config, &path).expect("save");
        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.adb.command_timeout_secs = 0;
        config.timings.boot_poll_interval_ms = 0;
        config.timings.boot_max_wait_ms = 1;
        config.stimulation.event_count = 0;
        config.agent_package = "  ".to_string();
        let validated = validate_config(config);
        assert_eq!(validated.adb.command_timeout_secs, 10);
        assert_eq!(validated.timings.boot_poll_interval_ms, 2_000);
        assert_eq!(validated.timings.boot_max_wait_ms, 120_000);
        assert_eq!(validated.stimulation.event_count, 500);
        assert_eq!(validated.agent_package, "com.droidlab.agent");
    }

    #[test]
    fn partial_json_fills_remaining_sections() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"reporting": {"elasticsearch_mode": "network", "elasticsearch_nb_thread": 2, "elasticsearch_ip": "10.0.0.9", "elasticsearch_port": 9300, "elasticsearch_index": "runs", "elasticsearch_doctype": "event", "file_mode": "disabled"}}"#)
            .expect("write");
        let config = load_config_from_path(&path).expect("load");
        assert_eq!(config.reporting.elasticsearch_port, 9300);
        assert_eq!(config.adb, AdbSettings::default());
        assert_eq!(config.timings, TimingSettings::default());
    }
}
