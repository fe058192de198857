//! # Configuration Management Module
//!
//! Runtime settings for the gateway, loaded from TOML:
//!
//! - [`ModemConfig`] - serial ports, engine timing, init sequence, monitor cadence
//! - [`StorageConfig`] - inbox backing file
//! - [`UsbConfig`] - storage-mode/modem-mode ids and the mode switch message
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides();
//!     println!("Command port: {}", config.modem.command_port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [modem]
//! command_port = "/dev/ttyUSB0"
//! notify_port = "/dev/ttyUSB2"
//! baud_rate = 115200
//!
//! [storage]
//! inbox_path = "inbox.json"
//! ```
//!
//! Every field has a default, so a partial file is fine.
//!
//! ## Environment Integration
//!
//! Precedence: CLI args > Environment > Config file > Defaults. The
//! recognized variables are `SMSGATE_COMMAND_PORT`, `SMSGATE_NOTIFY_PORT`,
//! `SMSGATE_INBOX_PATH` and `SMSGATE_BAUD_RATE`.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::modem::EngineTiming;
use crate::monitor::MonitorSettings;

pub const ENV_COMMAND_PORT: &str = "SMSGATE_COMMAND_PORT";
pub const ENV_NOTIFY_PORT: &str = "SMSGATE_NOTIFY_PORT";
pub const ENV_INBOX_PATH: &str = "SMSGATE_INBOX_PATH";
pub const ENV_BAUD_RATE: &str = "SMSGATE_BAUD_RATE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Port AT commands are written to.
    pub command_port: String,
    /// Port the modem pushes unsolicited result codes on.
    pub notify_port: String,
    pub baud_rate: u32,
    /// Per-call serial read timeout.
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub expect_timeout_ms: u64,
    pub read_until_timeout_ms: u64,
    /// Sent in order after opening; any rejection fails the open.
    pub init_commands: Vec<String>,
    /// Delay before retrying a failed open.
    pub recheck_interval_secs: u64,
    /// How often the link watcher checks the command port still exists.
    pub presence_interval_ms: u64,
    /// Pending state transitions tolerated before producers wait.
    pub transition_capacity: usize,
    /// Remove a message from modem storage once it is in the inbox.
    pub delete_after_receive: bool,
    /// Held by the running monitor and by one-shot commands while they use
    /// the ports.
    pub lock_path: String,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            command_port: "/dev/ttyUSB0".to_string(),
            notify_port: "/dev/ttyUSB2".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 1000,
            poll_interval_ms: 10,
            expect_timeout_ms: 2000,
            read_until_timeout_ms: 2000,
            init_commands: default_init_commands(),
            recheck_interval_secs: 10,
            presence_interval_ms: 1000,
            transition_capacity: 10,
            delete_after_receive: true,
            lock_path: "/tmp/smsgate.lock".to_string(),
        }
    }
}

pub fn default_init_commands() -> Vec<String> {
    [
        "ATE0",
        "AT+CMEE=0",
        "AT+CPMS=\"MT\",\"MT\",\"MT\"",
        "AT+CMGF=1",
        "AT+CNMI=2,1,0,0,0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ModemConfig {
    pub fn engine_timing(&self) -> EngineTiming {
        EngineTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            expect_timeout: Duration::from_millis(self.expect_timeout_ms),
            read_until_timeout: Duration::from_millis(self.read_until_timeout_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            command_port: self.command_port.clone(),
            notify_port: self.notify_port.clone(),
            baud_rate: self.baud_rate,
            timing: self.engine_timing(),
            init_commands: self.init_commands.clone(),
            recheck_interval: Duration::from_secs(self.recheck_interval_secs),
            presence_interval: Duration::from_millis(self.presence_interval_ms.max(1)),
            transition_capacity: self.transition_capacity.max(1),
            delete_after_receive: self.delete_after_receive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub inbox_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            inbox_path: "inbox.json".to_string(),
        }
    }
}

/// USB ids are hex strings as they appear in sysfs (`12d1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub enabled: bool,
    pub sysfs_root: String,
    pub storage_vendor: String,
    pub storage_product: String,
    pub modem_vendor: String,
    pub modem_product: String,
    pub modeswitch_binary: String,
    pub modeswitch_message: String,
    /// Wait after switching before probing again.
    pub settle_secs: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sysfs_root: "/sys/bus/usb/devices".to_string(),
            storage_vendor: "12d1".to_string(),
            storage_product: "1f01".to_string(),
            modem_vendor: "12d1".to_string(),
            modem_product: "1001".to_string(),
            modeswitch_binary: "usb_modeswitch".to_string(),
            modeswitch_message: "55534243000000000000000000000611060000000000000000000000000000"
                .to_string(),
            settle_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise warn and use defaults. A file that
    /// exists but does not parse is still an error.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::metadata(path).await.is_err() {
            warn!("Config file {} not found, using defaults", path);
            return Ok(Config::default());
        }
        Config::load(path).await
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable baud rates are ignored
    /// with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_COMMAND_PORT).filter(|v| !v.is_empty()) {
            self.modem.command_port = v;
        }
        if let Some(v) = lookup(ENV_NOTIFY_PORT).filter(|v| !v.is_empty()) {
            self.modem.notify_port = v;
        }
        if let Some(v) = lookup(ENV_INBOX_PATH).filter(|v| !v.is_empty()) {
            self.storage.inbox_path = v;
        }
        if let Some(v) = lookup(ENV_BAUD_RATE) {
            match v.trim().parse::<u32>() {
                Ok(rate) if rate > 0 => self.modem.baud_rate = rate,
                _ => warn!("Ignoring invalid {}={:?}", ENV_BAUD_RATE, v),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [modem]
            command_port = "/dev/ttyACM0"
            expect_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.modem.command_port, "/dev/ttyACM0");
        assert_eq!(config.modem.notify_port, "/dev/ttyUSB2");
        assert_eq!(config.modem.engine_timing().expect_timeout, Duration::from_millis(500));
        assert_eq!(config.storage.inbox_path, "inbox.json");
        assert_eq!(config.modem.init_commands, default_init_commands());
    }

    #[test]
    fn example_config_matches_defaults() {
        let example: Config = toml::from_str(include_str!("../../config.example.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(
            example.modem.monitor_settings(),
            defaults.modem.monitor_settings()
        );
        assert_eq!(example.usb.modeswitch_message, defaults.usb.modeswitch_message);
        assert_eq!(example.storage.inbox_path, defaults.storage.inbox_path);
        assert_eq!(example.modem.lock_path, defaults.modem.lock_path);
    }

    #[test]
    fn overrides_take_precedence_over_file_values() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            (ENV_COMMAND_PORT, "/dev/ttyUSB3"),
            (ENV_INBOX_PATH, "/var/lib/smsgate/inbox.json"),
            (ENV_BAUD_RATE, "9600"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.modem.command_port, "/dev/ttyUSB3");
        assert_eq!(config.modem.notify_port, "/dev/ttyUSB2");
        assert_eq!(config.storage.inbox_path, "/var/lib/smsgate/inbox.json");
        assert_eq!(config.modem.baud_rate, 9600);
    }

    #[test]
    fn invalid_baud_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(|k| (k == ENV_BAUD_RATE).then(|| "fast".to_string()));
        assert_eq!(config.modem.baud_rate, 115200);
    }

    #[test]
    fn monitor_settings_follow_modem_section() {
        let config = Config::default();
        let settings = config.modem.monitor_settings();
        assert_eq!(settings.recheck_interval, Duration::from_secs(10));
        assert_eq!(settings.transition_capacity, 10);
        assert!(settings.delete_after_receive);
    }

    #[tokio::test]
    async fn create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.modem.baud_rate, 115200);
        assert_eq!(loaded.usb.storage_product, "1f01");
    }
}
