use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::config_loader::ConfigLoader;

pub const CONFIG_FILE: &str = "mitm.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default)]
    pub game_ports: PortRange,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Upper bound on dialing the upstream server for one accepted client.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            upstream_host: default_upstream_host(),
            master_port: default_master_port(),
            game_ports: PortRange::default(),
            read_buffer_size: default_read_buffer_size(),
            idle_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RelayConfig {
    /// Master port first, then the game ports in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.master_port];
        ports.extend(self.game_ports.iter().filter(|&p| p != self.master_port));
        ports
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 3005,
        }
    }
}

impl PortRange {
    pub fn iter(self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    /// Opcode table file; the built-in table is used when unset.
    #[serde(default)]
    pub opcode_table: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_loot: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            opcode_table: None,
            auto_loot: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_debug_log")]
    pub debug_log: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub truncate_on_start: bool,
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug_log: default_debug_log(),
            truncate_on_start: true,
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// TCP address for the line console, e.g. `127.0.0.1:7878`.
    #[serde(default)]
    pub listen: Option<String>,
}

impl Config {
    /// Loads `mitm.toml` through the config search order; defaults when absent.
    pub fn load() -> anyhow::Result<Self> {
        if !ConfigLoader::exists(CONFIG_FILE) {
            return Ok(Self::default());
        }
        let config: Config =
            ConfigLoader::parse_from_file(CONFIG_FILE).context("parse mitm.toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Config = ConfigLoader::parse_from_string(text.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let range = self.relay.game_ports;
        if range.start > range.end {
            anyhow::bail!(
                "Invalid config: [relay.game_ports] start {} is after end {}",
                range.start,
                range.end
            );
        }
        if self.relay.connect_timeout_secs == 0 {
            anyhow::bail!("Invalid config: [relay].connect_timeout_secs must be positive");
        }
        if self.relay.read_buffer_size == 0 {
            anyhow::bail!("Invalid config: [relay].read_buffer_size must be positive");
        }
        Ok(())
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_host() -> String {
    "192.168.100.12".to_string()
}

fn default_master_port() -> u16 {
    3333
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_debug_log() -> Option<PathBuf> {
    Some(PathBuf::from("debug.log"))
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_original_deployment() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.relay.listen_host, "0.0.0.0");
        assert_eq!(config.relay.upstream_host, "192.168.100.12");
        assert_eq!(
            config.relay.ports(),
            vec![3333, 3000, 3001, 3002, 3003, 3004, 3005]
        );
        assert_eq!(config.relay.read_buffer_size, 4096);
        assert_eq!(config.relay.idle_timeout(), None);
        assert_eq!(config.relay.connect_timeout(), Duration::from_secs(5));
        assert!(config.decoder.auto_loot);
        assert!(config.logging.truncate_on_start);
        assert_eq!(config.control.listen, None);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [relay]
            upstream_host = "10.0.0.2"
            master_port = 4444
            game_ports = { start = 4000, end = 4001 }
            idle_timeout_secs = 30

            [decoder]
            opcode_table = "opcodes.toml"
            auto_loot = false

            [logging]
            debug_log = "trace.log"
            truncate_on_start = false

            [control]
            listen = "127.0.0.1:7878"
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.ports(), vec![4444, 4000, 4001]);
        assert_eq!(config.relay.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.decoder.opcode_table,
            Some(PathBuf::from("opcodes.toml"))
        );
        assert!(!config.decoder.auto_loot);
        assert_eq!(config.logging.debug_log, Some(PathBuf::from("trace.log")));
        assert_eq!(config.control.listen.as_deref(), Some("127.0.0.1:7878"));
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let err = Config::from_toml_str("[relay]\nconnect_timeout_secs = 0").unwrap_err();
        assert!(format!("{err:#}").contains("connect_timeout_secs"));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let err = Config::from_toml_str("[relay]\ngame_ports = { start = 10, end = 1 }")
            .unwrap_err();
        assert!(format!("{err:#}").contains("start 10 is after end 1"));
    }
}
