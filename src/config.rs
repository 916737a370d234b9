use std::{collections::HashSet, net::IpAddr, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE: &str = "./tp357-dashboard.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cycle_interval_seconds: u64,
    pub connection_timeout_seconds: u64,
    pub bind_address: IpAddr,
    pub port: u16,
    /// Sensors in polling order.
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no sensors configured")]
    NoSensors,
    #[error("sensor name must not be empty")]
    EmptyName,
    #[error("duplicate sensor name {0:?}")]
    DuplicateName(String),
    #[error("invalid address {address:?} for sensor {name:?}")]
    InvalidAddress { name: String, address: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cycle_interval_seconds: 30,
            connection_timeout_seconds: 10,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            sensors: vec![
                SensorConfig {
                    name: "Colonisation Bin".to_string(),
                    address: "E5:35:C4:81:8D:8C".to_string(),
                },
                SensorConfig {
                    name: "Fruiting Bucket".to_string(),
                    address: "C1:92:D2:5A:72:3E".to_string(),
                },
            ],
        }
    }
}

impl Config {
    /// Loads and validates the config at `path`, falling back to the
    /// defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Config, anyhow::Error> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Config::parse(&content).with_context(|| format!("Invalid config {}", path.display()))?
        } else {
            log::warn!("{} not found, using default configuration", path.display());
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config, anyhow::Error> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval_seconds == 0 {
            return Err(ConfigError::Zero("cycle_interval_seconds"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(ConfigError::Zero("connection_timeout_seconds"));
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }

        let mut names = HashSet::new();
        for sensor in &self.sensors {
            if sensor.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !names.insert(sensor.name.as_str()) {
                return Err(ConfigError::DuplicateName(sensor.name.clone()));
            }
            if !is_mac_address(&sensor.address) {
                return Err(ConfigError::InvalidAddress {
                    name: sensor.name.clone(),
                    address: sensor.address.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn log_summary(&self) {
        log::info!(
            "Polling {} sensor(s) every {}s (connection timeout {}s), serving on {}:{}",
            self.sensors.len(),
            self.cycle_interval_seconds,
            self.connection_timeout_seconds,
            self.bind_address,
            self.port
        );
        for sensor in &self.sensors {
            log::info!("  {} at {}", sensor.name, sensor.address);
        }
    }
}

fn is_mac_address(address: &str) -> bool {
    let octets: Vec<_> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
