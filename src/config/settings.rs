use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::modbus::pdu::QuantityLimits;
use crate::utils::error::ServerError;

/// Default register/bit count per region.
pub const DEFAULT_REGION_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server identification
    pub server_uuid: String,
    pub server_name: String,
    pub server_version: String,

    // Listener settings
    pub bind_address: String,
    pub port: u16,

    // Datastore settings
    pub region_size: usize,
    pub unit_mode: UnitMode,
    /// Unit ids served in multi mode; ignored in single mode.
    pub unit_ids: Vec<u8>,

    // Protocol limits
    pub limits: QuantityLimits,

    // Connection hardening
    pub idle_timeout_seconds: Option<u64>,
    pub response_queue_depth: usize,
}

/// Unit-identifier routing policy.
///
/// `Single` routes every unit id to the one datastore, the common TCP
/// deployment. `Multi` keys datastores by the ids in `unit_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitMode {
    Single,
    Multi,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uuid: Uuid::new_v4().to_string(),
            server_name: "Modbus TCP Server".to_string(),
            server_version: crate::VERSION.to_string(),

            bind_address: "0.0.0.0".to_string(),
            port: 502,

            region_size: DEFAULT_REGION_SIZE,
            unit_mode: UnitMode::Single,
            unit_ids: vec![1],

            limits: QuantityLimits::default(),

            idle_timeout_seconds: None,
            response_queue_depth: 32,
        }
    }
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ServerError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // Command line overrides
        if let Some(bind) = matches.get_one::<String>("bind") {
            config.bind_address = bind.clone();
        }
        if let Some(port) = matches.get_one::<String>("port") {
            config.port = port
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid port: {}", e)))?;
        }
        if let Some(size) = matches.get_one::<String>("region-size") {
            config.region_size = size
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid region size: {}", e)))?;
        }
        if let Some(idle) = matches.get_one::<String>("idle-timeout") {
            config.idle_timeout_seconds = Some(
                idle.parse()
                    .map_err(|e| ServerError::Config(format!("invalid idle timeout: {}", e)))?,
            );
        }
        if let Some(units) = matches.get_one::<String>("units") {
            let ids: Vec<u8> = units
                .split(',')
                .map(|s| s.trim().parse::<u8>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServerError::Config(format!("invalid unit id list: {}", e)))?;
            config.unit_ids = ids;
            config.unit_mode = UnitMode::Multi;
        }

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Backward compatibility with hand-written files
        if config.server_uuid.is_empty() {
            config.server_uuid = Uuid::new_v4().to_string();
        }
        if config.server_name.is_empty() {
            config.server_name = "Modbus TCP Server".to_string();
        }
        if config.server_version.is_empty() {
            config.server_version = crate::VERSION.to_string();
        }

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ServerError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get_server_uuid(&self) -> &str {
        &self.server_uuid
    }

    pub fn get_server_name(&self) -> &str {
        &self.server_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 502);
        assert_eq!(config.region_size, 10_000);
        assert_eq!(config.unit_mode, UnitMode::Single);
        assert!(config.idle_timeout_seconds.is_none());
    }

    #[test]
    fn test_invalid_toml_maps_to_config_error() {
        let err: ServerError = toml::from_str::<Config>("port = \"not a number\"")
            .unwrap_err()
            .into();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.region_size, config.region_size);
        assert_eq!(parsed.limits.max_read_registers, 125);
    }
}
