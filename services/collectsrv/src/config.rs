//! Service configuration
//!
//! Loaded through the layered figment loader: built-in defaults, then
//! `config/collectsrv.{toml,yaml,json}`, then `--config`, then
//! `COLLECTSRV_*` environment variables.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use errors::{CollectError, CollectResult};
use fieldlink_modbus::Device;
use serde::{Deserialize, Serialize};

pub const SERVICE_NAME: &str = "collectsrv";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectsrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            description: None,
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Retry period for unconnected devices
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Connect / read / write timeout per I/O call
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Attempts per frame read
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_control_queue_capacity")]
    pub control_queue_capacity: usize,
    /// Cycle results buffered per device and on the broadcast channel
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            io_timeout_ms: default_io_timeout_ms(),
            max_attempts: default_max_attempts(),
            control_queue_capacity: default_control_queue_capacity(),
            result_buffer: default_result_buffer(),
        }
    }
}

impl CollectorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn validate(&self) -> CollectResult<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(CollectError::invalid_config(
                "collector.heartbeat_interval_secs",
                "must be positive",
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(CollectError::invalid_config(
                "collector.io_timeout_ms",
                "must be positive",
            ));
        }
        if self.max_attempts == 0 {
            return Err(CollectError::invalid_config(
                "collector.max_attempts",
                "must be positive",
            ));
        }
        if self.control_queue_capacity == 0 || self.result_buffer == 0 {
            return Err(CollectError::invalid_config(
                "collector",
                "queue capacities must be positive",
            ));
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    SERVICE_NAME.to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_io_timeout_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_control_queue_capacity() -> usize {
    64
}

fn default_result_buffer() -> usize {
    16
}

impl CollectsrvConfig {
    /// Load from every configuration layer
    pub fn load(explicit: Option<&Path>) -> CollectResult<Self> {
        common::load_config(SERVICE_NAME, explicit)
    }

    /// Re-read the configuration and apply its `logging.level` to the
    /// running subscriber; returns the directive now in effect
    pub fn reload_log_level(explicit: Option<&Path>) -> CollectResult<String> {
        let config = Self::load(explicit)?;
        common::logging::set_log_level(&config.logging.level)
            .map_err(|reason| CollectError::invalid_config("logging.level", reason))?;
        Ok(config.logging.level)
    }

    pub fn validate(&self) -> CollectResult<()> {
        self.collector.validate()?;

        let mut ids = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !ids.insert(device.id.as_str()) {
                return Err(CollectError::DeviceExists(device.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use fieldlink_modbus::{ByteOrder, DataType, Transport};
    use std::io::Write;

    const SAMPLE: &str = r#"
logging:
  level: debug
collector:
  heartbeat_interval_secs: 5
devices:
  - id: boiler-1
    deviceModel: modbusTcp
    collectorCycle: 2
    slave: 3
    memoryLayout: CDAB
    address:
      location: 192.168.1.20
      option:
        port: 502
    variables:
      - name: temperature
        dataType: float32
        address: 100
        functionCode: 3
        rate: 1
        accessMode: r
      - name: setpoint
        dataType: int16
        address: 110
        functionCode: 3
        rate: 0.1
        accessMode: rw
"#;

    #[test]
    fn test_defaults() {
        let config = CollectsrvConfig::default();
        assert_eq!(config.collector.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.collector.io_timeout(), Duration::from_millis(1000));
        assert_eq!(config.collector.max_attempts, 3);
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CollectsrvConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.collector.heartbeat_interval_secs, 5);
        // untouched fields keep their defaults
        assert_eq!(config.collector.io_timeout_ms, 1000);

        let device = &config.devices[0];
        assert_eq!(device.device_model, Transport::Tcp);
        assert_eq!(device.memory_layout, ByteOrder::BigEndianSwap);
        assert_eq!(device.slave, 3);
        assert_eq!(device.variables[0].data_type, DataType::Float32);
        assert!(device.variables[1].is_writable());
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_device_ids_rejected() {
        let mut config: CollectsrvConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.devices.push(config.devices[0].clone());
        assert!(matches!(config.validate(), Err(CollectError::DeviceExists(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = CollectsrvConfig::default();
        config.collector.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
