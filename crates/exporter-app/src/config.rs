use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use modbus_transport::TransportConfig;
use poller::SchedulerConfig;

const DEFAULT_INVERTER_PORT: u16 = 1_502;
const DEFAULT_UNIT_ID: u8 = 1;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_RETRY_DELAY_SECS: u64 = 7;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 2_112;
const MAX_METERS: u8 = 2;

#[derive(Clone, Debug)]
pub struct ExporterConfig {
    pub inverter_address: String,
    pub inverter_port: u16,
    pub unit_id: u8,
    pub num_meters: u8,
    pub poll_interval_secs: u64,
    pub retry_delay_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub listen_address: String,
    pub listen_port: u16,
}

impl ExporterConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Fatal-at-startup checks; a misconfigured exporter must fail before
    /// the first poll rather than degrade silently.
    pub fn validate(&self) -> Result<()> {
        if self.inverter_address.trim().is_empty() {
            anyhow::bail!("inverter.address must be set");
        }
        if self.inverter_port == 0 {
            anyhow::bail!("inverter.port must be between 1 and 65535");
        }
        if self.num_meters > MAX_METERS {
            anyhow::bail!("meters.count must be between 0 and {MAX_METERS}");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("exporter.interval_secs must be >= 1");
        }
        if self.retry_delay_secs == 0 {
            anyhow::bail!("exporter.retry_delay_secs must be >= 1");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("modbus.connect_timeout_ms must be >= 1");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("modbus.request_timeout_ms must be >= 1");
        }
        if self.listen_port == 0 {
            anyhow::bail!("exporter.listen_port must be between 1 and 65535");
        }

        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            host: self.inverter_address.clone(),
            port: self.inverter_port,
            unit_id: self.unit_id,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            inverter_address: String::new(),
            inverter_port: DEFAULT_INVERTER_PORT,
            unit_id: DEFAULT_UNIT_ID,
            num_meters: 0,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    inverter: Option<FileInverterConfig>,
    meters: Option<FileMeterConfig>,
    exporter: Option<FileExporterConfig>,
    modbus: Option<FileModbusConfig>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    address: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FileMeterConfig {
    count: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FileExporterConfig {
    listen_address: Option<String>,
    listen_port: Option<u16>,
    interval_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("SOLAREDGE_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut ExporterConfig, file: FileConfig) {
    if let Some(inverter) = file.inverter {
        if let Some(address) = inverter.address {
            config.inverter_address = address;
        }
        if let Some(port) = inverter.port {
            config.inverter_port = port;
        }
        if let Some(unit_id) = inverter.unit_id {
            config.unit_id = unit_id;
        }
    }

    if let Some(meters) = file.meters {
        if let Some(count) = meters.count {
            config.num_meters = count;
        }
    }

    if let Some(exporter) = file.exporter {
        if let Some(address) = exporter.listen_address {
            config.listen_address = address;
        }
        if let Some(port) = exporter.listen_port {
            config.listen_port = port;
        }
        if let Some(interval) = exporter.interval_secs {
            config.poll_interval_secs = interval;
        }
        if let Some(delay) = exporter.retry_delay_secs {
            config.retry_delay_secs = delay;
        }
    }

    if let Some(modbus) = file.modbus {
        if let Some(timeout) = modbus.connect_timeout_ms {
            config.connect_timeout_ms = timeout;
        }
        if let Some(timeout) = modbus.request_timeout_ms {
            config.request_timeout_ms = timeout;
        }
    }
}

fn apply_env_overrides(config: &mut ExporterConfig) {
    if let Ok(value) = env::var("INVERTER_ADDRESS") {
        config.inverter_address = value;
    }
    if let Some(port) = parse_env_u16("INVERTER_PORT") {
        config.inverter_port = port;
    }
    if let Some(unit_id) = parse_env_u8("INVERTER_UNIT_ID") {
        config.unit_id = unit_id;
    }
    if let Some(count) = parse_env_u8("NUM_METERS") {
        config.num_meters = count;
    }
    if let Some(interval) = parse_env_u64("EXPORTER_INTERVAL") {
        config.poll_interval_secs = interval;
    }
    if let Some(delay) = parse_env_u64("EXPORTER_RETRY_DELAY") {
        config.retry_delay_secs = delay;
    }
    if let Ok(value) = env::var("EXPORTER_ADDRESS") {
        config.listen_address = value;
    }
    if let Some(port) = parse_env_u16("EXPORTER_PORT") {
        config.listen_port = port;
    }
    if let Some(timeout) = parse_env_u64("MODBUS_CONNECT_TIMEOUT_MS") {
        config.connect_timeout_ms = timeout;
    }
    if let Some(timeout) = parse_env_u64("MODBUS_REQUEST_TIMEOUT_MS") {
        config.request_timeout_ms = timeout;
    }
}

fn parse_env_u8(key: &str) -> Option<u8> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
