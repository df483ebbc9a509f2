use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use discovery::DiscoveryConfig;
use modbus_client::TlsConfig;
use poller_actor::ActorConfig;
use types::DeviceState;

const DEFAULT_RETENTION_HOURS: u64 = 24 * 7;

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub discovery_enabled: bool,
    pub discovery: DiscoveryConfig,
    pub poller: ActorConfig,
    /// Manually entered devices committed before any scan.
    pub devices: Vec<DeviceState>,
    pub store_path: Option<String>,
    pub retention_hours: u64,
    pub metrics_listen: Option<SocketAddr>,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery.port == 0 {
            anyhow::bail!("discovery.port must be between 1 and 65535");
        }
        if self.discovery.per_host_timeout_ms == 0 {
            anyhow::bail!("discovery.per_host_timeout_ms must be >= 1");
        }
        if self.discovery.max_concurrency == Some(0) {
            anyhow::bail!("discovery.max_concurrency must be >= 1 when set");
        }
        self.discovery
            .candidates()
            .context("discovery range is invalid")?;
        if self.poller.poll_interval.is_zero() {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        if self.poller.error_backoff.is_zero() {
            anyhow::bail!("poller.error_backoff_ms must be >= 1");
        }
        if self.poller.request_timeout.is_zero() {
            anyhow::bail!("poller.connect_timeout_ms must be >= 1");
        }
        if let Some(tls) = &self.poller.tls {
            if let Some(ca_file) = &tls.ca_file {
                if ca_file.trim().is_empty() {
                    anyhow::bail!("poller.tls_ca_file must be non-empty when set");
                }
            }
        }
        for device in &self.devices {
            if device.identity.port == 0 {
                anyhow::bail!("device {} port must be between 1 and 65535", device.identity.ip);
            }
            if device.identity.ip.trim().is_empty() {
                anyhow::bail!("device {:?} needs an ip", device.identity.name);
            }
        }
        if self.store_path.is_some() && self.retention_hours == 0 {
            anyhow::bail!("store.retention_hours must be >= 1");
        }

        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3_600))
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            discovery_enabled: false,
            discovery: DiscoveryConfig::default(),
            poller: ActorConfig::default(),
            devices: Vec::new(),
            store_path: None,
            retention_hours: DEFAULT_RETENTION_HOURS,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) -> Result<()> {
    if let Some(enabled) = parse_env_bool("SOLAR_DISCOVERY_ENABLED") {
        config.discovery_enabled = enabled;
    }
    if let Ok(value) = env::var("SOLAR_ADDRESS_BASE") {
        config.discovery.address_base = value;
    }
    if let Some(port) = parse_env::<u16>("SOLAR_PORT") {
        config.discovery.port = port;
    }
    if let Some(slave) = parse_env::<u8>("SOLAR_SLAVE_ADDRESS") {
        config.discovery.slave_address = slave;
    }
    if let Some(timeout_ms) = parse_env::<u64>("SOLAR_PER_HOST_TIMEOUT_MS") {
        config.discovery.per_host_timeout_ms = timeout_ms;
    }
    if let Some(limit) = parse_env::<usize>("SOLAR_MAX_CONCURRENCY") {
        config.discovery.max_concurrency = Some(limit);
    }

    if let Some(interval_ms) = parse_env::<u64>("SOLAR_POLL_INTERVAL_MS") {
        config.poller.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(backoff_ms) = parse_env::<u64>("SOLAR_ERROR_BACKOFF_MS") {
        config.poller.error_backoff = Duration::from_millis(backoff_ms);
    }
    if let Some(timeout_ms) = parse_env::<u64>("SOLAR_CONNECT_TIMEOUT_MS") {
        config.poller.request_timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(enabled) = parse_env_bool("SOLAR_TLS") {
        set_tls_enabled(&mut config.poller, enabled);
    }
    if let Ok(ca_file) = env::var("SOLAR_TLS_CA_FILE") {
        if let Some(tls) = config.poller.tls.as_mut() {
            tls.ca_file = Some(ca_file);
        }
    }

    if let Ok(value) = env::var("SOLAR_STATIC_DEVICES") {
        config.devices = parse_static_devices(&value)?;
    }
    if let Ok(path) = env::var("SOLAR_STORE_PATH") {
        config.store_path = Some(path);
    }
    if let Some(hours) = parse_env::<u64>("SOLAR_RETENTION_HOURS") {
        config.retention_hours = hours;
    }
    if let Ok(listen) = env::var("SOLAR_METRICS_LISTEN") {
        let addr = listen
            .parse()
            .with_context(|| format!("SOLAR_METRICS_LISTEN {listen:?} is not a socket address"))?;
        config.metrics_listen = Some(addr);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    discovery: Option<FileDiscoveryConfig>,
    poller: Option<FilePollerConfig>,
    client: Option<FileClientConfig>,
    devices: Option<Vec<FileDeviceConfig>>,
    store: Option<FileStoreConfig>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct FileDiscoveryConfig {
    enabled: Option<bool>,
    #[serde(flatten)]
    scan: DiscoveryConfig,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    tls: Option<bool>,
    tls_ca_file: Option<String>,
    tls_server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClientConfig {
    inter_write_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    name: Option<String>,
    ip: String,
    port: Option<u16>,
    slave_address: Option<u8>,
    panel_location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileStoreConfig {
    path: Option<String>,
    retention_hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<SocketAddr>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("SOLAR_CONFIG") {
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

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) {
    if let Some(discovery) = file.discovery {
        if let Some(enabled) = discovery.enabled {
            config.discovery_enabled = enabled;
        }
        config.discovery = discovery.scan;
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poller.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(backoff_ms) = poller.error_backoff_ms {
            config.poller.error_backoff = Duration::from_millis(backoff_ms);
        }
        if let Some(timeout_ms) = poller.connect_timeout_ms {
            config.poller.request_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(enabled) = poller.tls {
            set_tls_enabled(&mut config.poller, enabled);
        }
        if let Some(tls) = config.poller.tls.as_mut() {
            if poller.tls_ca_file.is_some() {
                tls.ca_file = poller.tls_ca_file;
            }
            if poller.tls_server_name.is_some() {
                tls.server_name = poller.tls_server_name;
            }
        }
    }

    if let Some(client) = file.client {
        if let Some(delay_ms) = client.inter_write_delay_ms {
            config.poller.inter_write_delay = Some(Duration::from_millis(delay_ms));
        }
    }

    if let Some(devices) = file.devices {
        config.devices = devices
            .into_iter()
            .map(|device| {
                let name = device
                    .name
                    .unwrap_or_else(|| format!("Inverter {}", device.ip));
                let mut state = DeviceState::manual(
                    name,
                    device.ip,
                    device.port.unwrap_or(502),
                    device.slave_address.unwrap_or(1),
                );
                state.panel_location = device.panel_location.unwrap_or_default();
                state
            })
            .collect();
    }

    if let Some(store) = file.store {
        if let Some(path) = store.path {
            config.store_path = Some(path);
        }
        if let Some(hours) = store.retention_hours {
            config.retention_hours = hours;
        }
    }

    if let Some(metrics) = file.metrics {
        config.metrics_listen = metrics.listen;
    }
}

fn set_tls_enabled(poller: &mut ActorConfig, enabled: bool) {
    if !enabled {
        poller.tls = None;
    } else if poller.tls.is_none() {
        poller.tls = Some(TlsConfig::default());
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// `ip[:port[:slave]]` entries separated by commas.
fn parse_static_devices(value: &str) -> Result<Vec<DeviceState>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split(':');
            let ip = parts.next().unwrap_or_default().to_string();
            let port = match parts.next() {
                Some(port) => port
                    .parse::<u16>()
                    .with_context(|| format!("static device {entry:?} has a bad port"))?,
                None => 502,
            };
            let slave = match parts.next() {
                Some(slave) => slave
                    .parse::<u8>()
                    .with_context(|| format!("static device {entry:?} has a bad slave address"))?,
                None => 1,
            };
            Ok(DeviceState::manual(format!("Inverter {ip}"), ip, port, slave))
        })
        .collect()
}
