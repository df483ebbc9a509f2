use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use modbus_client::{ClientConfig, ClientFactory, DeviceClient, TcpClientFactory};
use types::{unix_ms, DeviceIdentity, DeviceState};

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// First three octets of the scanned range, e.g. `192.168.1`.
    pub address_base: String,
    pub first_suffix: u8,
    pub last_suffix: u8,
    pub port: u16,
    pub slave_address: u8,
    /// Bounds the connect and the validating telemetry read of each probe.
    pub per_host_timeout_ms: u64,
    /// Caps in-flight probes; `None` launches every candidate at once.
    pub max_concurrency: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address_base: "192.168.1".to_string(),
            first_suffix: 1,
            last_suffix: 254,
            port: 502,
            slave_address: 1,
            per_host_timeout_ms: 2_000,
            max_concurrency: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid address base {0:?}, expected three octets such as 192.168.1")]
    InvalidAddressBase(String),
    #[error("empty suffix range {first}..={last}")]
    EmptyRange { first: u8, last: u8 },
}

impl DiscoveryConfig {
    /// Candidate addresses in scan order.
    pub fn candidates(&self) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
        let base = self.address_base.trim().trim_end_matches('.');
        let prefix = format!("{base}.0")
            .parse::<Ipv4Addr>()
            .map_err(|_| DiscoveryError::InvalidAddressBase(self.address_base.clone()))?;
        if self.first_suffix > self.last_suffix {
            return Err(DiscoveryError::EmptyRange {
                first: self.first_suffix,
                last: self.last_suffix,
            });
        }

        let [a, b, c, _] = prefix.octets();
        Ok((self.first_suffix..=self.last_suffix)
            .map(|suffix| Ipv4Addr::new(a, b, c, suffix))
            .collect())
    }
}

/// Probes every candidate over plain TCP and returns the devices that answered
/// a telemetry read. Nothing is committed to the registry.
pub async fn scan_subnet(config: DiscoveryConfig) -> Result<Vec<DeviceState>, DiscoveryError> {
    scan_subnet_with(config, Arc::new(TcpClientFactory)).await
}

pub async fn scan_subnet_with(
    config: DiscoveryConfig,
    factory: Arc<dyn ClientFactory>,
) -> Result<Vec<DeviceState>, DiscoveryError> {
    let candidates = config.candidates()?;
    let started = Instant::now();
    let limiter = config
        .max_concurrency
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

    let mut probes = JoinSet::new();
    for ip in &candidates {
        let ip = *ip;
        let config = config.clone();
        let factory = factory.clone();
        let limiter = limiter.clone();
        probes.spawn(async move {
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return None,
                },
                None => None,
            };
            probe(ip, &config, factory.as_ref()).await
        });
    }

    let mut found = Vec::new();
    while let Some(result) = probes.join_next().await {
        match result {
            Ok(Some(device)) => found.push(device),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "discovery probe panicked"),
        }
    }
    found.sort_by_key(|device: &DeviceState| {
        device
            .identity
            .ip
            .parse::<Ipv4Addr>()
            .map(u32::from)
            .unwrap_or(u32::MAX)
    });

    info!(
        base = %config.address_base,
        candidates = candidates.len(),
        found = found.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "subnet scan complete"
    );
    Ok(found)
}

async fn probe(ip: Ipv4Addr, config: &DiscoveryConfig, factory: &dyn ClientFactory) -> Option<DeviceState> {
    let identity = DeviceIdentity::new(
        format!("Inverter {ip}"),
        ip.to_string(),
        config.port,
        config.slave_address,
    );
    let mut device = DeviceState::new(identity);
    let client = factory.create(
        device.id(),
        ClientConfig {
            host: ip.to_string(),
            port: config.port,
            slave_address: config.slave_address,
            timeout_ms: config.per_host_timeout_ms,
            tls: None,
            inter_write_delay_ms: None,
        },
    );

    if let Err(err) = client.connect().await {
        debug!(%ip, error = %err, "probe connect failed");
        return None;
    }
    let validation = client.read_telemetry().await;
    client.disconnect().await;

    match validation {
        Ok(_) => {
            device.mark_online(unix_ms());
            debug!(%ip, device_id = %device.id(), "probe found device");
            Some(device)
        }
        Err(err) => {
            debug!(%ip, error = %err, "probe endpoint did not answer telemetry");
            None
        }
    }
}
