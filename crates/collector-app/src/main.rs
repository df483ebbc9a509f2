use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use buffer::ReadingStore;
use collector_app::CollectorConfig;
use discovery::scan_subnet;
use modbus_client::TcpClientFactory;
use poller_actor::Supervisor;
use registry::{DeviceRegistry, RegistryError};
use types::{unix_ms, Discard, ReadingHistory, ReadingSink};

const PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_config_arg();
    let config = CollectorConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(listen) = config.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("metrics exporter init failed")?;
        describe_counters();
        info!(%listen, "metrics exporter listening");
    }

    let store = match &config.store_path {
        Some(path) => Some(ReadingStore::open(path).await.context("reading store init failed")?),
        None => None,
    };
    let (sink, history): (Arc<dyn ReadingSink>, Arc<dyn ReadingHistory>) = match &store {
        Some(store) => (Arc::new(store.clone()), Arc::new(store.clone())),
        None => (Arc::new(Discard), Arc::new(Discard)),
    };

    let registry = Arc::new(DeviceRegistry::new());
    let supervisor = Supervisor::with_collaborators(
        registry.clone(),
        Arc::new(TcpClientFactory),
        config.poller.clone(),
        sink,
        history,
    );

    for device in config.devices.iter().cloned() {
        commit_device(&registry, device);
    }
    if config.discovery_enabled {
        let found = scan_subnet(config.discovery.clone())
            .await
            .context("device discovery failed")?;
        for device in found {
            commit_device(&registry, device);
        }
    }

    let devices = registry.list();
    if devices.is_empty() {
        warn!("no devices registered");
    }
    let mut connects = JoinSet::new();
    for device in devices {
        let supervisor = supervisor.clone();
        connects.spawn(async move {
            let id = device.id().to_string();
            (id.clone(), supervisor.connect(&id).await)
        });
    }
    while let Some(result) = connects.join_next().await {
        match result {
            Ok((id, Err(err))) => warn!(device_id = %id, error = %err, "initial connect failed"),
            Ok((_, Ok(()))) => {}
            Err(err) => warn!(error = %err, "connect task failed"),
        }
    }
    info!(
        connected = supervisor.connected_devices().len(),
        registered = registry.list().len(),
        "collector started"
    );

    let prune_handle = store.map(|store| {
        tokio::spawn(prune_task(store, config.retention(), shutdown_rx.clone()))
    });

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    supervisor.disconnect_all().await;

    if let Some(handle) = prune_handle {
        let _ = handle.await;
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn commit_device(registry: &DeviceRegistry, device: types::DeviceState) {
    let id = device.id().to_string();
    match registry.upsert(device) {
        Ok(()) => {}
        Err(RegistryError::AlreadyExists(_)) => info!(device_id = %id, "device already registered"),
        Err(err) => warn!(device_id = %id, error = %err, "device registration failed"),
    }
}

fn describe_counters() {
    describe_counter!("poller_reads_total", "Successful telemetry reads per device");
    describe_counter!("poller_read_failures_total", "Failed telemetry reads per device");
    describe_counter!("poller_sink_failures_total", "Readings the sink rejected per device");
}

async fn prune_task(store: ReadingStore, retention: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        let cutoff = unix_ms().saturating_sub(retention.as_millis() as i64);
        match store.prune_before(cutoff).await {
            Ok(removed) if removed > 0 => info!(removed, cutoff_ms = cutoff, "old readings pruned"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reading store prune failed"),
        }

        tokio::select! {
            _ = sleep(PRUNE_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prune shutdown requested");
                    break;
                }
            }
        }
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
