mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use modbus_client::{DeviceClient, TlsConfig};
use registry::DeviceRegistry;
use types::{DeviceState, Reading, ReadingSink};

pub use supervisor::{Supervisor, SupervisorError};

#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Pause after a successful read.
    pub poll_interval: Duration,
    /// Pause after a failed read. The only backoff: no growth, no retry cap.
    pub error_backoff: Duration,
    /// Connect and per-exchange timeout for supervised clients.
    pub request_timeout: Duration,
    /// Supervised connections are encrypted unless this is `None`.
    pub tls: Option<TlsConfig>,
    pub inter_write_delay: Option<Duration>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            tls: Some(TlsConfig::default()),
            inter_write_delay: None,
        }
    }
}

/// Late subscribers start from the most recent reading, then follow new ones.
/// A subscriber slower than the poll rate sees only the latest value.
#[derive(Debug, Clone)]
pub struct ReadingStream {
    rx: watch::Receiver<Option<Reading>>,
    primed: bool,
}

impl ReadingStream {
    fn new(rx: watch::Receiver<Option<Reading>>) -> Self {
        Self { rx, primed: false }
    }

    pub fn latest(&self) -> Option<Reading> {
        self.rx.borrow().clone()
    }

    /// Next reading, or `None` once the device has been disconnected.
    pub async fn next(&mut self) -> Option<Reading> {
        if !self.primed {
            self.primed = true;
            if let Some(reading) = self.rx.borrow_and_update().clone() {
                return Some(reading);
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            if let Some(reading) = self.rx.borrow_and_update().clone() {
                return Some(reading);
            }
        }
    }
}

/// Continuous acquisition loop for one connected device.
pub struct PollerActor {
    device_id: String,
    client: Arc<dyn DeviceClient>,
    readings: watch::Sender<Option<Reading>>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn ReadingSink>,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
}

impl PollerActor {
    pub fn new(
        device_id: impl Into<String>,
        client: Arc<dyn DeviceClient>,
        readings: watch::Sender<Option<Reading>>,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn ReadingSink>,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            client,
            readings,
            registry,
            sink,
            shutdown,
            config,
        }
    }

    /// Runs until shutdown is signalled or the client reports disconnected.
    /// Shutdown is observed before each read and during the pause; a read in
    /// flight is allowed to finish but its result is dropped.
    pub async fn run(mut self) {
        let mut consecutive_failures = 0u64;

        loop {
            if *self.shutdown.borrow() {
                info!(device_id = %self.device_id, "poller shutdown requested");
                break;
            }
            if !self.client.is_connected() {
                info!(device_id = %self.device_id, "client disconnected, poller exiting");
                break;
            }

            let result = self.client.read_telemetry().await;
            if *self.shutdown.borrow() {
                info!(device_id = %self.device_id, "poller shutdown requested");
                break;
            }

            let delay = match result {
                Ok(reading) => {
                    consecutive_failures = 0;
                    counter!("poller_reads_total", "device_id" => self.device_id.clone()).increment(1);
                    self.publish(reading).await;
                    self.config.poll_interval
                }
                Err(err) => {
                    consecutive_failures += 1;
                    counter!("poller_read_failures_total", "device_id" => self.device_id.clone())
                        .increment(1);
                    warn!(
                        device_id = %self.device_id,
                        error = %err,
                        consecutive_failures,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "telemetry read failed"
                    );
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = sleep(delay) => {},
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(device_id = %self.device_id, "poller shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    async fn publish(&self, reading: Reading) {
        let seen_at = reading.timestamp_ms;
        self.readings.send_replace(Some(reading.clone()));

        if let Err(err) = self
            .registry
            .modify(&self.device_id, |state: &mut DeviceState| state.mark_online(seen_at))
        {
            debug!(device_id = %self.device_id, error = %err, "last-seen refresh skipped");
        }

        if let Err(err) = self.sink.sync_reading(&reading).await {
            counter!("poller_sink_failures_total", "device_id" => self.device_id.clone()).increment(1);
            warn!(device_id = %self.device_id, error = %err, "reading sync failed");
        }

        debug!(
            device_id = %self.device_id,
            solar_power = reading.solar_power(),
            output_power = reading.output_power(),
            "reading published"
        );
    }
}
