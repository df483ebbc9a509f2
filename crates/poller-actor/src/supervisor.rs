use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use modbus_client::{ClientConfig, ClientError, ClientFactory, DeviceClient};
use registry::{DeviceRegistry, DeviceTeardown};
use types::{
    unix_ms, DeviceConfiguration, DeviceIdentity, DeviceState, Discard, Reading, ReadingHistory,
    ReadingSink,
};

use crate::{ActorConfig, PollerActor, ReadingStream};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("device {0} is not registered")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("device {device_id}: {source}")]
    Client {
        device_id: String,
        #[source]
        source: ClientError,
    },
    #[error("history query failed: {0}")]
    History(#[source] anyhow::Error),
}

struct Session {
    client: Arc<dyn DeviceClient>,
    readings: watch::Receiver<Option<Reading>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns one client and one polling task per connected device. Tasks are
/// independent: a failing or panicking device never stalls the others.
pub struct Supervisor {
    registry: Arc<DeviceRegistry>,
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn ReadingSink>,
    history: Arc<dyn ReadingHistory>,
    config: ActorConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        factory: Arc<dyn ClientFactory>,
        config: ActorConfig,
    ) -> Arc<Self> {
        Self::with_collaborators(registry, factory, config, Arc::new(Discard), Arc::new(Discard))
    }

    /// Also registers the supervisor as the registry's teardown hook.
    pub fn with_collaborators(
        registry: Arc<DeviceRegistry>,
        factory: Arc<dyn ClientFactory>,
        config: ActorConfig,
        sink: Arc<dyn ReadingSink>,
        history: Arc<dyn ReadingHistory>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            registry: registry.clone(),
            factory,
            sink,
            history,
            config,
            sessions: Mutex::new(HashMap::new()),
        });
        let hook: Weak<dyn DeviceTeardown> = Arc::downgrade(&supervisor) as Weak<dyn DeviceTeardown>;
        registry.attach_teardown(hook);
        supervisor
    }

    /// Connects a registered device and starts polling it. An existing
    /// connection for the same id is fully torn down first.
    pub async fn connect(&self, device_id: &str) -> Result<(), SupervisorError> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))?;

        if let Some(previous) = self.take_session(device_id) {
            info!(device_id, "replacing existing connection");
            stop_session(device_id, previous).await;
        }

        let client = self
            .factory
            .create(device_id, self.client_config(&device.identity));
        if let Err(source) = client.connect().await {
            mark_offline(&self.registry, device_id);
            return Err(SupervisorError::Client {
                device_id: device_id.to_string(),
                source,
            });
        }

        let (readings_tx, readings_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let actor = PollerActor::new(
            device_id,
            client.clone(),
            readings_tx,
            self.registry.clone(),
            self.sink.clone(),
            shutdown_rx,
            self.config.clone(),
        );

        if let Err(err) = self
            .registry
            .modify(device_id, |state: &mut DeviceState| state.mark_online(unix_ms()))
        {
            debug!(device_id, error = %err, "online mark skipped");
        }

        let session = Session {
            client,
            readings: readings_rx,
            shutdown: shutdown_tx,
            task: tokio::spawn(actor.run()),
        };
        let raced = self.lock_sessions().insert(device_id.to_string(), session);
        if let Some(raced) = raced {
            debug!(device_id, "concurrent connect superseded");
            stop_session(device_id, raced).await;
        }

        info!(device_id, ip = %device.identity.ip, "device connected");
        Ok(())
    }

    /// Stops polling, drops the stream, closes the client and marks the device
    /// offline. Every step runs even when an earlier one fails.
    pub async fn disconnect(&self, device_id: &str) {
        if let Some(session) = self.take_session(device_id) {
            stop_session(device_id, session).await;
            info!(device_id, "device disconnected");
        }
        mark_offline(&self.registry, device_id);
    }

    /// Tears down every session concurrently.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<(String, Session)> = self.lock_sessions().drain().collect();
        let mut teardowns = JoinSet::new();
        for (device_id, session) in sessions {
            let registry = self.registry.clone();
            teardowns.spawn(async move {
                stop_session(&device_id, session).await;
                mark_offline(&registry, &device_id);
            });
        }
        while let Some(result) = teardowns.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "teardown task failed");
            }
        }
        info!("all devices disconnected");
    }

    pub fn stream(&self, device_id: &str) -> Option<ReadingStream> {
        self.lock_sessions()
            .get(device_id)
            .map(|session| ReadingStream::new(session.readings.clone()))
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock_sessions()
            .get(device_id)
            .map(|session| session.client.is_connected())
            .unwrap_or(false)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn read_configuration(&self, device_id: &str) -> Result<DeviceConfiguration, SupervisorError> {
        let client = self.client(device_id)?;
        client
            .read_configuration()
            .await
            .map_err(|source| SupervisorError::Client {
                device_id: device_id.to_string(),
                source,
            })
    }

    /// No rollback: on failure the device may hold a mix of old and new values.
    pub async fn write_configuration(
        &self,
        device_id: &str,
        config: &DeviceConfiguration,
    ) -> Result<(), SupervisorError> {
        let client = self.client(device_id)?;
        client
            .write_configuration(config)
            .await
            .map_err(|source| SupervisorError::Client {
                device_id: device_id.to_string(),
                source,
            })
    }

    pub async fn query_history(
        &self,
        device_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Reading>, SupervisorError> {
        self.history
            .query_range(device_id, start_ms, end_ms)
            .await
            .map_err(SupervisorError::History)
    }

    fn client(&self, device_id: &str) -> Result<Arc<dyn DeviceClient>, SupervisorError> {
        self.lock_sessions()
            .get(device_id)
            .filter(|session| session.client.is_connected())
            .map(|session| session.client.clone())
            .ok_or_else(|| SupervisorError::NotConnected(device_id.to_string()))
    }

    fn client_config(&self, identity: &DeviceIdentity) -> ClientConfig {
        ClientConfig {
            timeout_ms: self.config.request_timeout.as_millis() as u64,
            tls: self.config.tls.clone(),
            inter_write_delay_ms: self
                .config
                .inter_write_delay
                .map(|delay| delay.as_millis() as u64),
            ..ClientConfig::for_device(identity)
        }
    }

    fn take_session(&self, device_id: &str) -> Option<Session> {
        self.lock_sessions().remove(device_id)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceTeardown for Supervisor {
    async fn teardown(&self, device_id: &str) {
        self.disconnect(device_id).await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for session in self.lock_sessions().values() {
            let _ = session.shutdown.send(true);
        }
    }
}

/// Cancel, wait for the task, then close the client. Waiting is bounded by the
/// client's own I/O timeout since cancellation never interrupts a read.
async fn stop_session(device_id: &str, session: Session) {
    let Session {
        client,
        readings,
        shutdown,
        task,
    } = session;

    if shutdown.send(true).is_err() {
        debug!(device_id, "poller already exited");
    }
    match task.await {
        Ok(()) => {}
        Err(err) if err.is_panic() => warn!(device_id, "poller task panicked"),
        Err(err) => warn!(device_id, error = %err, "poller task join failed"),
    }
    drop(readings);
    client.disconnect().await;
}

fn mark_offline(registry: &DeviceRegistry, device_id: &str) {
    if let Err(err) = registry.modify(device_id, DeviceState::mark_offline) {
        debug!(device_id, error = %err, "offline mark skipped");
    }
}
