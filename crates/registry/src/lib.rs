//! Authoritative set of known devices.
//!
//! Every mutation clones the current snapshot, applies the change and installs
//! the result as a new revision in one step, so readers always see a complete
//! snapshot. Writers are serialized; revisions are published in the order they
//! were applied.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use types::DeviceState;

const REVISION_CAPACITY: usize = 256;

/// One immutable revision of the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub revision: u64,
    pub devices: BTreeMap<String, DeviceState>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&DeviceState> {
        self.devices.get(id)
    }

    pub fn list(&self) -> Vec<DeviceState> {
        self.devices.values().cloned().collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device {0} already exists")]
    AlreadyExists(String),
    #[error("device {0} not found")]
    NotFound(String),
}

/// Tears down a device's live connection before the registry forgets it.
#[async_trait]
pub trait DeviceTeardown: Send + Sync {
    async fn teardown(&self, device_id: &str);
}

#[derive(Debug)]
pub struct DeviceRegistry {
    current: watch::Sender<Arc<RegistrySnapshot>>,
    revisions: broadcast::Sender<Arc<RegistrySnapshot>>,
    write_lock: Mutex<()>,
    teardown: RwLock<Option<Weak<dyn DeviceTeardown>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        let (revisions, _) = broadcast::channel(REVISION_CAPACITY);
        Self {
            current,
            revisions,
            write_lock: Mutex::new(()),
            teardown: RwLock::new(None),
        }
    }

    /// Registers the collaborator that `remove` calls before dropping a device.
    /// Held weakly so the registry never keeps its owner alive.
    pub fn attach_teardown(&self, hook: Weak<dyn DeviceTeardown>) {
        let mut slot = self.teardown.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(hook);
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.borrow())
    }

    pub fn list(&self) -> Vec<DeviceState> {
        self.snapshot().list()
    }

    pub fn get(&self, id: &str) -> Option<DeviceState> {
        self.snapshot().get(id).cloned()
    }

    /// Latest snapshot, then every later one that is still current when read.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.current.subscribe()
    }

    /// Every revision committed after this call, in commit order. Receivers
    /// that fall more than 256 revisions behind observe a lag error.
    pub fn revisions(&self) -> broadcast::Receiver<Arc<RegistrySnapshot>> {
        self.revisions.subscribe()
    }

    /// Inserts a device that is not yet known.
    pub fn upsert(&self, device: DeviceState) -> Result<(), RegistryError> {
        let id = device.id().to_string();
        self.commit(|devices| {
            if devices.contains_key(&id) {
                return Err(RegistryError::AlreadyExists(id.clone()));
            }
            devices.insert(id.clone(), device);
            Ok(())
        })?;
        info!(device_id = %id, "device added");
        Ok(())
    }

    /// Replaces a known device wholesale.
    pub fn update(&self, device: DeviceState) -> Result<(), RegistryError> {
        let id = device.id().to_string();
        self.commit(|devices| match devices.get_mut(&id) {
            Some(slot) => {
                *slot = device;
                Ok(())
            }
            None => Err(RegistryError::NotFound(id.clone())),
        })?;
        debug!(device_id = %id, "device updated");
        Ok(())
    }

    /// Read-modify-write of a single device within one revision.
    pub fn modify<F>(&self, id: &str, change: F) -> Result<DeviceState, RegistryError>
    where
        F: FnOnce(&mut DeviceState),
    {
        self.commit(|devices| match devices.get_mut(id) {
            Some(device) => {
                change(device);
                Ok(device.clone())
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        })
    }

    /// Tears down the device's connection first, then removes it.
    pub async fn remove(&self, id: &str) -> Result<DeviceState, RegistryError> {
        if self.get(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        let hook = self
            .teardown
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(hook) = hook {
            hook.teardown(id).await;
        }

        let removed = self.commit(|devices| {
            devices
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))
        })?;
        info!(device_id = %id, "device removed");
        Ok(removed)
    }

    fn commit<T, F>(&self, mutate: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut BTreeMap<String, DeviceState>) -> Result<T, RegistryError>,
    {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let mut devices = current.devices.clone();
        let value = mutate(&mut devices)?;

        let next = Arc::new(RegistrySnapshot {
            revision: current.revision + 1,
            devices,
        });
        self.current.send_replace(Arc::clone(&next));
        let _ = self.revisions.send(next);
        Ok(value)
    }
}
