use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use crate::address::HandleId;
use crate::config::DeviceConfig;
use crate::worker::{Worker, WorkerHandle};
use crate::Error;

struct InventoryShared {
    workers: HashMap<HandleId, WorkerHandle>,
}

/// Keeps one worker per hardware resource, so two devices can never talk over the same
/// link at the same time.
#[derive(Clone)]
pub struct Inventory(Arc<Mutex<InventoryShared>>);

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        let inner = InventoryShared {
            workers: Default::default(),
        };
        Self(Arc::new(Mutex::new(inner)))
    }

    fn lock(&self) -> MutexGuard<InventoryShared> {
        self.0.lock().unwrap_or_else(|x| x.into_inner())
    }

    /// Returns the worker of `device`, spawning it if needed. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self, device: &DeviceConfig) -> crate::Result<WorkerHandle> {
        let id = device.address()?.handle_id();
        let mut inner = self.lock();
        if let Some(ret) = inner.workers.get(&id) {
            if ret.is_alive() {
                if ret.name() != device.name {
                    return Err(Error::argument(anyhow!(
                        "{} and {} share the resource {}",
                        ret.name(),
                        device.name,
                        id
                    )));
                }
                return Ok(ret.clone());
            }
        }
        log::debug!("Spawning worker for {} on {}", device.name, id);
        let handle = WorkerHandle::spawn(Worker::new(device)?);
        inner.workers.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn disconnect(&self, device: &DeviceConfig) -> crate::Result<()> {
        let id = device.address()?.handle_id();
        log::debug!("Dropping worker: {}", id);
        if let Some(x) = self.lock().workers.remove(&id) {
            x.disconnect();
        }
        Ok(())
    }

    pub fn disconnect_all(&self) {
        log::debug!("Dropping all workers");
        for (_, x) in self.lock().workers.drain() {
            x.disconnect();
        }
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ret: Vec<String> = inner.workers.keys().map(|x| x.to_string()).collect();
        ret.sort();
        ret
    }
}
