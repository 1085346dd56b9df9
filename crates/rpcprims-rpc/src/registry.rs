use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::server::{ServerState, SimpleServer};
use crate::service::Service;

/// Handle for a server held in a [`ServerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerId(usize);

impl ServerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

/// Fixed number of slots for servers addressed by [`ServerId`].
///
/// Every operation on an id that is not registered fails with
/// [`RpcError::ServerNotFound`].
pub struct ServerRegistry {
    slots: RwLock<Vec<Option<Arc<SimpleServer>>>>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::with_capacity(RpcConfig::default().max_servers)
    }
}

impl ServerRegistry {
    pub fn new(config: &RpcConfig) -> Self {
        Self::with_capacity(config.max_servers)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `server` in the first free slot.
    pub fn init(&self, server: Arc<SimpleServer>) -> Result<ServerId> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let capacity = slots.len();
        let Some(index) = slots.iter().position(Option::is_none) else {
            return Err(RpcError::RegistryFull(capacity));
        };
        let channel = server.channel();
        slots[index] = Some(server);
        let id = ServerId(index);
        info!(%id, %channel, "server registered");
        Ok(id)
    }

    /// Replace the server under `id`, stopping the previous one.
    pub fn reinit(&self, id: ServerId, server: Arc<SimpleServer>) -> Result<Arc<SimpleServer>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(RpcError::ServerNotFound(id))?;
        let previous = std::mem::replace(slot, server);
        previous.stop();
        info!(%id, "server reinitialized");
        Ok(previous)
    }

    /// Remove and stop the server under `id`.
    pub fn deinit(&self, id: ServerId) -> Result<Arc<SimpleServer>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let server = slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(RpcError::ServerNotFound(id))?;
        server.stop();
        info!(%id, "server removed");
        Ok(server)
    }

    pub fn get(&self, id: ServerId) -> Result<Arc<SimpleServer>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0)
            .and_then(Option::clone)
            .ok_or(RpcError::ServerNotFound(id))
    }

    /// Ids of all registered servers, in slot order.
    pub fn ids(&self) -> Vec<ServerId> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| ServerId(index))
            .collect()
    }

    pub fn add_service(&self, id: ServerId, service: Arc<dyn Service>) -> Result<()> {
        self.get(id)?.add_service(service);
        Ok(())
    }

    pub fn remove_service(&self, id: ServerId, service_id: u32) -> Result<Option<Arc<dyn Service>>> {
        Ok(self.get(id)?.remove_service(service_id))
    }

    pub fn set_crc_start(&self, id: ServerId, start: u16) -> Result<()> {
        self.get(id)?.set_crc_start(start);
        Ok(())
    }

    /// Run the server under `id` until it stops. The registry is not locked
    /// while it runs.
    pub fn run(&self, id: ServerId) -> Result<()> {
        let server = self.get(id)?;
        debug!(%id, "running registered server");
        server.run()
    }

    pub fn poll(&self, id: ServerId) -> Result<ServerState> {
        self.get(id)?.poll()
    }

    pub fn stop(&self, id: ServerId) -> Result<()> {
        self.get(id)?.stop();
        Ok(())
    }

    pub fn flush(&self, id: ServerId) -> Result<()> {
        self.get(id)?.flush()
    }
}
