//! Process-wide device manager.
//!
//! Maps device ids to their [`DeviceContext`]. A context lives from
//! [`DeviceManager::attach`] until [`DeviceManager::detach`]; nothing is
//! collected implicitly.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dpbridge_core::InboundBus;
use tracing::info;

use crate::config::EngineConfig;
use crate::context::{Collaborators, DeviceContext, DeviceError};
use crate::identity::DeviceIdentity;
use crate::profiles::DeviceProfile;

/// Registry of attached devices.
pub struct DeviceManager {
    devices: DashMap<String, Arc<DeviceContext>>,
    bus: InboundBus,
    config: EngineConfig,
}

impl DeviceManager {
    pub fn new(bus: InboundBus, config: EngineConfig) -> Self {
        Self {
            devices: DashMap::new(),
            bus,
            config,
        }
    }

    pub fn bus(&self) -> &InboundBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attach and start a device.
    ///
    /// Fails with [`DeviceError::AlreadyAttached`] if the id is in use; the
    /// existing context is left running.
    pub fn attach(
        &self,
        device_id: impl Into<String>,
        identity: DeviceIdentity,
        profile: DeviceProfile,
        collaborators: Collaborators,
    ) -> Result<Arc<DeviceContext>, DeviceError> {
        let device_id = device_id.into();
        match self.devices.entry(device_id.clone()) {
            Entry::Occupied(_) => Err(DeviceError::AlreadyAttached(device_id)),
            Entry::Vacant(slot) => {
                let ctx = DeviceContext::attach(
                    device_id,
                    identity,
                    profile,
                    collaborators,
                    self.config.clone(),
                );
                ctx.start(&self.bus);
                slot.insert(ctx.clone());
                Ok(ctx)
            }
        }
    }

    /// Detach a device and cancel its tasks.
    pub fn detach(&self, device_id: &str) -> Result<(), DeviceError> {
        let (_, ctx) = self
            .devices
            .remove(device_id)
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;
        ctx.detach();
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceContext>> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Attached device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Detach every device.
    pub fn shutdown(&self) {
        let ids = self.device_ids();
        for id in &ids {
            if let Some((_, ctx)) = self.devices.remove(id) {
                ctx.detach();
            }
        }
        info!("Device manager shut down, {} devices detached", ids.len());
    }
}
