//! Simulated device inventory

use meridian_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Static properties of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub id: u32,
    pub name: String,
    /// Device memory budget in bytes
    pub total_memory: usize,
    pub multiprocessor_count: u32,
}

impl DeviceProperties {
    pub fn new(id: u32, total_memory: usize) -> Self {
        Self {
            id,
            name: format!("Meridian GpuSim {id}"),
            total_memory,
            multiprocessor_count: 16,
        }
    }
}

/// The devices available to a session.
///
/// Built explicitly and handed to the providers that need it; there is no
/// process-wide device table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistry {
    devices: Vec<DeviceProperties>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` identical devices with ids `0..count`.
    pub fn with_devices(count: u32, total_memory: usize) -> Self {
        Self {
            devices: (0..count).map(|id| DeviceProperties::new(id, total_memory)).collect(),
        }
    }

    pub fn register(&mut self, properties: DeviceProperties) -> Result<()> {
        if self.devices.iter().any(|device| device.id == properties.id) {
            return Err(Error::invalid_argument(format!(
                "device id {} is already registered",
                properties.id
            )));
        }
        tracing::debug!(id = properties.id, name = %properties.name, total_memory = properties.total_memory, "device_registered");
        self.devices.push(properties);
        Ok(())
    }

    /// Properties of device `id`.
    pub fn device(&self, id: u32) -> Result<&DeviceProperties> {
        self.devices.iter().find(|device| device.id == id).ok_or_else(|| {
            Error::invalid_argument(format!(
                "invalid device id {id}: {} device(s) available",
                self.devices.len()
            ))
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceProperties] {
        &self.devices
    }
}
