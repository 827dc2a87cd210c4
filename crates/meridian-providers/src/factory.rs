//! Provider factories
//!
//! A session registers factories when the provider should be created from
//! configuration at build time rather than handed over ready-made.

use std::fmt;
use std::sync::Arc;

use meridian_core::allocator::ArenaConfig;
use meridian_core::Result;

use crate::cpu::{CpuExecutionProvider, CpuProviderOptions};
use crate::gpu_sim::{DeviceRegistry, GpuSimExecutionProvider, GpuSimProviderOptions};
use crate::provider::ExecutionProvider;

pub trait ProviderFactory: Send + Sync + fmt::Debug {
    fn create_provider(&self) -> Result<Arc<dyn ExecutionProvider>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuProviderFactory {
    pub use_arena: bool,
}

impl Default for CpuProviderFactory {
    fn default() -> Self {
        Self { use_arena: true }
    }
}

impl ProviderFactory for CpuProviderFactory {
    fn create_provider(&self) -> Result<Arc<dyn ExecutionProvider>> {
        Ok(Arc::new(CpuExecutionProvider::new(CpuProviderOptions {
            use_arena: self.use_arena,
            ..CpuProviderOptions::default()
        })))
    }
}

#[derive(Debug, Clone)]
pub struct GpuSimProviderFactory {
    pub device_id: u32,
    pub use_arena: bool,
    pub registry: Arc<DeviceRegistry>,
}

impl GpuSimProviderFactory {
    pub fn new(device_id: u32, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            device_id,
            use_arena: true,
            registry,
        }
    }
}

impl ProviderFactory for GpuSimProviderFactory {
    /// Fails with [`meridian_core::Error::InvalidArgument`] for a device id
    /// the registry does not know.
    fn create_provider(&self) -> Result<Arc<dyn ExecutionProvider>> {
        let options = GpuSimProviderOptions {
            device_id: self.device_id,
            use_arena: self.use_arena,
            arena: ArenaConfig::default(),
        };
        Ok(Arc::new(GpuSimExecutionProvider::new(options, &self.registry)?))
    }
}
