//! CPU execution provider
//!
//! Host memory through an arena (default) or a direct allocator, and the
//! full kernel catalog in [`kernels`].

pub mod kernels;

use std::sync::Arc;

use meridian_core::allocator::{ArenaAllocator, ArenaConfig, DirectAllocator, HostMemory};
use meridian_core::{Allocator, Device, Error, MemoryInfo, MemoryType, Result};
use serde::{Deserialize, Serialize};

use crate::kernel::KernelRegistry;
use crate::provider::{ExecutionProvider, CPU_EXECUTION_PROVIDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuProviderOptions {
    /// Serve tensors from an arena instead of one heap call per tensor
    pub use_arena: bool,
    pub arena: ArenaConfig,
}

impl Default for CpuProviderOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena: ArenaConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct CpuExecutionProvider {
    options: CpuProviderOptions,
    allocator: Arc<dyn Allocator>,
    registry: KernelRegistry,
}

impl CpuExecutionProvider {
    pub fn new(options: CpuProviderOptions) -> Self {
        let memory = Arc::new(HostMemory::new());
        let allocator: Arc<dyn Allocator> = if options.use_arena {
            Arc::new(ArenaAllocator::new(
                MemoryInfo::new("CpuArena", Device::CPU, MemoryType::Default, true),
                memory,
                options.arena,
            ))
        } else {
            Arc::new(DirectAllocator::new(
                MemoryInfo::new("Cpu", Device::CPU, MemoryType::Default, false),
                memory,
            ))
        };

        let mut registry = KernelRegistry::new();
        kernels::register_kernels(&mut registry, CPU_EXECUTION_PROVIDER);
        tracing::debug!(
            use_arena = options.use_arena,
            kernels = registry.len(),
            "cpu_provider_created"
        );

        Self {
            options,
            allocator,
            registry,
        }
    }

    pub fn options(&self) -> &CpuProviderOptions {
        &self.options
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new(CpuProviderOptions::default())
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn name(&self) -> &str {
        CPU_EXECUTION_PROVIDER
    }

    fn device(&self) -> Device {
        Device::CPU
    }

    fn allocators(&self) -> Vec<Arc<dyn Allocator>> {
        vec![self.allocator.clone()]
    }

    /// Device memory is host memory here, so `Cpu` and `Default` share one allocator.
    fn allocator(&self, memory_type: MemoryType) -> Result<Arc<dyn Allocator>> {
        match memory_type {
            MemoryType::Default | MemoryType::Cpu => Ok(self.allocator.clone()),
            MemoryType::CpuPinned => Err(Error::UnsupportedMemoryType {
                provider: CPU_EXECUTION_PROVIDER.to_string(),
                memory_type,
            }),
        }
    }

    fn kernel_registry(&self) -> &KernelRegistry {
        &self.registry
    }
}
