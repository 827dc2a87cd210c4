//! Simulated GPU execution provider
//!
//! A discrete accelerator with its own memory budget, asynchronous streams
//! and late error reporting, backed by host memory. It exercises everything
//! a real device backend needs from the engine (separate device memory,
//! pinned staging buffers, boundary copies, per-thread stream state and
//! deferred faults) without requiring hardware.
//!
//! # Architecture
//!
//! ```text
//! GpuSimExecutionProvider
//! ├── DeviceProperties   - from the session's DeviceRegistry
//! ├── Default allocator  - arena or direct over the device memory budget
//! ├── CpuPinned          - page-locked host staging memory
//! ├── Cpu                - host memory visible to the device
//! ├── ComputeHandles     - one stream per calling thread
//! └── Kernels            - Add, Sub, Mul, Relu, Identity (f32)
//! ```

pub mod device;
pub mod kernels;
pub mod stream;

pub use device::{DeviceProperties, DeviceRegistry};
pub use kernels::{DeviceKernel, DeviceOpKernel, Enqueued};
pub use stream::{ComputeHandle, ComputeHandles, ComputeStream, DeviceFault};

use std::sync::Arc;
use std::time::Instant;

use meridian_core::allocator::{ArenaAllocator, ArenaConfig, DirectAllocator, HostMemory};
use meridian_core::{Allocator, Device, Error, MemoryInfo, MemoryType, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::kernel::KernelRegistry;
use crate::provider::{ExecutionProvider, GPU_SIM_EXECUTION_PROVIDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSimProviderOptions {
    pub device_id: u32,
    pub use_arena: bool,
    pub arena: ArenaConfig,
}

impl Default for GpuSimProviderOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            use_arena: true,
            arena: ArenaConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct GpuSimExecutionProvider {
    options: GpuSimProviderOptions,
    properties: DeviceProperties,
    device: Device,
    device_allocator: Arc<dyn Allocator>,
    pinned_allocator: Arc<dyn Allocator>,
    cpu_allocator: Arc<dyn Allocator>,
    handles: Arc<ComputeHandles>,
    registry: KernelRegistry,
}

impl GpuSimExecutionProvider {
    /// Create a provider for `options.device_id`, which must exist in `devices`.
    pub fn new(options: GpuSimProviderOptions, devices: &DeviceRegistry) -> Result<Self> {
        let properties = devices.device(options.device_id)?.clone();
        let device = Device::gpu(properties.id);
        let memory = Arc::new(HostMemory::with_capacity(
            "GpuSim",
            device,
            Some(properties.total_memory),
        ));

        let device_allocator: Arc<dyn Allocator> = if options.use_arena {
            Arc::new(ArenaAllocator::new(
                MemoryInfo::new("GpuSimArena", device, MemoryType::Default, true),
                memory,
                options.arena,
            ))
        } else {
            Arc::new(DirectAllocator::new(
                MemoryInfo::new("GpuSim", device, MemoryType::Default, false),
                memory,
            ))
        };
        let pinned_allocator: Arc<dyn Allocator> = Arc::new(DirectAllocator::new(
            MemoryInfo::new("GpuSimPinned", Device::CPU, MemoryType::CpuPinned, false),
            Arc::new(HostMemory::pinned("GpuSimPinned")),
        ));
        let cpu_allocator: Arc<dyn Allocator> = Arc::new(DirectAllocator::new(
            MemoryInfo::new("GpuSimCpu", Device::CPU, MemoryType::Cpu, false),
            Arc::new(HostMemory::new()),
        ));

        let handles = Arc::new(ComputeHandles::new(device));
        let mut registry = KernelRegistry::new();
        kernels::register_kernels(&mut registry, GPU_SIM_EXECUTION_PROVIDER, &handles);

        tracing::info!(
            device = %device,
            name = %properties.name,
            total_memory = properties.total_memory,
            use_arena = options.use_arena,
            "gpu_sim_provider_created"
        );

        Ok(Self {
            options,
            properties,
            device,
            device_allocator,
            pinned_allocator,
            cpu_allocator,
            handles,
            registry,
        })
    }

    pub fn options(&self) -> &GpuSimProviderOptions {
        &self.options
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Compute handle of the calling thread.
    pub fn compute_handle(&self) -> Arc<ComputeHandle> {
        self.handles.current()
    }
}

impl ExecutionProvider for GpuSimExecutionProvider {
    fn name(&self) -> &str {
        GPU_SIM_EXECUTION_PROVIDER
    }

    fn device(&self) -> Device {
        self.device
    }

    fn allocators(&self) -> Vec<Arc<dyn Allocator>> {
        vec![
            self.device_allocator.clone(),
            self.pinned_allocator.clone(),
            self.cpu_allocator.clone(),
        ]
    }

    fn kernel_registry(&self) -> &KernelRegistry {
        &self.registry
    }

    fn copy_tensor(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        let (from, to) = (src.device(), dst.device());
        if !self.can_copy(from, to) {
            return Err(Error::invalid_argument(format!(
                "provider '{}' cannot copy from {from} to {to}",
                self.name()
            )));
        }
        let start = Instant::now();
        dst.copy_from(src)?;
        meridian_tracing::performance::record_transfer(
            src.size_bytes(),
            &from.to_string(),
            &to.to_string(),
            start.elapsed().as_micros() as u64,
        );
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.handles
            .synchronize_all()
            .map_err(|fault| Error::compute(fault.kernel, "Synchronize", fault.message))
    }
}
