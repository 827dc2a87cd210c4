//! Direct allocator: one device call per request.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{aligned_size, exhausted, Allocator, AllocatorStats, DeviceMemory, HostMemory, MemoryBlock, MemoryInfo};
use crate::allocator::{Device, MemoryType};
use crate::error::Result;

#[derive(Default)]
struct DirectState {
    /// addr -> aligned size
    live: HashMap<usize, usize>,
    stats: AllocatorStats,
}

/// Forwards every request to the device. Useful for diagnostics and when
/// arena fragmentation is undesirable.
pub struct DirectAllocator {
    info: MemoryInfo,
    device: Arc<dyn DeviceMemory>,
    state: Mutex<DirectState>,
}

impl DirectAllocator {
    pub fn new(info: MemoryInfo, device: Arc<dyn DeviceMemory>) -> Self {
        Self {
            info: MemoryInfo { arena: false, ..info },
            device,
            state: Mutex::new(DirectState::default()),
        }
    }

    /// Plain host memory, no arena.
    pub fn host() -> Self {
        Self::new(
            MemoryInfo::new("Cpu", Device::CPU, MemoryType::Cpu, false),
            Arc::new(HostMemory::new()),
        )
    }
}

impl Allocator for DirectAllocator {
    fn info(&self) -> &MemoryInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<MemoryBlock> {
        let block = self.device.allocate(size).map_err(|_| exhausted(&self.info, size))?;
        let bytes = aligned_size(size);

        let mut state = self.state.lock();
        state.live.insert(block.addr(), bytes);
        state.stats.on_alloc(bytes);
        state.stats.bytes_reserved += bytes;
        state.stats.num_device_allocs += 1;
        Ok(block)
    }

    fn free(&self, block: MemoryBlock) {
        let mut state = self.state.lock();
        match state.live.remove(&block.addr()) {
            Some(bytes) => {
                state.stats.on_free(bytes);
                state.stats.bytes_reserved = state.stats.bytes_reserved.saturating_sub(bytes);
                drop(state);
                self.device.release(block);
            }
            None => {
                tracing::error!(
                    allocator = %self.info.name,
                    addr = block.addr(),
                    "free of a block this allocator did not allocate"
                );
            }
        }
    }

    fn stats(&self) -> AllocatorStats {
        self.state.lock().stats
    }
}

impl fmt::Debug for DirectAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectAllocator")
            .field("info", &self.info)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_each_request_hits_the_device() {
        let device = Arc::new(HostMemory::new());
        let allocator = DirectAllocator::new(
            MemoryInfo::new("CpuDirect", Device::CPU, MemoryType::Default, false),
            device.clone(),
        );
        let a = allocator.alloc(10).unwrap();
        let b = allocator.alloc(10).unwrap();
        assert_eq!(allocator.stats().num_device_allocs, 2);
        assert_eq!(device.bytes_reserved(), 128);

        allocator.free(a);
        assert_eq!(device.bytes_reserved(), 64);
        allocator.free(b);
        assert_eq!(device.bytes_reserved(), 0);
        assert!(!allocator.info().arena);
    }

    #[test]
    fn test_exhaustion_names_the_allocator() {
        let allocator = DirectAllocator::new(
            MemoryInfo::new("GpuSimDirect", Device::gpu(1), MemoryType::Default, false),
            Arc::new(HostMemory::with_capacity("GpuSim", Device::gpu(1), Some(64))),
        );
        let held = allocator.alloc(64).unwrap();
        let err = allocator.alloc(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Device allocation failed: requested 1 bytes from allocator 'GpuSimDirect' on gpu:1"
        );
        assert!(matches!(err, Error::DeviceAllocation { .. }));
        allocator.free(held);
    }
}
