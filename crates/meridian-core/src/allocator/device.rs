//! Raw device memory
//!
//! [`DeviceMemory`] is the bottom of the allocation stack: one call per
//! device reservation. [`HostMemory`] serves ordinary host memory, page
//! locked (pinned) host memory, and, with a capacity budget, the memory of
//! simulated devices.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::allocator::{aligned_size, Device, MemoryBlock, ALIGNMENT};
use crate::error::{Error, Result};

/// One reservation per call, released individually.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    fn device(&self) -> Device;

    /// Reserve `size` bytes. Fails with [`Error::DeviceAllocation`] when the
    /// device is out of memory.
    fn allocate(&self, size: usize) -> Result<MemoryBlock>;

    /// Release a block returned by [`DeviceMemory::allocate`] on this device.
    fn release(&self, block: MemoryBlock);

    /// Bytes currently reserved on the device.
    fn bytes_reserved(&self) -> usize;
}

/// Host memory with an optional capacity budget.
pub struct HostMemory {
    label: String,
    device: Device,
    capacity: Option<usize>,
    reserved: AtomicUsize,
    lock_pages: bool,
}

impl HostMemory {
    /// Unbounded host memory for the CPU.
    pub fn new() -> Self {
        Self::with_capacity("Cpu", Device::CPU, None)
    }

    /// Host memory tagged as belonging to `device`, limited to `capacity` bytes.
    pub fn with_capacity(label: impl Into<String>, device: Device, capacity: Option<usize>) -> Self {
        Self {
            label: label.into(),
            device,
            capacity,
            reserved: AtomicUsize::new(0),
            lock_pages: false,
        }
    }

    /// Page-locked host memory. Locking is best effort: without the
    /// privilege to lock pages the memory is still usable, only pageable.
    pub fn pinned(label: impl Into<String>) -> Self {
        Self {
            lock_pages: true,
            ..Self::with_capacity(label, Device::CPU, None)
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(aligned_size(size), ALIGNMENT)
            .map_err(|e| Error::invalid_argument(format!("invalid allocation layout for {size} bytes: {e}")))
    }

    fn exhausted(&self, requested: usize) -> Error {
        Error::DeviceAllocation {
            requested,
            allocator: self.label.clone(),
            device: self.device.to_string(),
        }
    }

    fn reserve_budget(&self, bytes: usize) -> bool {
        let Some(capacity) = self.capacity else {
            self.reserved.fetch_add(bytes, Ordering::AcqRel);
            return true;
        };
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .is_ok()
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("label", &self.label)
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .field("lock_pages", &self.lock_pages)
            .finish()
    }
}

impl DeviceMemory for HostMemory {
    fn device(&self) -> Device {
        self.device
    }

    fn allocate(&self, size: usize) -> Result<MemoryBlock> {
        let layout = Self::layout(size)?;
        if !self.reserve_budget(layout.size()) {
            return Err(self.exhausted(size));
        }

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.reserved.fetch_sub(layout.size(), Ordering::AcqRel);
            return Err(self.exhausted(size));
        };

        if self.lock_pages && !lock_pages(ptr, layout.size()) {
            tracing::debug!(label = %self.label, bytes = layout.size(), "page locking unavailable, using pageable memory");
        }

        // SAFETY: ptr is a fresh, ALIGNMENT-aligned region of layout.size() >= size bytes.
        Ok(unsafe { MemoryBlock::from_raw_parts(ptr, size) })
    }

    fn release(&self, block: MemoryBlock) {
        let Ok(layout) = Self::layout(block.size()) else {
            tracing::error!(label = %self.label, size = block.size(), "release of block with invalid layout");
            return;
        };
        if self.lock_pages {
            unlock_pages(block.non_null(), layout.size());
        }
        // SAFETY: block came from `allocate` with the same aligned layout.
        unsafe { dealloc(block.as_ptr(), layout) };
        self.reserved.fetch_sub(layout.size(), Ordering::AcqRel);
    }

    fn bytes_reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

#[cfg(unix)]
fn lock_pages(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: the range is a live allocation owned by the caller.
    unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, size) == 0 }
}

#[cfg(unix)]
fn unlock_pages(ptr: NonNull<u8>, size: usize) {
    // SAFETY: same range as passed to `lock_pages`; unlocking unlocked pages is harmless.
    unsafe {
        libc::munlock(ptr.as_ptr() as *const libc::c_void, size);
    }
}

#[cfg(not(unix))]
fn lock_pages(_ptr: NonNull<u8>, _size: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_pages(_ptr: NonNull<u8>, _size: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed_and_aligned() {
        let memory = HostMemory::new();
        let block = memory.allocate(100).unwrap();
        assert_eq!(block.size(), 100);
        assert_eq!(block.addr() % ALIGNMENT, 0);
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(memory.bytes_reserved(), 128);
        memory.release(block);
        assert_eq!(memory.bytes_reserved(), 0);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let memory = HostMemory::with_capacity("GpuSim", Device::gpu(0), Some(256));
        let a = memory.allocate(200).unwrap();
        let err = memory.allocate(64).unwrap_err();
        match err {
            Error::DeviceAllocation {
                requested,
                allocator,
                device,
            } => {
                assert_eq!(requested, 64);
                assert_eq!(allocator, "GpuSim");
                assert_eq!(device, "gpu:0");
            }
            other => panic!("unexpected error: {other}"),
        }
        memory.release(a);
        assert!(memory.allocate(256).is_ok());
    }

    #[test]
    fn test_pinned_memory_round_trip() {
        let memory = HostMemory::pinned("CpuPinned");
        let block = memory.allocate(4096).unwrap();
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0xAB, block.size()) };
        memory.release(block);
        assert_eq!(memory.bytes_reserved(), 0);
    }
}
