//! Device allocators
//!
//! Every execution provider owns one [`Allocator`] per memory class it
//! exposes. Allocators carve memory out of a [`DeviceMemory`], the raw
//! device interface, in one of two ways:
//!
//! ```text
//!            ┌────────────────────┐        ┌────────────────────┐
//!            │   ArenaAllocator   │        │  DirectAllocator   │
//!            │ chunks + free list │        │ 1 request = 1 call │
//!            └─────────┬──────────┘        └─────────┬──────────┘
//!                      │  few large reservations      │ every request
//!                      └──────────────┬───────────────┘
//!                                     ▼
//!                        ┌────────────────────────┐
//!                        │  DeviceMemory (trait)  │
//!                        │ HostMemory / simulated │
//!                        └────────────────────────┘
//! ```
//!
//! Exhaustion is reported as [`Error::DeviceAllocation`] and never retried.

mod arena;
mod device;
mod direct;

pub use arena::{ArenaAllocator, ArenaConfig, ArenaExtendStrategy};
pub use device::{DeviceMemory, HostMemory};
pub use direct::DirectAllocator;

use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Alignment of every block handed out by Meridian allocators.
pub const ALIGNMENT: usize = 64;

/// Round `size` up to a multiple of [`ALIGNMENT`] (at least one unit).
pub const fn aligned_size(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Memory class requested from a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    /// The provider's own device memory
    Default,
    /// Page-locked host memory usable for asynchronous transfers
    CpuPinned,
    /// Ordinary host memory the provider reads inputs from or writes outputs to
    Cpu,
}

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// A device identity: kind plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: u32,
}

impl Device {
    pub const CPU: Device = Device {
        kind: DeviceKind::Cpu,
        id: 0,
    };

    pub const fn gpu(id: u32) -> Self {
        Device {
            kind: DeviceKind::Gpu,
            id,
        }
    }

    pub const fn is_host(&self) -> bool {
        matches!(self.kind, DeviceKind::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu:{}", self.id),
            DeviceKind::Gpu => write!(f, "gpu:{}", self.id),
        }
    }
}

/// Describes where an allocator's memory lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryInfo {
    /// Allocator name, e.g. `CpuArena`
    pub name: String,
    pub device: Device,
    pub memory_type: MemoryType,
    /// True for arena-backed allocators
    pub arena: bool,
}

impl MemoryInfo {
    pub fn new(name: impl Into<String>, device: Device, memory_type: MemoryType, arena: bool) -> Self {
        Self {
            name: name.into(),
            device,
            memory_type,
            arena,
        }
    }
}

/// A region of device memory. Must be returned to the allocator (or device)
/// that produced it exactly once.
#[derive(Debug)]
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a block is an exclusive handle to its region; the region itself is
// plain memory with no thread affinity.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Wrap a raw region.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size` bytes (at least one byte when
    /// `size == 0`) aligned to [`ALIGNMENT`], valid until the block is freed.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    /// Placeholder that owns nothing; never passed to `free`.
    pub(crate) fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            size: 0,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Usable size in bytes, as requested.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address, used as a lookup key by allocators.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// Counters every allocator keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes currently handed out (aligned sizes)
    pub bytes_in_use: usize,
    pub peak_bytes_in_use: usize,
    /// Bytes reserved from the device
    pub bytes_reserved: usize,
    pub num_allocs: u64,
    pub num_frees: u64,
    /// Calls into the device
    pub num_device_allocs: u64,
}

impl AllocatorStats {
    pub(crate) fn on_alloc(&mut self, bytes: usize) {
        self.bytes_in_use += bytes;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
        self.num_allocs += 1;
    }

    pub(crate) fn on_free(&mut self, bytes: usize) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(bytes);
        self.num_frees += 1;
    }
}

/// Uniform allocation interface. Implementations are internally synchronized.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn info(&self) -> &MemoryInfo;

    /// Allocate at least `size` bytes aligned to [`ALIGNMENT`].
    fn alloc(&self, size: usize) -> Result<MemoryBlock>;

    /// Return a block obtained from [`Allocator::alloc`] on this allocator.
    fn free(&self, block: MemoryBlock);

    fn stats(&self) -> AllocatorStats;
}

/// The allocation error every allocator reports on exhaustion.
pub(crate) fn exhausted(info: &MemoryInfo, requested: usize) -> Error {
    Error::DeviceAllocation {
        requested,
        allocator: info.name.clone(),
        device: info.device.to_string(),
    }
}
