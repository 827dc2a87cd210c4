//! Arena allocator
//!
//! Reserves large chunks from a [`DeviceMemory`] and sub-allocates aligned
//! regions from them. `free` puts a region back on the chunk's free list
//! (coalescing with its neighbours); chunks go back to the device only when
//! the arena itself is dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::allocator::{aligned_size, exhausted, Allocator, AllocatorStats, DeviceMemory, MemoryBlock, MemoryInfo};
use crate::error::Result;

/// How the arena sizes the next chunk when it runs out of space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArenaExtendStrategy {
    /// Double the previous chunk (rounded up to fit the request)
    #[default]
    NextPowerOfTwo,
    /// Reserve exactly what the failing request needs
    SameAsRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the first chunk
    pub initial_chunk_bytes: usize,
    /// Upper bound on bytes reserved from the device
    pub max_bytes: Option<usize>,
    pub extend_strategy: ArenaExtendStrategy,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_chunk_bytes: 1 << 20,
            max_bytes: None,
            extend_strategy: ArenaExtendStrategy::NextPowerOfTwo,
        }
    }
}

struct Chunk {
    block: MemoryBlock,
    /// offset -> length of free regions
    free: BTreeMap<usize, usize>,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    chunk: usize,
    offset: usize,
    len: usize,
}

#[derive(Default)]
struct ArenaState {
    chunks: Vec<Chunk>,
    in_use: HashMap<usize, Region>,
    next_chunk_bytes: usize,
    stats: AllocatorStats,
}

impl ArenaState {
    /// Smallest free region of at least `len` bytes, as (chunk, offset, region_len).
    fn best_fit(&self, len: usize) -> Option<(usize, usize, usize)> {
        self.chunks
            .iter()
            .enumerate()
            .flat_map(|(chunk, c)| {
                c.free
                    .iter()
                    .filter(move |(_, free_len)| **free_len >= len)
                    .map(move |(offset, free_len)| (chunk, *offset, *free_len))
            })
            .min_by_key(|(_, _, free_len)| *free_len)
    }

    fn carve(&mut self, chunk: usize, offset: usize, free_len: usize, len: usize) -> usize {
        let c = &mut self.chunks[chunk];
        c.free.remove(&offset);
        if free_len > len {
            c.free.insert(offset + len, free_len - len);
        }
        let addr = c.block.addr() + offset;
        self.in_use.insert(addr, Region { chunk, offset, len });
        addr
    }

    fn release(&mut self, region: Region) {
        let free = &mut self.chunks[region.chunk].free;
        let mut offset = region.offset;
        let mut len = region.len;

        if let Some((&prev_offset, &prev_len)) = free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(next_len) = free.remove(&(offset + len)) {
            len += next_len;
        }
        free.insert(offset, len);
    }
}

/// Bulk reservation with sub-allocation and free-list reuse.
pub struct ArenaAllocator {
    info: MemoryInfo,
    device: Arc<dyn DeviceMemory>,
    config: ArenaConfig,
    state: Mutex<ArenaState>,
}

impl ArenaAllocator {
    pub fn new(info: MemoryInfo, device: Arc<dyn DeviceMemory>, config: ArenaConfig) -> Self {
        let info = MemoryInfo { arena: true, ..info };
        let state = ArenaState {
            next_chunk_bytes: aligned_size(config.initial_chunk_bytes),
            ..ArenaState::default()
        };
        Self {
            info,
            device,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Number of chunks reserved from the device so far.
    pub fn num_chunks(&self) -> usize {
        self.state.lock().chunks.len()
    }

    fn extend(&self, state: &mut ArenaState, needed: usize, requested: usize) -> Result<()> {
        let mut chunk_bytes = match self.config.extend_strategy {
            ArenaExtendStrategy::NextPowerOfTwo => state.next_chunk_bytes.max(needed.next_power_of_two()),
            ArenaExtendStrategy::SameAsRequested => needed,
        };

        if let Some(max_bytes) = self.config.max_bytes {
            let available = max_bytes.saturating_sub(state.stats.bytes_reserved);
            if needed > available {
                return Err(exhausted(&self.info, requested));
            }
            chunk_bytes = chunk_bytes.min(available);
        }

        let start = Instant::now();
        let block = self
            .device
            .allocate(chunk_bytes)
            .map_err(|_| exhausted(&self.info, requested))?;
        meridian_tracing::performance::record_allocation(
            chunk_bytes,
            &self.info.name,
            &self.info.device.to_string(),
            start.elapsed().as_micros() as u64,
        );

        let mut free = BTreeMap::new();
        free.insert(0, chunk_bytes);
        state.chunks.push(Chunk { block, free });
        state.stats.bytes_reserved += chunk_bytes;
        state.stats.num_device_allocs += 1;
        if self.config.extend_strategy == ArenaExtendStrategy::NextPowerOfTwo {
            state.next_chunk_bytes = chunk_bytes.saturating_mul(2);
        }

        meridian_tracing::perf_event!(
            "arena_extend",
            allocator = self.info.name.as_str(),
            chunk_bytes = chunk_bytes,
            chunks = state.chunks.len(),
            reserved = state.stats.bytes_reserved,
        );
        Ok(())
    }
}

impl Allocator for ArenaAllocator {
    fn info(&self) -> &MemoryInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<MemoryBlock> {
        let needed = aligned_size(size);
        let mut state = self.state.lock();

        let (chunk, offset, free_len) = match state.best_fit(needed) {
            Some(fit) => fit,
            None => {
                self.extend(&mut state, needed, size)?;
                state.best_fit(needed).ok_or_else(|| exhausted(&self.info, size))?
            }
        };

        let addr = state.carve(chunk, offset, free_len, needed);
        state.stats.on_alloc(needed);

        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| exhausted(&self.info, size))?;
        // SAFETY: the region [addr, addr + needed) lies inside a live chunk,
        // is aligned (chunk base and offsets are multiples of ALIGNMENT) and
        // is handed out to nobody else until freed.
        Ok(unsafe { MemoryBlock::from_raw_parts(ptr, size) })
    }

    fn free(&self, block: MemoryBlock) {
        let mut state = self.state.lock();
        match state.in_use.remove(&block.addr()) {
            Some(region) => {
                state.stats.on_free(region.len);
                state.release(region);
            }
            None => {
                tracing::error!(
                    allocator = %self.info.name,
                    addr = block.addr(),
                    "free of a block this arena did not allocate"
                );
            }
        }
    }

    fn stats(&self) -> AllocatorStats {
        self.state.lock().stats
    }
}

impl fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("info", &self.info)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.in_use.is_empty() {
            tracing::warn!(
                allocator = %self.info.name,
                outstanding = state.in_use.len(),
                "arena dropped with blocks still in use"
            );
        }
        for chunk in state.chunks.drain(..) {
            self.device.release(chunk.block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Device, HostMemory, MemoryType, ALIGNMENT};
    use crate::error::Error;

    fn arena(config: ArenaConfig) -> ArenaAllocator {
        ArenaAllocator::new(
            MemoryInfo::new("TestArena", Device::CPU, MemoryType::Default, true),
            Arc::new(HostMemory::new()),
            config,
        )
    }

    fn small_config() -> ArenaConfig {
        ArenaConfig {
            initial_chunk_bytes: 1024,
            ..ArenaConfig::default()
        }
    }

    #[test]
    fn test_sub_allocates_from_one_chunk() {
        let arena = arena(small_config());
        let a = arena.alloc(100).unwrap();
        let b = arena.alloc(100).unwrap();
        assert_eq!(arena.num_chunks(), 1);
        assert_eq!(a.addr() % ALIGNMENT, 0);
        assert_eq!(b.addr() % ALIGNMENT, 0);
        assert_eq!(b.addr() - a.addr(), 128);
        arena.free(a);
        arena.free(b);
        assert_eq!(arena.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_free_returns_to_free_list_not_device() {
        let device = Arc::new(HostMemory::new());
        let arena = ArenaAllocator::new(
            MemoryInfo::new("TestArena", Device::CPU, MemoryType::Default, true),
            device.clone(),
            small_config(),
        );
        let block = arena.alloc(512).unwrap();
        let reserved = device.bytes_reserved();
        arena.free(block);
        assert_eq!(device.bytes_reserved(), reserved);

        for _ in 0..100 {
            let block = arena.alloc(512).unwrap();
            arena.free(block);
        }
        assert_eq!(arena.stats().num_device_allocs, 1);
        assert_eq!(arena.stats().bytes_reserved, reserved);

        drop(arena);
        assert_eq!(device.bytes_reserved(), 0);
    }

    #[test]
    fn test_coalescing_allows_full_chunk_reuse() {
        let arena = arena(small_config());
        let blocks: Vec<_> = (0..16).map(|_| arena.alloc(64).unwrap()).collect();
        assert_eq!(arena.num_chunks(), 1);
        // free in an interleaved order so both neighbour merges are exercised
        let (even, odd): (Vec<_>, Vec<_>) = blocks.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
        for (_, block) in odd {
            arena.free(block);
        }
        for (_, block) in even {
            arena.free(block);
        }
        let whole = arena.alloc(1024).unwrap();
        assert_eq!(arena.num_chunks(), 1);
        arena.free(whole);
    }

    #[test]
    fn test_extends_with_doubling_chunks() {
        let arena = arena(small_config());
        let a = arena.alloc(1024).unwrap();
        let b = arena.alloc(1024).unwrap();
        assert_eq!(arena.num_chunks(), 2);
        assert_eq!(arena.stats().bytes_reserved, 1024 + 2048);
        let c = arena.alloc(5000).unwrap();
        assert_eq!(arena.num_chunks(), 3);
        for block in [a, b, c] {
            arena.free(block);
        }
    }

    #[test]
    fn test_max_bytes_reports_device_allocation_error() {
        let arena = arena(ArenaConfig {
            initial_chunk_bytes: 256,
            max_bytes: Some(512),
            extend_strategy: ArenaExtendStrategy::SameAsRequested,
        });
        let a = arena.alloc(512).unwrap();
        match arena.alloc(1) {
            Err(Error::DeviceAllocation { requested, allocator, .. }) => {
                assert_eq!(requested, 1);
                assert_eq!(allocator, "TestArena");
            }
            other => panic!("expected allocation failure, got {other:?}"),
        }
        arena.free(a);
        assert!(arena.alloc(1).is_ok());
    }

    #[test]
    fn test_device_exhaustion_is_not_retried() {
        let device = Arc::new(HostMemory::with_capacity("Tiny", Device::gpu(0), Some(1024)));
        let arena = ArenaAllocator::new(
            MemoryInfo::new("TinyArena", Device::gpu(0), MemoryType::Default, true),
            device,
            ArenaConfig {
                initial_chunk_bytes: 4096,
                ..ArenaConfig::default()
            },
        );
        let err = arena.alloc(10).unwrap_err();
        assert!(matches!(err, Error::DeviceAllocation { requested: 10, .. }));
        assert_eq!(arena.stats().num_device_allocs, 0);
    }
}
