//! Intra-op thread pool
//!
//! A fixed set of worker threads created once per session and used by
//! kernels to split data-parallel loops:
//!
//! - [`ThreadPool::parallel_for`] delivers each index of `[0, count)` to the
//!   body exactly once.
//! - [`ThreadPool::batch_parallel_for`] groups indices into contiguous
//!   batches, one schedulable task per batch.
//! - [`ThreadPool::parallel_chunks_mut`] hands out disjoint mutable chunks of
//!   an output buffer.
//!
//! Every call blocks until all work has completed. The calling thread does
//! not take part: it hands the region to the workers and waits, so a pool
//! of `n` keeps `n` threads computing while the caller sits idle.
//!
//! # Sizing
//!
//! | requested | workers |
//! |-----------|---------|
//! | `0`       | `max(1, available_parallelism / 2)` |
//! | `1`       | none; bodies run inline on the calling thread |
//! | `n`       | `n` |
//!
//! # Nested regions
//!
//! A body must not open another parallel region on the same pool. Doing so
//! from a worker thread returns [`Error::NestedParallelRegion`] rather than
//! risking a deadlock. The inline pool has no workers and runs nested calls
//! sequentially.

use std::fmt;
use std::ops::Range;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{Error, Result};

/// Fixed-size worker pool for data-parallel kernel loops.
pub struct ThreadPool {
    pool: Option<rayon::ThreadPool>,
    num_threads: usize,
}

impl ThreadPool {
    /// Create a pool with `num_threads` workers (see the module docs for 0 and 1).
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = match num_threads {
            0 => default_num_threads(),
            n => n,
        };

        if num_threads == 1 {
            return Ok(Self::inline());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("meridian-intra-op-{index}"))
            .build()
            .map_err(|err| Error::ThreadPool(format!("failed to build intra-op pool: {err}")))?;

        tracing::debug!(num_threads, "intra_op_pool_created");
        Ok(Self {
            pool: Some(pool),
            num_threads,
        })
    }

    /// No worker threads: every region runs on the caller.
    pub fn inline() -> Self {
        Self {
            pool: None,
            num_threads: 1,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn is_inline(&self) -> bool {
        self.pool.is_none()
    }

    /// Run `body(i)` once for every `i` in `[0, count)`.
    pub fn parallel_for<F>(&self, count: usize, body: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        if count == 0 {
            return Ok(());
        }
        match self.worker_pool()? {
            None => (0..count).for_each(body),
            Some(pool) => pool.install(|| (0..count).into_par_iter().for_each(&body)),
        }
        Ok(())
    }

    /// Fallible [`ThreadPool::parallel_for`]; returns one of the errors if any body fails.
    pub fn try_parallel_for<F>(&self, count: usize, body: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + Sync,
    {
        if count == 0 {
            return Ok(());
        }
        match self.worker_pool()? {
            None => (0..count).try_for_each(body),
            Some(pool) => pool.install(|| (0..count).into_par_iter().try_for_each(&body)),
        }
    }

    /// Run `body(i)` for every `i` in `[0, count)`, scheduling contiguous
    /// batches of `batch_size` indices as single tasks.
    ///
    /// A `batch_size` of 0 or at least `count` yields a single task.
    pub fn batch_parallel_for<F>(&self, count: usize, body: F, batch_size: usize) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        if count == 0 {
            return Ok(());
        }
        let batches = partition_batches(count, batch_size);
        match self.worker_pool()? {
            None => batches.into_iter().flatten().for_each(body),
            Some(pool) => pool.install(|| {
                batches
                    .into_par_iter()
                    .with_max_len(1)
                    .for_each(|batch| batch.for_each(&body))
            }),
        }
        Ok(())
    }

    /// Split `data` into chunks of `chunk_len` elements and run
    /// `body(chunk_index, chunk)` on each. A `chunk_len` of 0 means one chunk.
    pub fn parallel_chunks_mut<T, F>(&self, data: &mut [T], chunk_len: usize, body: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if data.is_empty() {
            return Ok(());
        }
        let chunk_len = if chunk_len == 0 { data.len() } else { chunk_len };
        match self.worker_pool()? {
            None => data
                .chunks_mut(chunk_len)
                .enumerate()
                .for_each(|(index, chunk)| body(index, chunk)),
            Some(pool) => pool.install(|| {
                data.par_chunks_mut(chunk_len)
                    .enumerate()
                    .for_each(|(index, chunk)| body(index, chunk))
            }),
        }
        Ok(())
    }

    fn worker_pool(&self) -> Result<Option<&rayon::ThreadPool>> {
        match &self.pool {
            Some(pool) if pool.current_thread_index().is_some() => Err(Error::NestedParallelRegion),
            other => Ok(other.as_ref()),
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("inline", &self.is_inline())
            .finish()
    }
}

/// Worker count used when the caller asks for 0: half the hardware threads, at least one.
pub fn default_num_threads() -> usize {
    let hardware = std::thread::available_parallelism().map_or(1, |n| n.get());
    (hardware / 2).max(1)
}

/// Contiguous index ranges covering `[0, count)` in batches of `batch_size`.
///
/// `batch_size == 0` or `batch_size >= count` gives one batch; `count == 0` gives none.
pub fn partition_batches(count: usize, batch_size: usize) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    if batch_size == 0 || batch_size >= count {
        return vec![0..count];
    }
    (0..count)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(count))
        .collect()
}
