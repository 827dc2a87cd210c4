//! Timing helpers for kernels, allocations and device transfers.
//!
//! ```rust
//! use meridian_tracing::performance::{record_allocation, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("Add/node_0", Some(100));
//! drop(span); // logged only if it took at least 100μs
//!
//! record_allocation(4096, "CpuArena", "cpu:0", 3);
//! ```

use std::time::Instant;
use tracing::Level;

/// RAII timer. Logs `performance_span_complete` with the elapsed time when
/// dropped, unless the elapsed time is below the threshold.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing `name`. `threshold_us = None` always logs.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start timing `name` with the span created at `level`.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying `tracing` span.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    fn should_log(&self, elapsed_us: u64) -> bool {
        self.threshold_us.map_or(true, |threshold| elapsed_us >= threshold)
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.should_log(elapsed_us) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record one allocator request.
///
/// `allocator` is the allocator name (e.g. `CpuArena`), `device` the device
/// it carves memory from.
pub fn record_allocation(size_bytes: usize, allocator: &str, device: &str, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        allocator,
        device,
        duration_us,
        "memory_allocation"
    );
}

/// Record one kernel execution.
pub fn record_kernel(op_type: &str, node: &str, provider: &str, elements: usize, duration_us: u64) {
    let elements_per_sec = per_second(elements, duration_us);
    tracing::debug!(
        event = "kernel",
        op_type,
        node,
        provider,
        elements,
        duration_us,
        melems_per_sec = elements_per_sec / 1_000_000.0,
        "kernel_complete"
    );
}

/// Record a tensor copy between devices with its bandwidth.
pub fn record_transfer(bytes: usize, source: &str, destination: &str, duration_us: u64) {
    let bandwidth_mbps = per_second(bytes, duration_us) / (1024.0 * 1024.0);
    tracing::debug!(
        event = "transfer",
        bytes,
        source,
        destination,
        duration_us,
        bandwidth_mbps,
        "data_transfer"
    );
}

fn per_second(amount: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        0.0
    } else {
        amount as f64 / duration_us as f64 * 1_000_000.0
    }
}
