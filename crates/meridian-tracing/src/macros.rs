//! Instrumentation shorthands.

/// Start a [`crate::performance::PerformanceSpan`], optionally with extra fields.
///
/// ```rust
/// use meridian_tracing::perf_span;
///
/// {
///     let _span = perf_span!("batch_norm", channels = 3, elements = 1024);
///     // ... kernel body ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::debug!(name = $name, $($field = $value),+, "perf_span_start");
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug event tagged with `event = $name`.
///
/// ```rust
/// use meridian_tracing::perf_event;
///
/// perf_event!("arena_extend", chunk_bytes = 1 << 20, chunks = 2);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::debug!(event = $name, $($field = $value),+);
    };
}

/// Evaluate a block and return `(value, elapsed_microseconds)`.
///
/// ```rust
/// use meridian_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::debug!(operation = $name, duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
