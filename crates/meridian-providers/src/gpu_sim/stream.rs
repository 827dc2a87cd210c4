//! Compute streams with deferred errors
//!
//! Work launched on a [`ComputeStream`] never fails at launch time. A fault
//! raised by the device is parked in the stream's error slot, further
//! launches on that stream are dropped, and the fault surfaces when the
//! stream is synchronized. Synchronizing clears the slot so the stream can
//! be used again.
//!
//! ```text
//!   launch ──► launch ──► launch (fault) ──► launch (dropped) ──► synchronize
//!     ok         ok         slot = fault                            Err(fault)
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use meridian_core::Device;
use parking_lot::Mutex;

/// A device-side failure observed at synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    /// Name of the launch that faulted
    pub kernel: String,
    pub message: String,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device fault in '{}': {}", self.kernel, self.message)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    error: Option<DeviceFault>,
    injected: Option<String>,
}

/// An in-order queue of device work.
#[derive(Debug)]
pub struct ComputeStream {
    device: Device,
    state: Mutex<StreamState>,
    launches: AtomicU64,
    dropped: AtomicU64,
}

impl ComputeStream {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: Mutex::new(StreamState::default()),
            launches: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Submit `work`. Its failure, or an injected fault, is deferred to
    /// [`ComputeStream::synchronize`].
    pub fn launch<F>(&self, kernel: &str, work: F)
    where
        F: FnOnce() -> std::result::Result<(), String>,
    {
        self.launches.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.error.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(message) = state.injected.take() {
            tracing::debug!(kernel, device = %self.device, "injected_device_fault");
            state.error = Some(DeviceFault {
                kernel: kernel.to_string(),
                message,
            });
            return;
        }
        drop(state);

        if let Err(message) = work() {
            self.state.lock().error.get_or_insert(DeviceFault {
                kernel: kernel.to_string(),
                message,
            });
        }
    }

    /// Wait for submitted work and report the first deferred fault, if any.
    pub fn synchronize(&self) -> std::result::Result<(), DeviceFault> {
        match self.state.lock().error.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Make the next launch on this stream fault with `message`.
    pub fn inject_fault(&self, message: impl Into<String>) {
        self.state.lock().injected = Some(message.into());
    }

    /// Launches submitted, including dropped ones.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Launches skipped because an earlier one had faulted.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-thread execution context on one device.
#[derive(Debug)]
pub struct ComputeHandle {
    stream: ComputeStream,
    thread: ThreadId,
}

impl ComputeHandle {
    fn new(device: Device, thread: ThreadId) -> Self {
        Self {
            stream: ComputeStream::new(device),
            thread,
        }
    }

    pub fn stream(&self) -> &ComputeStream {
        &self.stream
    }

    /// Thread this handle belongs to.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn synchronize(&self) -> std::result::Result<(), DeviceFault> {
        self.stream.synchronize()
    }
}

type HandleMap = Mutex<HashMap<ThreadId, Arc<ComputeHandle>>>;

/// Removes a thread's entry from a handle map when that thread exits.
struct HandleLease {
    map: Weak<HandleMap>,
    thread: ThreadId,
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if let Some(map) = self.map.upgrade() {
            map.lock().remove(&self.thread);
        }
    }
}

thread_local! {
    static HANDLE_LEASES: RefCell<Vec<HandleLease>> = const { RefCell::new(Vec::new()) };
}

/// One [`ComputeHandle`] per live calling thread, created on first use and
/// dropped when the thread exits.
#[derive(Debug)]
pub struct ComputeHandles {
    device: Device,
    handles: Arc<HandleMap>,
}

impl ComputeHandles {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle of the calling thread.
    pub fn current(&self) -> Arc<ComputeHandle> {
        let thread = std::thread::current().id();
        if let Some(handle) = self.handles.lock().get(&thread) {
            return handle.clone();
        }

        let handle = Arc::new(ComputeHandle::new(self.device, thread));
        let leased = HANDLE_LEASES
            .try_with(|leases| {
                let mut leases = leases.borrow_mut();
                leases.retain(|lease| lease.map.strong_count() > 0);
                leases.push(HandleLease {
                    map: Arc::downgrade(&self.handles),
                    thread,
                });
            })
            .is_ok();
        // a thread already tearing down gets a handle that is not kept
        if leased {
            tracing::trace!(device = %self.device, ?thread, "compute_handle_created");
            self.handles.lock().insert(thread, handle.clone());
        }
        handle
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Synchronize every handle, returning the first fault found.
    pub fn synchronize_all(&self) -> std::result::Result<(), DeviceFault> {
        let handles: Vec<_> = self.handles.lock().values().cloned().collect();
        let mut first = Ok(());
        for handle in handles {
            if let Err(fault) = handle.synchronize() {
                if first.is_ok() {
                    first = Err(fault);
                }
            }
        }
        first
    }
}
