//! The device-memory driver collaborator.
//!
//! This boundary is intentionally out of scope for the allocator's own
//! correctness: the allocator only ever calls through [`DeviceDriver`].
//! [`SystemDriver`] is the one concrete, fully working implementation
//! shipped here, backing every location with
//! page-aligned memory from the ordinary system allocator so the crate is
//! buildable and testable without a real GPU present. An integrator linking
//! an actual CUDA/ROCm/Level-Zero binding implements `DeviceDriver` against
//! that library and calls [`install`] once, before the first allocation.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Page alignment used for driver-backed allocations.
const PAGE_ALIGN: usize = 4096;

/// Error surface for the driver collaborator.
///
/// `is_unloading` lets the free path distinguish a graceful teardown (the
/// device context going away) from a genuinely fatal condition.
#[derive(Debug, thiserror::Error)]
#[error("driver error: {message}")]
pub struct DriverError {
    message: String,
    unloading: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), unloading: false }
    }

    pub fn unloading(message: impl Into<String>) -> Self {
        Self { message: message.into(), unloading: true }
    }

    /// Whether this error represents the driver/device context tearing down,
    /// as opposed to a genuine fault.
    pub fn is_unloading(&self) -> bool {
        self.unloading
    }
}

/// The opaque pair of allocate/free entry points for device and page-locked
/// host memory, plus a per-thread stream synchronization primitive, that the
/// pool/arena tiers treat as given.
pub trait DeviceDriver: Send + Sync {
    /// Number of addressable device indices. `Pool::new`/`pool_new` validate
    /// `gpu` against this rather than only the build constant `D_MAX`.
    fn device_count(&self) -> u32;

    fn alloc_device(&self, device: u32, bytes: usize) -> Result<NonNull<u8>, DriverError>;
    fn free_device(&self, device: u32, ptr: NonNull<u8>, bytes: usize) -> Result<(), DriverError>;

    fn alloc_host_pinned(&self, bytes: usize) -> Result<NonNull<u8>, DriverError>;
    fn free_host_pinned(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), DriverError>;

    /// Synchronizes the calling thread's stream for `device`. A no-op for
    /// host arenas.
    fn stream_sync(&self, device: u32) -> Result<(), DriverError>;
}

/// Reference [`DeviceDriver`] backing every location with page-aligned
/// system-allocator memory. `stream_sync` is a no-op since there is no real
/// device stream to wait on.
#[derive(Debug, Default)]
pub struct SystemDriver;

impl SystemDriver {
    fn layout(bytes: usize) -> Layout {
        Layout::from_size_align(bytes.max(1), PAGE_ALIGN).expect("layout overflow")
    }

    fn raw_alloc(bytes: usize) -> Result<NonNull<u8>, DriverError> {
        let layout = Self::layout(bytes);
        // SAFETY: layout has non-zero size and a valid power-of-two alignment.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| DriverError::new(format!("out of memory allocating {bytes} bytes")))
    }

    fn raw_free(ptr: NonNull<u8>, bytes: usize) {
        let layout = Self::layout(bytes);
        // SAFETY: `ptr` was returned by `raw_alloc` with the same `bytes`/layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

impl DeviceDriver for SystemDriver {
    fn device_count(&self) -> u32 {
        crate::config::D_MAX
    }

    fn alloc_device(&self, _device: u32, bytes: usize) -> Result<NonNull<u8>, DriverError> {
        Self::raw_alloc(bytes)
    }

    fn free_device(&self, _device: u32, ptr: NonNull<u8>, bytes: usize) -> Result<(), DriverError> {
        Self::raw_free(ptr, bytes);
        Ok(())
    }

    fn alloc_host_pinned(&self, bytes: usize) -> Result<NonNull<u8>, DriverError> {
        Self::raw_alloc(bytes)
    }

    fn free_host_pinned(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), DriverError> {
        Self::raw_free(ptr, bytes);
        Ok(())
    }

    fn stream_sync(&self, _device: u32) -> Result<(), DriverError> {
        Ok(())
    }
}

static DRIVER: OnceCell<Arc<dyn DeviceDriver>> = OnceCell::new();

/// Installs the process-wide driver. Must be called before the first
/// allocation; returns the rejected driver if one was already installed
/// (whether explicitly, or implicitly via [`installed`]'s default).
pub fn install(driver: Arc<dyn DeviceDriver>) -> Result<(), Arc<dyn DeviceDriver>> {
    DRIVER.set(driver)
}

/// Returns the installed driver, lazily installing [`SystemDriver`] as the
/// default on first access.
pub fn installed() -> Arc<dyn DeviceDriver> {
    DRIVER.get_or_init(|| Arc::new(SystemDriver) as Arc<dyn DeviceDriver>).clone()
}
