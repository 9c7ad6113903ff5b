//! Compute runtime trait: the contract between the orchestrator and a vendor
//! compute-offload API.
//!
//! Handles crossing this boundary are opaque [`RawHandle`] values. Ownership
//! of every handle returned by a `create_*`/`build_*` call passes to the
//! caller, which must hand it back through [`ComputeRuntime::release`]
//! exactly once. [`crate::handle::DeviceHandle`] does that bookkeeping.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use serde::Serialize;

use crate::error::Result;
use crate::types::{DeviceClass, MapMode};

/// Opaque runtime object handle (platform, device, context, queue, program,
/// kernel or memory object).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(usize);

impl RawHandle {
    /// Wrap a non-null driver pointer.
    #[inline]
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr as usize))
        }
    }

    /// Wrap an integer id (used by runtimes that are not pointer based).
    #[inline]
    pub const fn from_id(id: usize) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    #[inline]
    pub fn id(self) -> usize {
        self.0
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// What a [`RawHandle`] refers to, for release dispatch and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Queue => "queue",
            Self::Program => "program",
            Self::Kernel => "kernel",
            Self::Buffer => "buffer",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute platform (one vendor ICD).
#[derive(Clone, Debug, Serialize)]
pub struct PlatformInfo {
    pub index: usize,
    #[serde(skip)]
    pub handle: RawHandle,
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// A device exposed by a platform.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    #[serde(skip)]
    pub handle: RawHandle,
    pub name: String,
    pub class: DeviceClass,
    pub global_mem_bytes: u64,
}

/// A fixed kernel argument value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelArg {
    /// A memory object handle.
    Buffer(RawHandle),
    /// A 32-bit signed integer scalar.
    Int(i32),
}

/// Vendor compute API used by the orchestrator.
///
/// All calls are issued from the single orchestrating thread. Queues are
/// in-order and independent of each other; the runtime provides no ordering
/// between work on different queues.
pub trait ComputeRuntime: Send + Sync {
    /// Short runtime identifier for logs (`"opencl"`, `"sim"`).
    fn name(&self) -> &'static str;

    /// Enumerate compute platforms.
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Enumerate devices of `class` on `platform`. An empty list is not an error.
    fn devices(&self, platform: &PlatformInfo, class: DeviceClass) -> Result<Vec<DeviceInfo>>;

    /// Create one context bound to `device`.
    fn create_context(&self, device: RawHandle) -> Result<RawHandle>;

    /// Create an in-order command queue on `context` for `device`.
    fn create_queue(&self, context: RawHandle, device: RawHandle) -> Result<RawHandle>;

    /// Create and build a program from a precompiled binary image.
    ///
    /// Rejections surface as `EngineError::BuildRejected` carrying the
    /// runtime's build log.
    fn build_program(&self, context: RawHandle, device: RawHandle, binary: &[u8])
    -> Result<RawHandle>;

    /// Resolve a named kernel entry point. Missing names surface as
    /// `EngineError::KernelNotFound`.
    fn create_kernel(&self, program: RawHandle, name: &str) -> Result<RawHandle>;

    /// Allocate `bytes` of device memory the host may map without a copy.
    fn create_buffer(&self, context: RawHandle, bytes: usize) -> Result<RawHandle>;

    /// Bind a kernel argument slot.
    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: KernelArg) -> Result<()>;

    /// Enqueue a single work-item task. Returns once queued, not once complete.
    fn enqueue_task(&self, queue: RawHandle, kernel: RawHandle) -> Result<()>;

    /// Block until all work on `queue` has completed.
    fn finish(&self, queue: RawHandle) -> Result<()>;

    /// Blocking map of the first `bytes` of `buffer` into host memory.
    ///
    /// The returned pointer is valid for `bytes` bytes until the matching
    /// [`unmap_buffer`](Self::unmap_buffer) call.
    fn map_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        mode: MapMode,
        bytes: usize,
    ) -> Result<NonNull<u8>>;

    /// Release a mapping obtained from [`map_buffer`](Self::map_buffer).
    ///
    /// Enqueued on `queue` without waiting for it; work submitted later on
    /// the same queue is ordered after the unmap.
    fn unmap_buffer(&self, queue: RawHandle, buffer: RawHandle, ptr: NonNull<u8>) -> Result<()>;

    /// Release one reference to a runtime object.
    fn release(&self, kind: HandleKind, handle: RawHandle) -> Result<()>;
}
