//! Host-mappable device buffers.
//!
//! A [`DeviceBuffer`] is only ever touched by the host through a scoped
//! mapping guard. Guards borrow the buffer mutably, so a buffer has at most
//! one outstanding mapping, and the slice they expose cannot outlive the
//! mapping. Every buffer of a session shares one [`MapFence`]; the frame
//! driver refuses to submit work while the fence reports an open mapping.
//!
//! Each buffer maps on the queue of the stage that accesses it (input on
//! ingest, output on egress), so map and unmap are ordered against that
//! stage's task by queue order.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use accelflow_core::error::{EngineError, Result};
use accelflow_core::handle::DeviceHandle;
use accelflow_core::runtime::{HandleKind, RawHandle};
use accelflow_core::types::{BufferRole, MapMode};
use tracing::{debug, trace, warn};

use crate::session::{DeviceMemory, Session};
use crate::teardown::TeardownReport;

// ─── Map fence ──────────────────────────────────────────────────────────────

/// Count of host mappings currently open across a session's buffers.
#[derive(Clone, Debug, Default)]
pub struct MapFence {
    open: Arc<AtomicUsize>,
}

impl MapFence {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn open_mappings(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Fail if any buffer is mapped. `what` names the blocked operation.
    pub fn check(&self, what: &str) -> Result<()> {
        match self.open_mappings() {
            0 => Ok(()),
            n => Err(EngineError::InvariantViolation(format!(
                "{what} attempted while {n} buffer mapping(s) are open"
            ))),
        }
    }

    fn enter(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─── Device buffer ──────────────────────────────────────────────────────────

fn buffer_label(role: BufferRole) -> &'static str {
    match role {
        BufferRole::Input => "input buffer",
        BufferRole::Output => "output buffer",
    }
}

/// A single-channel byte buffer in host-accessible device memory.
pub struct DeviceBuffer {
    handle: DeviceHandle,
    role: BufferRole,
    bytes: usize,
    queue: RawHandle,
    fence: MapFence,
    memory: Arc<DeviceMemory>,
}

impl DeviceBuffer {
    /// Allocate `bytes` of host-mappable device memory for `role`.
    ///
    /// # Errors
    /// `AllocationFailed` if `bytes` is zero, exceeds the device's remaining
    /// global memory, or the runtime refuses the allocation.
    pub fn allocate(session: &Session, role: BufferRole, bytes: usize) -> Result<Self> {
        let fail = |reason: String| EngineError::AllocationFailed {
            role,
            bytes,
            reason,
        };
        if bytes == 0 {
            return Err(fail("zero-sized buffer".into()));
        }
        if let Some(headroom) = session.memory().headroom()
            && bytes as u64 > headroom
        {
            return Err(fail(format!("exceeds remaining device memory ({headroom} bytes)")));
        }

        let queue = session.queue(role.queue())?;
        let runtime = session.runtime();
        let raw = runtime
            .create_buffer(session.context()?, bytes)
            .map_err(|e| fail(e.to_string()))?;
        let handle =
            DeviceHandle::new(runtime.clone(), HandleKind::Buffer, buffer_label(role), raw);
        session.memory().on_alloc(bytes);
        debug!(role = %role, bytes, ?raw, "Buffer allocated");

        Ok(Self {
            handle,
            role,
            bytes,
            queue,
            fence: session.fence().clone(),
            memory: session.memory().clone(),
        })
    }

    #[inline]
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Allocated size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    /// Map for host writes. Prior contents are unspecified.
    pub fn map_write(&mut self) -> Result<MappedWrite<'_>> {
        Ok(MappedWrite(self.map(MapMode::Write)?))
    }

    /// Map for host reads.
    pub fn map_read(&mut self) -> Result<MappedRead<'_>> {
        Ok(MappedRead(self.map(MapMode::Read)?))
    }

    /// Map for reads and writes; the slice holds the current contents.
    pub fn map_read_write(&mut self) -> Result<MappedWrite<'_>> {
        Ok(MappedWrite(self.map(MapMode::ReadWrite)?))
    }

    fn map(&mut self, mode: MapMode) -> Result<Mapping<'_>> {
        let role = self.role;
        let raw = self.handle.raw()?;
        let ptr = self
            .handle
            .runtime()
            .map_buffer(self.queue, raw, mode, self.bytes)
            .map_err(|e| EngineError::MapFailed {
                role,
                reason: e.to_string(),
            })?;
        self.fence.enter();
        trace!(role = %role, ?mode, "Buffer mapped");
        Ok(Mapping {
            buffer: self,
            ptr,
            live: true,
        })
    }

    /// Release the memory object. Idempotent.
    pub(crate) fn release_into(&mut self, report: &mut TeardownReport) {
        if self.handle.is_live() {
            self.memory.on_free(self.bytes);
        }
        report.release(&mut self.handle);
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // The handle field releases itself after this runs.
        if self.handle.is_live() {
            self.memory.on_free(self.bytes);
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("role", &self.role)
            .field("bytes", &self.bytes)
            .field("handle", &self.handle)
            .finish()
    }
}

// ─── Mapping guards ─────────────────────────────────────────────────────────

struct Mapping<'a> {
    buffer: &'a mut DeviceBuffer,
    ptr: NonNull<u8>,
    live: bool,
}

impl Mapping<'_> {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr maps `len` bytes until unmap, and unmap consumes the guard.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.bytes) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; the guard holds the only borrow of the buffer.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.buffer.bytes) }
    }

    fn unmap(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        let buffer = &*self.buffer;
        let role = buffer.role;
        buffer
            .handle
            .runtime()
            .unmap_buffer(buffer.queue, buffer.handle.raw()?, self.ptr)
            .map_err(|e| EngineError::MapFailed {
                role,
                reason: format!("unmap: {e}"),
            })?;
        // A failed unmap leaves the fence raised so nothing can be submitted.
        buffer.fence.exit();
        trace!(role = %role, "Buffer unmapped");
        Ok(())
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            warn!(role = %self.buffer.role, error = %err, "Unmap failed during drop");
        }
    }
}

/// Read-only view of a mapped buffer.
pub struct MappedRead<'a>(Mapping<'a>);

/// Writable view of a mapped buffer.
pub struct MappedWrite<'a>(Mapping<'a>);

impl MappedRead<'_> {
    /// Unmap now and surface any failure. Dropping the guard also unmaps but
    /// only logs failures.
    pub fn unmap(mut self) -> Result<()> {
        self.0.unmap()
    }
}

impl MappedWrite<'_> {
    /// Unmap now and surface any failure.
    pub fn unmap(mut self) -> Result<()> {
        self.0.unmap()
    }
}

impl Deref for MappedRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Deref for MappedWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl DerefMut for MappedWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }
}
