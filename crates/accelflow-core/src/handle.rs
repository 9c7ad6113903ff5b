//! Owned runtime handles with idempotent release.
//!
//! Every context, queue, program, kernel and buffer the orchestrator creates
//! lives in a [`DeviceHandle`]. Release happens exactly once: either through
//! an explicit [`DeviceHandle::release`] (the teardown sequence) or on drop
//! (early-return and partial-setup paths). Drop never panics; failures are
//! logged.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::runtime::{ComputeRuntime, HandleKind, RawHandle};

/// An owned runtime object handle.
pub struct DeviceHandle {
    runtime: Arc<dyn ComputeRuntime>,
    kind: HandleKind,
    label: &'static str,
    raw: Option<RawHandle>,
}

impl DeviceHandle {
    /// Take ownership of `raw`. `label` names the object in logs
    /// (`"ingest queue"`, `"input buffer"`, ...).
    pub fn new(
        runtime: Arc<dyn ComputeRuntime>,
        kind: HandleKind,
        label: &'static str,
        raw: RawHandle,
    ) -> Self {
        Self {
            runtime,
            kind,
            label,
            raw: Some(raw),
        }
    }

    /// The live raw handle.
    ///
    /// # Errors
    /// `InvariantViolation` once the handle has been released.
    pub fn raw(&self) -> Result<RawHandle> {
        self.raw.ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} used after release", self.label))
        })
    }

    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    /// Release the handle. Returns `Ok(false)` if it was already released.
    ///
    /// The handle counts as released even when the runtime reports an error,
    /// so a failing release is never retried.
    pub fn release(&mut self) -> Result<bool> {
        let Some(raw) = self.raw.take() else {
            return Ok(false);
        };
        debug!(kind = %self.kind, label = self.label, ?raw, "Releasing");
        self.runtime.release(self.kind, raw)?;
        Ok(true)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(label = self.label, error = %err, "Release failed during drop");
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("raw", &self.raw)
            .finish()
    }
}
