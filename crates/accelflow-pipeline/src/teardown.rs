//! Teardown sequencing.
//!
//! Resources are released in strict reverse-of-creation order:
//!
//! ```text
//! input buffer → output buffer → ingest/transform/egress kernels → program
//!   → ingest/transform/egress queues → context
//! ```
//!
//! The explicit path is [`crate::Orchestrator::shutdown`], which records each
//! release in a [`TeardownReport`]. Every other exit path relies on field
//! declaration order: owners declare buffers before the program, kernels
//! before the program, and queues before the context, so `Drop` follows the
//! same sequence. Teardown never fails; release errors are logged and
//! recorded.

use accelflow_core::handle::DeviceHandle;
use serde::Serialize;
use tracing::warn;

/// Release order of a fully set-up pipeline, by handle label.
pub const TEARDOWN_ORDER: [&str; 10] = [
    "input buffer",
    "output buffer",
    "ingest kernel",
    "transform kernel",
    "egress kernel",
    "program",
    "ingest queue",
    "transform queue",
    "egress queue",
    "context",
];

/// A release call that the runtime rejected.
#[derive(Clone, Debug, Serialize)]
pub struct ReleaseFailure {
    pub label: &'static str,
    pub error: String,
}

/// Outcome of an explicit teardown.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TeardownReport {
    /// Labels of every handle released, in release order. Includes handles
    /// whose release failed.
    pub released: Vec<&'static str>,
    pub failures: Vec<ReleaseFailure>,
}

impl TeardownReport {
    /// Release one handle and record the result. Already-released handles
    /// are skipped.
    pub(crate) fn release(&mut self, handle: &mut DeviceHandle) {
        let label = handle.label();
        match handle.release() {
            Ok(false) => {}
            Ok(true) => self.released.push(label),
            Err(err) => {
                warn!(label, error = %err, "Release failed during teardown");
                self.released.push(label);
                self.failures.push(ReleaseFailure {
                    label,
                    error: err.to_string(),
                });
            }
        }
    }

    /// True if every release succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
