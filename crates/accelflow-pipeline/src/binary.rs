//! Pipeline binary loading and kernel resolution.

use std::io;
use std::path::Path;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::handle::DeviceHandle;
use accelflow_core::runtime::HandleKind;
use accelflow_core::types::QueueRole;
use tracing::{debug, info};

use crate::config::KernelNames;
use crate::session::Session;
use crate::teardown::TeardownReport;

/// Read a precompiled pipeline image from disk.
///
/// # Errors
/// `BinaryNotFound` if the path does not exist; `BinaryRead` if it cannot be
/// read or is empty.
pub fn load(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => EngineError::BinaryNotFound {
            path: path.to_path_buf(),
        },
        _ => EngineError::BinaryRead {
            path: path.to_path_buf(),
            source,
        },
    })?;
    if bytes.is_empty() {
        return Err(EngineError::BinaryRead {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "file is empty"),
        });
    }
    info!(path = %path.display(), bytes = bytes.len(), "Pipeline binary loaded");
    Ok(bytes)
}

fn kernel_label(stage: QueueRole) -> &'static str {
    match stage {
        QueueRole::Ingest => "ingest kernel",
        QueueRole::Transform => "transform kernel",
        QueueRole::Egress => "egress kernel",
    }
}

/// Resolve one kernel entry point of a built program.
///
/// # Errors
/// `KernelNotFound` if the program exports no kernel called `name`.
pub fn kernel(
    session: &Session,
    program: &DeviceHandle,
    stage: QueueRole,
    name: &str,
) -> Result<DeviceHandle> {
    let runtime = session.runtime();
    let raw = runtime.create_kernel(program.raw()?, name)?;
    debug!(stage = %stage, name, ?raw, "Kernel resolved");
    Ok(DeviceHandle::new(
        runtime.clone(),
        HandleKind::Kernel,
        kernel_label(stage),
        raw,
    ))
}

/// A built program and its three stage kernels.
///
/// Field order is drop order: kernels before the program.
pub struct PipelineProgram {
    ingest: DeviceHandle,
    transform: DeviceHandle,
    egress: DeviceHandle,
    program: DeviceHandle,
}

impl PipelineProgram {
    /// Build `binary` for the session's device and resolve all three kernels.
    ///
    /// # Errors
    /// `BuildRejected` with the runtime build log, or `KernelNotFound` for
    /// the first missing entry point. The program is released on failure.
    pub fn build(session: &Session, binary: &[u8], names: &KernelNames) -> Result<Self> {
        let runtime = session.runtime();
        let raw = runtime.build_program(session.context()?, session.device_handle(), binary)?;
        let program = DeviceHandle::new(runtime.clone(), HandleKind::Program, "program", raw);
        info!(bytes = binary.len(), "Program built");

        let ingest = kernel(session, &program, QueueRole::Ingest, &names.ingest)?;
        let transform = kernel(session, &program, QueueRole::Transform, &names.transform)?;
        let egress = kernel(session, &program, QueueRole::Egress, &names.egress)?;

        Ok(Self {
            ingest,
            transform,
            egress,
            program,
        })
    }

    /// The kernel for `stage`.
    pub fn kernel(&self, stage: QueueRole) -> &DeviceHandle {
        match stage {
            QueueRole::Ingest => &self.ingest,
            QueueRole::Transform => &self.transform,
            QueueRole::Egress => &self.egress,
        }
    }

    /// Release the kernels, then the program. Idempotent.
    pub(crate) fn release_into(&mut self, report: &mut TeardownReport) {
        report.release(&mut self.ingest);
        report.release(&mut self.transform);
        report.release(&mut self.egress);
        report.release(&mut self.program);
    }
}

impl std::fmt::Debug for PipelineProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProgram")
            .field("program", &self.program)
            .field("ingest", &self.ingest)
            .field("transform", &self.transform)
            .field("egress", &self.egress)
            .finish()
    }
}
