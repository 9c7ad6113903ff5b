//! One-time kernel argument binding.
//!
//! ```text
//! ingest    ← (input buffer, width, height)
//! transform ← (width, height)
//! egress    ← (output buffer, width, height)
//! ```
//!
//! [`bind`] consumes the program and both buffers, so a session can be bound
//! exactly once and the arguments are fixed for its lifetime.

use accelflow_core::error::{EngineError, Result};
use accelflow_core::runtime::KernelArg;
use accelflow_core::types::{BufferRole, FrameDims, QueueRole};
use serde::Serialize;
use tracing::{debug, info};

use crate::binary::PipelineProgram;
use crate::buffers::DeviceBuffer;
use crate::session::Session;
use crate::teardown::TeardownReport;

/// Value bound to one kernel argument slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundArg {
    Buffer(BufferRole),
    Int(i32),
}

/// One `(kernel, slot) ← value` association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub stage: QueueRole,
    pub index: u32,
    pub arg: BoundArg,
}

/// The complete argument table, in the order it was applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KernelBindings {
    pub entries: Vec<Binding>,
}

impl KernelBindings {
    /// Table for frames of `dims`.
    pub fn for_dims(dims: FrameDims) -> Self {
        let (w, h) = (BoundArg::Int(dims.width_arg()), BoundArg::Int(dims.height_arg()));
        let entry = |stage, index, arg| Binding { stage, index, arg };
        Self {
            entries: vec![
                entry(QueueRole::Ingest, 0, BoundArg::Buffer(BufferRole::Input)),
                entry(QueueRole::Ingest, 1, w),
                entry(QueueRole::Ingest, 2, h),
                entry(QueueRole::Transform, 0, w),
                entry(QueueRole::Transform, 1, h),
                entry(QueueRole::Egress, 0, BoundArg::Buffer(BufferRole::Output)),
                entry(QueueRole::Egress, 1, w),
                entry(QueueRole::Egress, 2, h),
            ],
        }
    }

    /// Bindings of one kernel.
    pub fn for_stage(&self, stage: QueueRole) -> impl Iterator<Item = &Binding> {
        self.entries.iter().filter(move |b| b.stage == stage)
    }
}

/// Program and buffers with their arguments bound.
///
/// Field order is drop order: input buffer, output buffer, then the program
/// (which drops its kernels before itself).
pub struct BoundPipeline {
    pub(crate) input: DeviceBuffer,
    pub(crate) output: DeviceBuffer,
    pub(crate) program: PipelineProgram,
    dims: FrameDims,
    bindings: KernelBindings,
}

impl BoundPipeline {
    pub fn dims(&self) -> FrameDims {
        self.dims
    }

    pub fn bindings(&self) -> &KernelBindings {
        &self.bindings
    }

    pub fn program(&self) -> &PipelineProgram {
        &self.program
    }

    /// Release the input buffer, the output buffer, the kernels and the
    /// program, in that order. Idempotent.
    pub(crate) fn release_into(&mut self, report: &mut TeardownReport) {
        self.input.release_into(report);
        self.output.release_into(report);
        self.program.release_into(report);
    }

    fn buffer(&self, role: BufferRole) -> &DeviceBuffer {
        match role {
            BufferRole::Input => &self.input,
            BufferRole::Output => &self.output,
        }
    }

    fn apply(&self, session: &Session) -> Result<()> {
        let runtime = session.runtime();
        for binding in &self.bindings.entries {
            let arg = match binding.arg {
                BoundArg::Buffer(role) => KernelArg::Buffer(self.buffer(role).raw()?),
                BoundArg::Int(v) => KernelArg::Int(v),
            };
            let kernel = self.program.kernel(binding.stage).raw()?;
            runtime.set_kernel_arg(kernel, binding.index, arg)?;
            debug!(stage = %binding.stage, index = binding.index, ?arg, "Kernel argument bound");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BoundPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPipeline")
            .field("dims", &self.dims)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("program", &self.program)
            .finish()
    }
}

/// Bind buffers and dimensions to the three kernels.
///
/// # Errors
/// `InvariantViolation` if the buffers are swapped, `BufferTooSmall` if
/// either holds fewer than `dims.byte_len()` bytes, or the runtime's error
/// if an argument is rejected. Everything passed in is released on failure.
pub fn bind(
    session: &Session,
    program: PipelineProgram,
    input: DeviceBuffer,
    output: DeviceBuffer,
    dims: FrameDims,
) -> Result<BoundPipeline> {
    let pipeline = BoundPipeline {
        input,
        output,
        program,
        dims,
        bindings: KernelBindings::for_dims(dims),
    };

    for (buffer, role) in [
        (&pipeline.input, BufferRole::Input),
        (&pipeline.output, BufferRole::Output),
    ] {
        if buffer.role() != role {
            return Err(EngineError::InvariantViolation(format!(
                "{} buffer passed in the {role} slot",
                buffer.role()
            )));
        }
        if buffer.len() < dims.byte_len() {
            return Err(EngineError::BufferTooSmall {
                need: dims.byte_len(),
                have: buffer.len(),
            });
        }
    }

    pipeline.apply(session)?;
    info!(
        dims = %dims,
        args = pipeline.bindings.entries.len(),
        "Kernel arguments bound"
    );
    Ok(pipeline)
}
