//! Setup → run → shutdown.

use std::sync::Arc;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::frame_io::{FrameDisplay, FrameSource};
use accelflow_core::runtime::ComputeRuntime;
use accelflow_core::types::{BufferRole, FrameDims};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::binary::{self, PipelineProgram};
use crate::binder::{self, BoundPipeline, KernelBindings};
use crate::buffers::DeviceBuffer;
use crate::config::PipelineConfig;
use crate::driver::{self, FrameCycleDriver, RunSummary};
use crate::session::Session;
use crate::teardown::TeardownReport;

/// A fully set-up accelerator pipeline.
///
/// Field order is drop order: buffers, kernels and program go before the
/// session's queues and context, so dropping an `Orchestrator` on any path
/// (including unwinding) follows the teardown sequence.
pub struct Orchestrator {
    pipeline: BoundPipeline,
    session: Session,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Load the binary named by `config.binary` and set up the pipeline.
    ///
    /// # Errors
    /// `Config` if no binary path is configured, plus everything
    /// [`Orchestrator::setup_with_image`] reports.
    pub fn setup(runtime: Arc<dyn ComputeRuntime>, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let path = config
            .binary
            .as_deref()
            .ok_or_else(|| EngineError::Config("no pipeline binary configured".into()))?;
        // Read before touching the device so a bad path never opens a session.
        let image = binary::load(path)?;
        Self::setup_with_image(runtime, config, &image)
    }

    /// Set up the pipeline from an in-memory binary image.
    ///
    /// Order: session, program, kernels, input buffer, output buffer,
    /// argument binding. A failure at any step releases everything created
    /// before it, so a missing kernel never allocates a buffer.
    pub fn setup_with_image(
        runtime: Arc<dyn ComputeRuntime>,
        config: &PipelineConfig,
        image: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        let dims = config.dims()?;

        let session = Session::open(runtime, &config.device)?;
        let program = PipelineProgram::build(&session, image, &config.kernels)?;
        let input = DeviceBuffer::allocate(&session, BufferRole::Input, dims.byte_len())?;
        let output = DeviceBuffer::allocate(&session, BufferRole::Output, dims.byte_len())?;
        let pipeline = binder::bind(&session, program, input, output, dims)?;

        let (current, peak) = session.memory_usage();
        info!(
            dims = %dims,
            device = %session.device().name,
            buffer_bytes = current,
            peak_bytes = peak,
            "Pipeline ready"
        );
        Ok(Self {
            pipeline,
            session,
            config: config.clone(),
        })
    }

    pub fn dims(&self) -> FrameDims {
        self.pipeline.dims()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn bindings(&self) -> &KernelBindings {
        self.pipeline.bindings()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the frame loop until a stop condition or the first error.
    ///
    /// The pipeline stays set up either way; call [`Orchestrator::shutdown`]
    /// (or drop) afterwards.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        display: &mut dyn FrameDisplay,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        driver::check_source_dims(source, self.pipeline.dims())?;
        let mut driver = FrameCycleDriver::new(
            &self.session,
            &mut self.pipeline,
            self.config.wait,
            self.config.upload,
            self.config.title.clone(),
        );
        driver.run(source, display, cancel, self.config.max_frames)
    }

    /// Release every resource in teardown order. Never fails.
    pub fn shutdown(self) -> TeardownReport {
        let Self {
            mut pipeline,
            mut session,
            ..
        } = self;
        let mut report = TeardownReport::default();
        pipeline.release_into(&mut report);
        session.close(&mut report);
        if report.is_clean() {
            info!(released = report.released.len(), "Teardown complete");
        } else {
            info!(
                released = report.released.len(),
                failures = report.failures.len(),
                "Teardown complete with release failures"
            );
        }
        report
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.session)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
