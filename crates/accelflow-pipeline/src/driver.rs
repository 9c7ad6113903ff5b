//! Frame cycle driver.
//!
//! One cycle moves through a closed state machine:
//!
//! ```text
//! Idle ─▶ Loading ─▶ Submitted ─▶ Awaiting ─▶ Published ─▶ Idle
//!            └──────────── (source exhausted) ──────────────▶ Idle
//! ```
//!
//! - **Loading**: map the input buffer for writing, let the frame source
//!   fill it in place, unmap. Skipped after the first cycle under
//!   [`UploadPolicy::Once`].
//! - **Submitted**: enqueue ingest, transform and egress on their own queues,
//!   in that order, with no dependency events. The stages synchronize through
//!   on-device channels.
//! - **Awaiting**: block on the queues named by the [`WaitPolicy`]. Never
//!   before the third submission.
//! - **Published**: map the output buffer for reading, present it, unmap.
//!
//! Stop conditions (display, exhausted source, frame limit, cancellation) are
//! observed once per cycle after the display step, so a cycle in flight
//! always completes. Any error ends the loop.

use std::time::{Duration, Instant};

use accelflow_core::error::{EngineError, Result};
use accelflow_core::frame_io::{DisplayControl, FrameDisplay, FrameSource, FrameStatus};
use accelflow_core::types::{FrameDims, QueueRole};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::binder::BoundPipeline;
use crate::config::{UploadPolicy, WaitPolicy};
use crate::session::Session;

/// Position of the driver within one frame cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Loading,
    Submitted,
    Awaiting,
    Published,
}

impl CycleState {
    /// Whether `self → to` is an edge of the cycle.
    pub fn can_advance_to(self, to: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, to),
            (Idle, Loading)
                | (Loading, Submitted)
                | (Loading, Idle)
                | (Submitted, Awaiting)
                | (Awaiting, Published)
                | (Published, Idle)
        )
    }
}

/// Why a run ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The display asked to stop (quit key or window closed).
    Display,
    SourceExhausted,
    FrameLimit,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::SourceExhausted => "source_exhausted",
            Self::FrameLimit => "frame_limit",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of one [`FrameCycleDriver::run_cycle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A frame was published; the display wants more.
    Continue,
    /// A frame was published and the display asked to stop.
    StopRequested,
    /// The source had no frame; nothing was submitted.
    Exhausted,
}

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Per-run counters. Cycle timings are diagnostic only.
#[derive(Clone, Debug, Default)]
pub struct DriverMetrics {
    pub cycles_started: u64,
    pub uploads: u64,
    pub submissions: u64,
    pub frames_published: u64,
    total_us: u64,
    min_us: Option<u64>,
    max_us: u64,
}

impl DriverMetrics {
    fn record_cycle(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.total_us = self.total_us.saturating_add(us);
        self.min_us = Some(self.min_us.map_or(us, |m| m.min(us)));
        self.max_us = self.max_us.max(us);
    }

    pub fn avg_cycle_us(&self) -> u64 {
        if self.frames_published > 0 {
            self.total_us / self.frames_published
        } else {
            0
        }
    }

    pub fn avg_fps(&self) -> f64 {
        match self.avg_cycle_us() {
            0 => 0.0,
            us => 1_000_000.0 / us as f64,
        }
    }

    /// Counters must satisfy `started ≥ submitted ≥ published` and
    /// `uploads ≤ started`.
    pub fn validate(&self) -> bool {
        self.cycles_started >= self.submissions
            && self.submissions >= self.frames_published
            && self.uploads <= self.cycles_started
    }

    /// Log run-level throughput.
    pub fn report(&self) {
        info!(
            frames = self.frames_published,
            uploads = self.uploads,
            min_cycle_us = self.min_us.unwrap_or(0),
            avg_cycle_us = self.avg_cycle_us(),
            max_cycle_us = self.max_us,
            avg_fps = format_args!("{:.1}", self.avg_fps()),
            "Frame loop finished"
        );
    }
}

fn enforce_metrics_invariants(metrics: &DriverMetrics) -> Result<()> {
    if metrics.validate() {
        return Ok(());
    }
    Err(EngineError::InvariantViolation(format!(
        "frame cycle counters out of order: started={} uploads={} submitted={} published={}",
        metrics.cycles_started, metrics.uploads, metrics.submissions, metrics.frames_published
    )))
}

/// Run-level summary.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub frames: u64,
    pub uploads: u64,
    pub stop: StopReason,
    pub wait_policy: WaitPolicy,
    pub upload_policy: UploadPolicy,
    pub min_cycle_us: u64,
    pub avg_cycle_us: u64,
    pub max_cycle_us: u64,
    pub avg_fps: f64,
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Format the per-cycle status label.
pub fn status_label(title: &str, fps: f64) -> String {
    format!("{title} | FPS: {}", fps.round() as u64)
}

/// Enqueue ingest, transform and egress, in that order.
///
/// # Errors
/// `InvariantViolation` without touching the runtime if any buffer of the
/// session is mapped; `SubmitFailed` naming the queue otherwise.
pub fn submit_all(session: &Session, pipeline: &BoundPipeline) -> Result<()> {
    let runtime = session.runtime();
    for stage in QueueRole::ALL {
        session.fence().check(&format!("{stage} submission"))?;
        let queue = session.queue(stage)?;
        let kernel = pipeline.program.kernel(stage).raw()?;
        runtime
            .enqueue_task(queue, kernel)
            .map_err(|e| EngineError::SubmitFailed {
                queue: stage,
                reason: e.to_string(),
            })?;
        trace!(stage = %stage, "Task enqueued");
    }
    Ok(())
}

/// Block on the queues `policy` names, in stage order.
pub fn await_completion(session: &Session, policy: WaitPolicy) -> Result<()> {
    let runtime = session.runtime();
    for &stage in policy.queues() {
        runtime
            .finish(session.queue(stage)?)
            .map_err(|e| EngineError::WaitFailed {
                queue: stage,
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

/// Drives frame cycles over a bound pipeline.
pub struct FrameCycleDriver<'a> {
    session: &'a Session,
    pipeline: &'a mut BoundPipeline,
    wait: WaitPolicy,
    upload: UploadPolicy,
    title: String,
    state: CycleState,
    metrics: DriverMetrics,
}

impl<'a> FrameCycleDriver<'a> {
    pub fn new(
        session: &'a Session,
        pipeline: &'a mut BoundPipeline,
        wait: WaitPolicy,
        upload: UploadPolicy,
        title: impl Into<String>,
    ) -> Self {
        Self {
            session,
            pipeline,
            wait,
            upload,
            title: title.into(),
            state: CycleState::Idle,
            metrics: DriverMetrics::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    fn advance(&mut self, to: CycleState) -> Result<()> {
        if !self.state.can_advance_to(to) {
            return Err(EngineError::InvariantViolation(format!(
                "illegal frame cycle transition {:?} -> {:?}",
                self.state, to
            )));
        }
        trace!(from = ?self.state, ?to, "Cycle state");
        self.state = to;
        Ok(())
    }

    fn needs_upload(&self) -> bool {
        match self.upload {
            UploadPolicy::Every => true,
            UploadPolicy::Once => self.metrics.uploads == 0,
        }
    }

    /// Run one complete cycle.
    pub fn run_cycle(
        &mut self,
        source: &mut dyn FrameSource,
        display: &mut dyn FrameDisplay,
    ) -> Result<CycleOutcome> {
        let started = Instant::now();
        let dims = self.pipeline.dims();
        self.advance(CycleState::Loading)?;
        self.metrics.cycles_started += 1;

        if self.needs_upload() {
            let mut frame = self.pipeline.input.map_write()?;
            let status = source.read_frame(&mut frame[..dims.byte_len()])?;
            frame.unmap()?;
            if status == FrameStatus::Exhausted {
                self.advance(CycleState::Idle)?;
                return Ok(CycleOutcome::Exhausted);
            }
            self.metrics.uploads += 1;
        }

        self.advance(CycleState::Submitted)?;
        submit_all(self.session, self.pipeline)?;
        self.metrics.submissions += 1;

        self.advance(CycleState::Awaiting)?;
        await_completion(self.session, self.wait)?;

        self.advance(CycleState::Published)?;
        let fps = 1.0 / started.elapsed().as_secs_f64().max(f64::EPSILON);
        let label = status_label(&self.title, fps);
        let frame = self.pipeline.output.map_read()?;
        let control = display.present(&frame[..dims.byte_len()], dims, &label)?;
        frame.unmap()?;
        self.metrics.frames_published += 1;

        self.advance(CycleState::Idle)?;
        let elapsed = started.elapsed();
        self.metrics.record_cycle(elapsed);
        debug!(
            frame = self.metrics.frames_published,
            cycle_us = elapsed.as_micros() as u64,
            "Frame published"
        );

        Ok(match control {
            DisplayControl::Continue => CycleOutcome::Continue,
            DisplayControl::Stop => CycleOutcome::StopRequested,
        })
    }

    /// Run cycles until a stop condition or an error.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        display: &mut dyn FrameDisplay,
        cancel: &CancellationToken,
        max_frames: Option<u64>,
    ) -> Result<RunSummary> {
        info!(
            wait = %self.wait,
            upload = %self.upload,
            max_frames,
            "Frame loop started"
        );
        let stop = loop {
            match self.run_cycle(source, display)? {
                CycleOutcome::Exhausted => break StopReason::SourceExhausted,
                CycleOutcome::StopRequested => break StopReason::Display,
                CycleOutcome::Continue => {}
            }
            if max_frames.is_some_and(|max| self.metrics.frames_published >= max) {
                break StopReason::FrameLimit;
            }
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
        };

        enforce_metrics_invariants(&self.metrics)?;
        self.metrics.report();
        info!(reason = stop.as_str(), "Frame loop stopped");
        Ok(self.summary(stop))
    }

    fn summary(&self, stop: StopReason) -> RunSummary {
        RunSummary {
            frames: self.metrics.frames_published,
            uploads: self.metrics.uploads,
            stop,
            wait_policy: self.wait,
            upload_policy: self.upload,
            min_cycle_us: self.metrics.min_us.unwrap_or(0),
            avg_cycle_us: self.metrics.avg_cycle_us(),
            max_cycle_us: self.metrics.max_us,
            avg_fps: self.metrics.avg_fps(),
        }
    }
}

/// Dimensions check performed before the first cycle.
pub(crate) fn check_source_dims(source: &dyn FrameSource, dims: FrameDims) -> Result<()> {
    if source.dims() != dims {
        return Err(EngineError::DimensionMismatch(format!(
            "frame source produces {} frames, pipeline is bound for {dims}",
            source.dims()
        )));
    }
    Ok(())
}
