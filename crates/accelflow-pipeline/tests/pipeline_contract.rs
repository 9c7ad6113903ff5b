//! End-to-end orchestrator behaviour against the simulator runtime.

use std::sync::Arc;

use accelflow_core::frame_io::{DisplayControl, FrameDisplay, FrameSource, FrameStatus};
use accelflow_core::sim::{SimFault, SimImage, SimOp, SimRuntime, TransformOp};
use accelflow_core::{EngineError, FrameDims, HandleKind, MapMode, QueueRole, Result};
use accelflow_pipeline::{
    Orchestrator, PipelineConfig, StopReason, TEARDOWN_ORDER, UploadPolicy, WaitPolicy,
};
use tokio_util::sync::CancellationToken;

// ─── Test collaborators ──────────────────────────────────────────────────────

struct PatternSource {
    dims: FrameDims,
    fill: Box<dyn FnMut(u64, &mut [u8])>,
    produced: u64,
    limit: Option<u64>,
}

impl PatternSource {
    fn uniform(dims: FrameDims, value: u8) -> Self {
        Self {
            dims,
            fill: Box::new(move |_: u64, dst: &mut [u8]| dst.fill(value)),
            produced: 0,
            limit: None,
        }
    }

    fn gradient(dims: FrameDims) -> Self {
        let width = dims.width() as usize;
        Self {
            dims,
            fill: Box::new(move |_: u64, dst: &mut [u8]| {
                for (i, px) in dst.iter_mut().enumerate() {
                    *px = ((i % width) * 255 / (width - 1).max(1)) as u8;
                }
            }),
            produced: 0,
            limit: None,
        }
    }

    fn counting(dims: FrameDims) -> Self {
        Self {
            dims,
            fill: Box::new(|n: u64, dst: &mut [u8]| dst.fill(n as u8)),
            produced: 0,
            limit: None,
        }
    }

    fn limited(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }
}

impl FrameSource for PatternSource {
    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn read_frame(&mut self, dst: &mut [u8]) -> Result<FrameStatus> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(FrameStatus::Exhausted);
        }
        (self.fill)(self.produced, dst);
        self.produced += 1;
        Ok(FrameStatus::Ready)
    }
}

#[derive(Default)]
struct RecordingDisplay {
    frames: Vec<Vec<u8>>,
    labels: Vec<String>,
    stop_after: Option<usize>,
}

impl FrameDisplay for RecordingDisplay {
    fn present(&mut self, frame: &[u8], dims: FrameDims, label: &str) -> Result<DisplayControl> {
        assert_eq!(frame.len(), dims.byte_len());
        self.frames.push(frame.to_vec());
        self.labels.push(label.to_string());
        Ok(match self.stop_after {
            Some(n) if self.frames.len() >= n => DisplayControl::Stop,
            _ => DisplayControl::Continue,
        })
    }
}

fn config(width: u32, height: u32, max_frames: u64) -> PipelineConfig {
    PipelineConfig {
        width,
        height,
        max_frames: Some(max_frames),
        ..PipelineConfig::default()
    }
}

fn setup(sim: &Arc<SimRuntime>, cfg: &PipelineConfig) -> Result<Orchestrator> {
    Orchestrator::setup_with_image(sim.clone(), cfg, &sim.default_binary())
}

fn dims(width: u32, height: u32) -> FrameDims {
    FrameDims::new(width, height).expect("dims")
}

/// Op-log positions of every enqueue of `kernel`.
fn enqueue_positions(ops: &[SimOp], kernel: &str) -> Vec<usize> {
    ops.iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, SimOp::EnqueueTask { kernel: k, .. } if k == kernel))
        .map(|(i, _)| i)
        .collect()
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[test]
fn buffers_are_exactly_width_times_height() {
    for (w, h) in [(1, 1), (3, 5), (640, 480), (641, 479), (1920, 1080)] {
        let sim = Arc::new(SimRuntime::default());
        let orch = setup(&sim, &config(w, h, 1)).expect("setup");
        let sizes: Vec<usize> = sim
            .op_log()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::CreateBuffer { bytes } => Some(bytes),
                _ => None,
            })
            .collect();
        let expected = (w * h) as usize;
        assert_eq!(sizes, vec![expected, expected], "{w}x{h}");
        assert_eq!(orch.session().memory_usage().0, 2 * expected);
        orch.shutdown();
    }
}

#[test]
fn identity_pipeline_returns_the_uniform_input() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(640, 480, 3)).expect("setup");
    let mut source = PatternSource::uniform(dims(640, 480), 128);
    let mut display = RecordingDisplay::default();

    let summary = orch
        .run(&mut source, &mut display, &CancellationToken::new())
        .expect("run");
    assert_eq!(summary.stop, StopReason::FrameLimit);
    assert_eq!(summary.frames, 3);
    assert_eq!(display.frames.len(), 3);
    for frame in &display.frames {
        assert_eq!(frame.len(), 640 * 480);
        assert!(frame.iter().all(|&px| px == 128));
    }
    assert!(display.labels.iter().all(|l| l.starts_with("accelflow | FPS: ")));
    assert!(orch.shutdown().is_clean());
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn constant_input_gives_bit_identical_outputs() {
    let sim = Arc::new(SimRuntime::new(SimImage::with_transform(TransformOp::Sobel)));
    let mut orch = setup(&sim, &config(64, 48, 5)).expect("setup");
    let mut source = PatternSource::gradient(dims(64, 48));
    let mut display = RecordingDisplay::default();
    orch.run(&mut source, &mut display, &CancellationToken::new())
        .expect("run");

    assert_eq!(display.frames.len(), 5);
    let first = &display.frames[0];
    assert!(first.iter().any(|&px| px > 0), "gradient has edges");
    assert!(display.frames.iter().all(|f| f == first));
}

#[test]
fn frames_flow_through_in_order() {
    let sim = Arc::new(SimRuntime::new(SimImage::with_transform(TransformOp::Invert)));
    let mut orch = setup(&sim, &config(8, 8, 4)).expect("setup");
    let mut source = PatternSource::counting(dims(8, 8));
    let mut display = RecordingDisplay::default();
    orch.run(&mut source, &mut display, &CancellationToken::new())
        .expect("run");
    let firsts: Vec<u8> = display.frames.iter().map(|f| f[0]).collect();
    assert_eq!(firsts, vec![255, 254, 253, 252]);
}

#[test]
fn egress_wait_follows_all_three_submissions() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(16, 16, 3)).expect("setup");
    let mut source = PatternSource::uniform(dims(16, 16), 7);
    orch.run(
        &mut source,
        &mut RecordingDisplay::default(),
        &CancellationToken::new(),
    )
    .expect("run");

    let ops = sim.op_log();
    let ingests = enqueue_positions(&ops, "ingest");
    let transforms = enqueue_positions(&ops, "transform");
    let egresses = enqueue_positions(&ops, "egress");
    let finishes: Vec<(usize, usize)> = ops
        .iter()
        .enumerate()
        .filter_map(|(i, op)| match op {
            SimOp::Finish { queue } => Some((i, *queue)),
            _ => None,
        })
        .collect();

    assert_eq!(ingests.len(), 3);
    assert_eq!(finishes.len(), 3, "one wait per cycle by default");
    for cycle in 0..3 {
        assert!(ingests[cycle] < transforms[cycle]);
        assert!(transforms[cycle] < egresses[cycle]);
        let (at, queue) = finishes[cycle];
        assert_eq!(queue, 2, "default policy waits on the egress queue");
        assert!(at > egresses[cycle]);
        if cycle + 1 < 3 {
            assert!(at < ingests[cycle + 1]);
        }
    }
}

#[test]
fn host_blocks_only_on_the_egress_wait() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(16, 16, 4)).expect("setup");
    let mut source = PatternSource::uniform(dims(16, 16), 3);
    orch.run(
        &mut source,
        &mut RecordingDisplay::default(),
        &CancellationToken::new(),
    )
    .expect("run");

    let ops = sim.op_log();
    let ingests = enqueue_positions(&ops, "ingest");
    assert_eq!(ingests.len(), 4);
    for (cycle, &start) in ingests.iter().enumerate() {
        let end = ingests.get(cycle + 1).copied().unwrap_or(ops.len());
        let finishes: Vec<usize> = ops[start..end]
            .iter()
            .filter_map(|op| match op {
                SimOp::Finish { queue } => Some(*queue),
                _ => None,
            })
            .collect();
        assert_eq!(finishes, vec![2], "cycle {cycle}");
    }
    // Nothing waits between the input upload and the first submission.
    let upload_unmap = ops[..ingests[0]]
        .iter()
        .rposition(|op| matches!(op, SimOp::Unmap { .. }))
        .expect("input unmapped before ingest");
    assert!(
        !ops[upload_unmap..ingests[0]]
            .iter()
            .any(|op| matches!(op, SimOp::Finish { .. }))
    );
}

#[test]
fn rejected_kernel_argument_fails_setup_and_releases_everything() {
    let sim = Arc::new(SimRuntime::default());
    sim.inject(SimFault::SetKernelArg {
        kernel: "egress".into(),
        index: 0,
    });
    let err = setup(&sim, &config(32, 32, 1)).expect_err("egress rejects its buffer");
    assert!(matches!(
        err,
        EngineError::Driver {
            op: "set_kernel_arg",
            ..
        }
    ));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(sim.live_handles(), 0);

    let kinds: Vec<HandleKind> = sim.release_log().into_iter().map(|(k, _)| k).collect();
    assert_eq!(&kinds[..2], &[HandleKind::Buffer, HandleKind::Buffer]);
    assert_eq!(kinds.last(), Some(&HandleKind::Context));
    assert_eq!(kinds.len(), TEARDOWN_ORDER.len());
}

#[test]
fn all_wait_policy_finishes_every_queue_after_egress() {
    let sim = Arc::new(SimRuntime::default());
    let cfg = PipelineConfig {
        wait: WaitPolicy::All,
        ..config(16, 16, 2)
    };
    let mut orch = setup(&sim, &cfg).expect("setup");
    let mut source = PatternSource::uniform(dims(16, 16), 1);
    let summary = orch
        .run(
            &mut source,
            &mut RecordingDisplay::default(),
            &CancellationToken::new(),
        )
        .expect("run");
    assert_eq!(summary.wait_policy, WaitPolicy::All);

    let ops = sim.op_log();
    let egresses = enqueue_positions(&ops, "egress");
    let ingests = enqueue_positions(&ops, "ingest");
    for cycle in 0..2 {
        let end = ingests.get(cycle + 1).copied().unwrap_or(ops.len());
        let waited: Vec<usize> = ops[egresses[cycle]..end]
            .iter()
            .filter_map(|op| match op {
                SimOp::Finish { queue } => Some(*queue),
                _ => None,
            })
            .collect();
        assert_eq!(waited, vec![0, 1, 2]);
    }
}

#[test]
fn once_upload_maps_the_input_buffer_once() {
    let sim = Arc::new(SimRuntime::default());
    let cfg = PipelineConfig {
        upload: UploadPolicy::Once,
        ..config(32, 32, 5)
    };
    let mut orch = setup(&sim, &cfg).expect("setup");
    let mut source = PatternSource::uniform(dims(32, 32), 200);
    let mut display = RecordingDisplay::default();
    let summary = orch
        .run(&mut source, &mut display, &CancellationToken::new())
        .expect("run");

    let write_maps = sim
        .op_log()
        .iter()
        .filter(|op| matches!(op, SimOp::Map { mode: MapMode::Write, .. }))
        .count();
    assert_eq!(write_maps, 1);
    assert_eq!(summary.uploads, 1);
    assert_eq!(summary.frames, 5);
    assert!(display.frames.iter().all(|f| f.iter().all(|&px| px == 200)));
}

#[test]
fn read_mapping_is_released_every_cycle() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(8, 8, 3)).expect("setup");
    let mut source = PatternSource::uniform(dims(8, 8), 9);
    orch.run(
        &mut source,
        &mut RecordingDisplay::default(),
        &CancellationToken::new(),
    )
    .expect("run");
    assert_eq!(sim.mapped_buffers(), 0);
    assert_eq!(orch.session().fence().open_mappings(), 0);

    let maps = sim
        .op_log()
        .iter()
        .filter(|op| matches!(op, SimOp::Map { .. }))
        .count();
    let unmaps = sim
        .op_log()
        .iter()
        .filter(|op| matches!(op, SimOp::Unmap { .. }))
        .count();
    assert_eq!(maps, 6);
    assert_eq!(unmaps, 6);
}

#[test]
fn missing_kernel_fails_before_any_allocation() {
    let sim = Arc::new(SimRuntime::new(
        SimImage::identity().with_kernels(["mem_read", "sobel", "mem_write"]),
    ));
    let err = setup(&sim, &config(640, 480, 1)).expect_err("kernel names differ");
    assert!(matches!(err, EngineError::KernelNotFound { ref name } if name == "ingest"));
    assert_eq!(err.exit_code(), 2);
    assert!(
        !sim.op_log()
            .iter()
            .any(|op| matches!(op, SimOp::CreateBuffer { .. }))
    );
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn shutdown_releases_in_teardown_order() {
    let sim = Arc::new(SimRuntime::default());
    let orch = setup(&sim, &config(16, 16, 1)).expect("setup");
    let report = orch.shutdown();
    assert_eq!(report.released, TEARDOWN_ORDER.to_vec());
    assert!(report.is_clean());

    let kinds: Vec<HandleKind> = sim.release_log().into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        kinds,
        vec![
            HandleKind::Buffer,
            HandleKind::Buffer,
            HandleKind::Kernel,
            HandleKind::Kernel,
            HandleKind::Kernel,
            HandleKind::Program,
            HandleKind::Queue,
            HandleKind::Queue,
            HandleKind::Queue,
            HandleKind::Context,
        ]
    );
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn dropping_the_orchestrator_follows_the_same_order() {
    let sim = Arc::new(SimRuntime::default());
    drop(setup(&sim, &config(16, 16, 1)).expect("setup"));
    let kinds: Vec<HandleKind> = sim.release_log().into_iter().map(|(k, _)| k).collect();
    assert_eq!(kinds.first(), Some(&HandleKind::Buffer));
    assert_eq!(kinds.last(), Some(&HandleKind::Context));
    assert_eq!(kinds.len(), TEARDOWN_ORDER.len());
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn failure_in_submission_still_tears_down_cleanly() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(16, 16, 10)).expect("setup");
    sim.inject(SimFault::EnqueueKernel("transform".into()));
    let mut source = PatternSource::uniform(dims(16, 16), 3);
    let err = orch
        .run(
            &mut source,
            &mut RecordingDisplay::default(),
            &CancellationToken::new(),
        )
        .expect_err("transform submission fails");
    assert!(matches!(
        err,
        EngineError::SubmitFailed {
            queue: QueueRole::Transform,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 3);

    let report = orch.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.released, TEARDOWN_ORDER.to_vec());
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn failure_in_wait_is_a_runtime_error() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(16, 16, 10)).expect("setup");
    sim.inject(SimFault::Finish);
    let err = orch
        .run(
            &mut PatternSource::uniform(dims(16, 16), 3),
            &mut RecordingDisplay::default(),
            &CancellationToken::new(),
        )
        .expect_err("wait fails");
    assert!(matches!(
        err,
        EngineError::WaitFailed {
            queue: QueueRole::Egress,
            ..
        }
    ));
    drop(orch);
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn output_allocation_failure_releases_partial_setup() {
    let sim = Arc::new(SimRuntime::default());
    sim.inject(SimFault::AllocateBuffer { nth: 1 });
    let err = setup(&sim, &config(64, 64, 1)).expect_err("output allocation fails");
    assert!(matches!(
        err,
        EngineError::AllocationFailed {
            role: accelflow_core::BufferRole::Output,
            bytes: 4096,
            ..
        }
    ));
    let kinds: Vec<HandleKind> = sim.release_log().into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        kinds,
        vec![
            HandleKind::Buffer,
            HandleKind::Kernel,
            HandleKind::Kernel,
            HandleKind::Kernel,
            HandleKind::Program,
            HandleKind::Queue,
            HandleKind::Queue,
            HandleKind::Queue,
            HandleKind::Context,
        ]
    );
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn display_stop_and_exhausted_source_end_the_loop() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(8, 8, 100)).expect("setup");
    let mut display = RecordingDisplay {
        stop_after: Some(2),
        ..RecordingDisplay::default()
    };
    let summary = orch
        .run(
            &mut PatternSource::uniform(dims(8, 8), 1),
            &mut display,
            &CancellationToken::new(),
        )
        .expect("run");
    assert_eq!(summary.stop, StopReason::Display);
    assert_eq!(summary.frames, 2);

    let summary = orch
        .run(
            &mut PatternSource::uniform(dims(8, 8), 1).limited(3),
            &mut RecordingDisplay::default(),
            &CancellationToken::new(),
        )
        .expect("run");
    assert_eq!(summary.stop, StopReason::SourceExhausted);
    assert_eq!(summary.frames, 3);
}

#[test]
fn cancellation_is_observed_after_the_cycle_completes() {
    let sim = Arc::new(SimRuntime::default());
    let cfg = PipelineConfig {
        max_frames: None,
        ..config(8, 8, 1)
    };
    let mut orch = setup(&sim, &cfg).expect("setup");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut display = RecordingDisplay::default();
    let summary = orch
        .run(&mut PatternSource::uniform(dims(8, 8), 1), &mut display, &cancel)
        .expect("run");
    assert_eq!(summary.stop, StopReason::Cancelled);
    assert_eq!(summary.frames, 1);
    assert_eq!(display.frames.len(), 1);
}

#[test]
fn mismatched_source_dimensions_are_rejected() {
    let sim = Arc::new(SimRuntime::default());
    let mut orch = setup(&sim, &config(8, 8, 1)).expect("setup");
    let err = orch
        .run(
            &mut PatternSource::uniform(dims(4, 4), 1),
            &mut RecordingDisplay::default(),
            &CancellationToken::new(),
        )
        .expect_err("dims differ");
    assert!(matches!(err, EngineError::DimensionMismatch(_)));
    assert!(
        !sim.op_log()
            .iter()
            .any(|op| matches!(op, SimOp::Map { .. }))
    );
}

#[test]
fn setup_without_binary_path_is_a_usage_error() {
    let sim = Arc::new(SimRuntime::default());
    let err = Orchestrator::setup(sim.clone(), &PipelineConfig::default()).expect_err("no binary");
    assert_eq!(err.exit_code(), 4);
    assert!(sim.op_log().is_empty());
}

#[test]
fn setup_reads_the_binary_from_disk() {
    let sim = Arc::new(SimRuntime::new(SimImage::with_transform(TransformOp::Invert)));
    let path = std::env::temp_dir().join(format!("accelflow-contract-{}.sim", std::process::id()));
    std::fs::write(&path, sim.default_binary()).expect("write image");
    let cfg = PipelineConfig {
        binary: Some(path.clone()),
        ..config(4, 4, 1)
    };
    let mut orch = Orchestrator::setup(sim.clone(), &cfg).expect("setup");
    let mut display = RecordingDisplay::default();
    orch.run(
        &mut PatternSource::uniform(dims(4, 4), 0),
        &mut display,
        &CancellationToken::new(),
    )
    .expect("run");
    assert!(display.frames[0].iter().all(|&px| px == 255));
    let _ = std::fs::remove_file(path);
}
