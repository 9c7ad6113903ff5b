//! accelflow CLI entrypoint.
//!
//! ```bash
//! accelflow run --binary sobel.aocx --input frame.png --ingest-kernel mem_read \
//!     --transform-kernel sobel --egress-kernel mem_write
//! accelflow run --runtime sim --sim-transform sobel --pattern gradient
//! accelflow bench --runtime sim --frames 500 --json
//! accelflow probe --json
//! accelflow make-sim-image --output identity.sim
//! ```

mod display;
mod sources;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::frame_io::{FrameDisplay, FrameSource};
use accelflow_core::runtime::{ComputeRuntime, DeviceInfo, PlatformInfo};
use accelflow_core::sim::{SimImage, SimRuntime, TransformOp};
use accelflow_core::types::{DeviceClass, FrameDims};
use accelflow_opencl::OpenClRuntime;
use accelflow_pipeline::{
    Orchestrator, PipelineConfig, RunSummary, TeardownReport, UploadPolicy, WaitPolicy,
};

use crate::display::{HeadlessDisplay, KeepLast};
use crate::sources::{Pattern, PatternSource, StillSource};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "accelflow",
    version,
    about = "Stream grayscale frames through a three-kernel accelerator pipeline",
    arg_required_else_help = true,
    after_help = "Examples:\n  accelflow probe --json\n  accelflow run --binary sobel.aocx --input frame.png\n  accelflow run --runtime sim --sim-transform sobel --pattern gradient\n  accelflow bench --runtime sim --frames 500 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the frame loop with on-screen (or headless) output.
    Run(RunArgs),
    /// Run a fixed number of frames headless and report throughput.
    Bench(BenchArgs),
    /// List compute platforms and devices.
    Probe(ProbeArgs),
    /// Write a simulator pipeline image for `--runtime sim`.
    MakeSimImage(MakeSimImageArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RuntimeArg {
    /// OpenCL through the system ICD loader.
    Opencl,
    /// In-process software accelerator.
    Sim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DeviceClassArg {
    Accelerator,
    Gpu,
    Cpu,
    Any,
}

impl From<DeviceClassArg> for DeviceClass {
    fn from(value: DeviceClassArg) -> Self {
        match value {
            DeviceClassArg::Accelerator => DeviceClass::Accelerator,
            DeviceClassArg::Gpu => DeviceClass::Gpu,
            DeviceClassArg::Cpu => DeviceClass::Cpu,
            DeviceClassArg::Any => DeviceClass::Any,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WaitArg {
    Egress,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum UploadArg {
    Every,
    Once,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TransformArg {
    Identity,
    Invert,
    Sobel,
}

impl From<TransformArg> for TransformOp {
    fn from(value: TransformArg) -> Self {
        match value {
            TransformArg::Identity => TransformOp::Identity,
            TransformArg::Invert => TransformOp::Invert,
            TransformArg::Sobel => TransformOp::Sobel,
        }
    }
}

/// Runtime, binary, device and policy options shared by `run` and `bench`.
#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// JSON pipeline config. Flags below override its fields.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Compute runtime.
    #[arg(long = "runtime", value_enum, default_value_t = RuntimeArg::Opencl)]
    runtime: RuntimeArg,

    /// Precompiled pipeline binary (.aocx for OpenCL FPGA targets).
    #[arg(short = 'b', long = "binary")]
    binary: Option<PathBuf>,

    /// Transform used by the simulator's built-in image when no binary is given.
    #[arg(long = "sim-transform", value_enum, default_value_t = TransformArg::Identity)]
    sim_transform: TransformArg,

    #[arg(long = "ingest-kernel")]
    ingest_kernel: Option<String>,

    #[arg(long = "transform-kernel")]
    transform_kernel: Option<String>,

    #[arg(long = "egress-kernel")]
    egress_kernel: Option<String>,

    /// Device class to select.
    #[arg(long = "device-class", value_enum)]
    device_class: Option<DeviceClassArg>,

    /// Restrict device search to one platform index.
    #[arg(long = "platform")]
    platform: Option<usize>,

    /// Index among matching devices.
    #[arg(short = 'd', long = "device")]
    device: Option<usize>,

    /// Queues to wait on after each frame's submissions.
    #[arg(long = "wait", value_enum)]
    wait: Option<WaitArg>,

    /// Input upload policy. Defaults to `once` for still images.
    #[arg(long = "upload", value_enum)]
    upload: Option<UploadArg>,

    #[arg(long = "width")]
    width: Option<u32>,

    #[arg(long = "height")]
    height: Option<u32>,

    /// Still image input (any format the image crate decodes).
    #[arg(short = 'i', long = "input", conflicts_with = "pattern")]
    input: Option<PathBuf>,

    /// Synthetic input pattern, used when no `--input` is given.
    #[arg(long = "pattern", value_enum)]
    pattern: Option<Pattern>,

    /// Pixel value for uniform and checker patterns.
    #[arg(long = "value", default_value_t = 128)]
    value: u8,

    /// Stop after this many seconds.
    #[arg(long = "seconds")]
    seconds: Option<f64>,

    /// Save the last output frame as PNG.
    #[arg(long = "save-last")]
    save_last: Option<PathBuf>,

    /// Emit a machine-readable JSON summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Stop after this many frames.
    #[arg(short = 'n', long = "frames")]
    frames: Option<u64>,

    /// Window title; the status label is `<title> | FPS: <n>`.
    #[arg(long = "title")]
    title: Option<String>,

    /// Do not open a window.
    #[arg(long = "headless", default_value_t = false)]
    headless: bool,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Frames to run.
    #[arg(short = 'n', long = "frames", default_value_t = 100)]
    frames: u64,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[arg(long = "runtime", value_enum, default_value_t = RuntimeArg::Opencl)]
    runtime: RuntimeArg,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct MakeSimImageArgs {
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    #[arg(long = "transform", value_enum, default_value_t = TransformArg::Identity)]
    transform: TransformArg,

    /// Comma-separated kernel names (ingest, transform, egress roles in order).
    #[arg(long = "kernels", value_delimiter = ',', default_value = "ingest,transform,egress")]
    kernels: Vec<String>,
}

fn main() {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 4 } else { 0 });
        }
    };
    let json_error_command = match &cli.command {
        Commands::Run(args) if args.pipeline.json => Some("run"),
        Commands::Bench(args) if args.pipeline.json => Some("bench"),
        Commands::Probe(args) if args.json => Some("probe"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Run(args) => run_run(args),
        Commands::Bench(args) => run_bench(args),
        Commands::Probe(args) => run_probe(args),
        Commands::MakeSimImage(args) => run_make_sim_image(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.exit_code());
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

// ─── Runtime and config resolution ──────────────────────────────────────────

/// The runtime plus the binary image to use when none is configured.
struct ResolvedRuntime {
    runtime: Arc<dyn ComputeRuntime>,
    builtin_image: Option<Vec<u8>>,
}

fn open_runtime(kind: RuntimeArg, sim_transform: TransformArg) -> Result<ResolvedRuntime> {
    match kind {
        RuntimeArg::Opencl => Ok(ResolvedRuntime {
            runtime: Arc::new(OpenClRuntime::new()?),
            builtin_image: None,
        }),
        RuntimeArg::Sim => {
            let sim = SimRuntime::new(SimImage::with_transform(sim_transform.into()));
            let builtin_image = Some(sim.default_binary());
            Ok(ResolvedRuntime {
                runtime: Arc::new(sim),
                builtin_image,
            })
        }
    }
}

fn resolve_config(args: &PipelineArgs) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(binary) = &args.binary {
        cfg.binary = Some(binary.clone());
    }
    if let Some(name) = &args.ingest_kernel {
        cfg.kernels.ingest = name.clone();
    }
    if let Some(name) = &args.transform_kernel {
        cfg.kernels.transform = name.clone();
    }
    if let Some(name) = &args.egress_kernel {
        cfg.kernels.egress = name.clone();
    }
    if let Some(class) = args.device_class {
        cfg.device.class = class.into();
    }
    if args.platform.is_some() {
        cfg.device.platform = args.platform;
    }
    if let Some(device) = args.device {
        cfg.device.device = device;
    }
    if let Some(wait) = args.wait {
        cfg.wait = match wait {
            WaitArg::Egress => WaitPolicy::Egress,
            WaitArg::All => WaitPolicy::All,
        };
    }
    match args.upload {
        Some(UploadArg::Every) => cfg.upload = UploadPolicy::Every,
        Some(UploadArg::Once) => cfg.upload = UploadPolicy::Once,
        None if args.input.is_some() => cfg.upload = UploadPolicy::Once,
        None => {}
    }
    if let Some(width) = args.width {
        cfg.width = width;
    }
    if let Some(height) = args.height {
        cfg.height = height;
    }
    Ok(cfg)
}

/// Validate `--seconds` into a run deadline.
fn parse_deadline(seconds: Option<f64>) -> Result<Option<Duration>> {
    let Some(seconds) = seconds else {
        return Ok(None);
    };
    match Duration::try_from_secs_f64(seconds) {
        Ok(deadline) if !deadline.is_zero() => Ok(Some(deadline)),
        _ => Err(EngineError::Config(format!(
            "--seconds must be a positive duration, got {seconds}"
        ))),
    }
}

/// Open the frame source and fix the pipeline's dimensions to it.
///
/// A still image keeps its own size unless `--width` or `--height` asks
/// for another one; patterns are rendered at the configured size.
fn open_source(
    args: &PipelineArgs,
    mut cfg: PipelineConfig,
) -> Result<(Box<dyn FrameSource>, PipelineConfig)> {
    let dims = cfg.dims()?;
    let source: Box<dyn FrameSource> = match &args.input {
        Some(path) => {
            let requested = (args.width.is_some() || args.height.is_some()).then_some(dims);
            Box::new(StillSource::open(path, requested)?)
        }
        None => Box::new(PatternSource::new(
            args.pattern.unwrap_or(Pattern::Gradient),
            dims,
            args.value,
        )),
    };
    let found = source.dims();
    cfg.width = found.width();
    cfg.height = found.height();
    Ok((source, cfg))
}

fn setup_orchestrator(resolved: &ResolvedRuntime, cfg: &PipelineConfig) -> Result<Orchestrator> {
    match (&cfg.binary, &resolved.builtin_image) {
        (None, Some(image)) => Orchestrator::setup_with_image(resolved.runtime.clone(), cfg, image),
        _ => Orchestrator::setup(resolved.runtime.clone(), cfg),
    }
}

/// Cancel `token` after `deadline`, from a timer thread.
fn arm_deadline(token: &CancellationToken, deadline: Option<Duration>) {
    if let Some(deadline) = deadline {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(deadline);
            token.cancel();
        });
    }
}

// ─── run / bench ────────────────────────────────────────────────────────────

/// The display a run presents to, with last-frame capture only when
/// `--save-last` asks for it.
enum Output {
    Plain(Box<dyn FrameDisplay>),
    Capture(KeepLast<Box<dyn FrameDisplay>>, PathBuf),
}

impl Output {
    fn new(display: Box<dyn FrameDisplay>, save_last: Option<&Path>) -> Self {
        match save_last {
            Some(path) => Self::Capture(KeepLast::new(display), path.to_path_buf()),
            None => Self::Plain(display),
        }
    }

    fn display(&mut self) -> &mut dyn FrameDisplay {
        match self {
            Self::Plain(display) => display.as_mut(),
            Self::Capture(keep, _) => keep,
        }
    }

    /// Write the captured frame, if any was requested.
    fn finish(self) -> Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Capture(keep, path) => keep.save_png(&path),
        }
    }
}

struct PipelineOutcome {
    summary: RunSummary,
    teardown: TeardownReport,
    device: String,
    dims: FrameDims,
}

/// Set up, run, and always tear down.
fn drive(
    args: &PipelineArgs,
    cfg: &PipelineConfig,
    mut source: Box<dyn FrameSource>,
    mut output: Output,
    deadline: Option<Duration>,
) -> Result<PipelineOutcome> {
    let resolved = open_runtime(args.runtime, args.sim_transform)?;
    let mut orch = setup_orchestrator(&resolved, cfg)?;
    let device = orch.session().device().name.clone();
    let dims = orch.dims();

    let cancel = CancellationToken::new();
    arm_deadline(&cancel, deadline);
    let result = orch.run(source.as_mut(), output.display(), &cancel);
    let teardown = orch.shutdown();
    let summary = result?;
    output.finish()?;
    Ok(PipelineOutcome {
        summary,
        teardown,
        device,
        dims,
    })
}

fn run_run(args: RunArgs) -> Result<()> {
    let deadline = parse_deadline(args.pipeline.seconds)?;
    let mut cfg = resolve_config(&args.pipeline)?;
    if args.frames.is_some() {
        cfg.max_frames = args.frames;
    }
    if let Some(title) = &args.title {
        cfg.title = title.clone();
    }
    cfg.validate()?;
    let (source, cfg) = open_source(&args.pipeline, cfg)?;

    let headless = args.headless || cfg!(not(feature = "window"));
    let display: Box<dyn FrameDisplay> = if headless {
        Box::new(HeadlessDisplay::new(60))
    } else {
        open_window(&cfg)?
    };
    let output = Output::new(display, args.pipeline.save_last.as_deref());

    let outcome = drive(&args.pipeline, &cfg, source, output, deadline)?;
    report_outcome("run", &args.pipeline, &outcome)
}

#[cfg(feature = "window")]
fn open_window(cfg: &PipelineConfig) -> Result<Box<dyn FrameDisplay>> {
    Ok(Box::new(display::WindowDisplay::open(&cfg.title, cfg.dims()?)?))
}

#[cfg(not(feature = "window"))]
fn open_window(_cfg: &PipelineConfig) -> Result<Box<dyn FrameDisplay>> {
    Ok(Box::new(HeadlessDisplay::new(60)))
}

fn run_bench(args: BenchArgs) -> Result<()> {
    let deadline = parse_deadline(args.pipeline.seconds)?;
    let mut cfg = resolve_config(&args.pipeline)?;
    cfg.max_frames = Some(args.frames);
    cfg.validate()?;
    let (source, cfg) = open_source(&args.pipeline, cfg)?;

    let display = Box::new(HeadlessDisplay::new(args.frames.max(1)));
    let output = Output::new(display, args.pipeline.save_last.as_deref());
    let outcome = drive(&args.pipeline, &cfg, source, output, deadline)?;
    report_outcome("bench", &args.pipeline, &outcome)
}

fn report_outcome(command: &str, args: &PipelineArgs, outcome: &PipelineOutcome) -> Result<()> {
    let summary = &outcome.summary;
    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": command,
            "ok": true,
            "runtime": runtime_name(args.runtime),
            "device": outcome.device,
            "dims": outcome.dims,
            "summary": summary,
            "teardown": outcome.teardown,
        });
        println!("{value}");
    } else {
        tracing::info!(
            frames = summary.frames,
            dims = %outcome.dims,
            stop = summary.stop.as_str(),
            avg_fps = %format!("{:.1}", summary.avg_fps),
            avg_cycle_us = summary.avg_cycle_us,
            released = outcome.teardown.released.len(),
            "Done"
        );
    }
    Ok(())
}

fn runtime_name(kind: RuntimeArg) -> &'static str {
    match kind {
        RuntimeArg::Opencl => "opencl",
        RuntimeArg::Sim => "sim",
    }
}

// ─── probe ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ProbedPlatform {
    #[serde(flatten)]
    platform: PlatformInfo,
    devices: Vec<DeviceInfo>,
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    let resolved = open_runtime(args.runtime, TransformArg::Identity)?;
    let runtime = resolved.runtime.as_ref();
    let platforms = runtime
        .platforms()?
        .into_iter()
        .map(|platform| {
            let devices = runtime.devices(&platform, DeviceClass::Any)?;
            Ok(ProbedPlatform { platform, devices })
        })
        .collect::<Result<Vec<_>>>()?;

    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "runtime": runtime.name(),
            "platforms": platforms,
        });
        println!("{value}");
        return Ok(());
    }

    if platforms.is_empty() {
        println!("{}: no platforms found", runtime.name());
    }
    for p in &platforms {
        println!(
            "[{}] {} ({}, {})",
            p.platform.index, p.platform.name, p.platform.vendor, p.platform.version
        );
        for d in &p.devices {
            println!(
                "    [{}] {} class={} global_mem={} MiB",
                d.index,
                d.name,
                d.class,
                d.global_mem_bytes / (1024 * 1024)
            );
        }
    }
    Ok(())
}

// ─── make-sim-image ─────────────────────────────────────────────────────────

fn run_make_sim_image(args: MakeSimImageArgs) -> Result<()> {
    let image = SimImage::with_transform(args.transform.into()).with_kernels(args.kernels);
    let bytes = image.to_bytes();
    SimImage::parse(&bytes).map_err(EngineError::Config)?;
    write_file(&args.output, &bytes)?;
    tracing::info!(
        path = %args.output.display(),
        kernels = %image.kernels.join(","),
        transform = %image.transform,
        "Simulator image written"
    );
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| EngineError::Config(format!("cannot write {}: {e}", path.display())))
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.error_code(),
    })
    .to_string()
}
