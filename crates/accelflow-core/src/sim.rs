//! Software accelerator: an in-process [`ComputeRuntime`].
//!
//! Emulates one accelerator device running the three-kernel streaming
//! pipeline. The ingest kernel pushes the input buffer into an internal link,
//! the transform kernel pops it, applies a [`TransformOp`] and pushes the
//! result into a second link, and the egress kernel drains that link into the
//! output buffer. Tasks execute when enqueued, so a stage enqueued before its
//! upstream stage stalls with an error (the hardware would deadlock).
//!
//! The runtime keeps an operation log, counts live handles and supports fault
//! injection, which is what the orchestrator tests assert against.
//!
//! # Image format
//!
//! The simulator accepts a small text image instead of a vendor binary:
//!
//! ```text
//! ACCELSIM1
//! kernels=ingest,transform,egress
//! transform=sobel
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::runtime::{ComputeRuntime, DeviceInfo, HandleKind, KernelArg, PlatformInfo, RawHandle};
use crate::types::{DeviceClass, MapMode};

const PLATFORM_ID: usize = 0x5100;
const DEVICE_ID: usize = 0x5200;
const FIRST_OBJECT_ID: usize = 0x1000;

/// Global memory the simulated device reports.
pub const SIM_GLOBAL_MEM_BYTES: u64 = 512 * 1024 * 1024;

// ─── Image ───────────────────────────────────────────────────────────────

/// Pixel operation applied by the simulated transform kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransformOp {
    /// Pass-through. Output equals input.
    #[default]
    Identity,
    /// `255 - p`.
    Invert,
    /// Sobel edge magnitude `|Gx| + |Gy|`, clamped to 255, border pixels 0.
    Sobel,
}

impl TransformOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Invert => "invert",
            Self::Sobel => "sobel",
        }
    }

    /// Apply the operation to one `width`×`height` plane.
    pub fn apply(self, src: &[u8], width: usize, height: usize) -> Vec<u8> {
        match self {
            Self::Identity => src.to_vec(),
            Self::Invert => src.iter().map(|p| 255 - p).collect(),
            Self::Sobel => sobel_magnitude(src, width, height),
        }
    }
}

impl fmt::Display for TransformOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "passthrough" | "copy" => Ok(Self::Identity),
            "invert" => Ok(Self::Invert),
            "sobel" => Ok(Self::Sobel),
            other => Err(EngineError::Config(format!(
                "Unknown transform '{other}'. Use identity, invert or sobel."
            ))),
        }
    }
}

/// 3×3 Sobel operator. Borders are written as 0.
fn sobel_magnitude(src: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height];
    if width < 3 || height < 3 {
        return out;
    }
    let px = |x: usize, y: usize| i32::from(src[y * width + x]);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
            out[y * width + x] = (gx.abs() + gy.abs()).min(255) as u8;
        }
    }
    out
}

/// Program image accepted by [`SimRuntime::build_program`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimImage {
    pub kernels: Vec<String>,
    pub transform: TransformOp,
}

impl SimImage {
    pub const MAGIC: &'static str = "ACCELSIM1";

    /// Pass-through image exposing `ingest`, `transform`, `egress`.
    pub fn identity() -> Self {
        Self::with_transform(TransformOp::Identity)
    }

    pub fn with_transform(transform: TransformOp) -> Self {
        Self {
            kernels: vec!["ingest".into(), "transform".into(), "egress".into()],
            transform,
        }
    }

    /// Replace the exported kernel names. The first three names play the
    /// ingest, transform and egress roles.
    pub fn with_kernels<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kernels = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}\nkernels={}\ntransform={}\n",
            Self::MAGIC,
            self.kernels.join(","),
            self.transform
        )
        .into_bytes()
    }

    /// Parse an image. The error string is the build log.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| "image is not a simulator image (not UTF-8)".to_string())?;
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(Self::MAGIC) {
            return Err(format!("missing {} header", Self::MAGIC));
        }

        let mut kernels = None;
        let mut transform = TransformOp::Identity;
        for (lineno, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line {}: expected key=value", lineno + 2));
            };
            match key.trim() {
                "kernels" => {
                    kernels = Some(
                        value
                            .split(',')
                            .map(|k| k.trim().to_string())
                            .filter(|k| !k.is_empty())
                            .collect::<Vec<_>>(),
                    );
                }
                "transform" => {
                    transform = value.parse().map_err(|e: EngineError| e.to_string())?;
                }
                other => return Err(format!("line {}: unknown key '{other}'", lineno + 2)),
            }
        }

        let kernels = kernels.ok_or_else(|| "missing kernels= line".to_string())?;
        if kernels.len() < 3 {
            return Err(format!(
                "pipeline image needs three kernels, found {}",
                kernels.len()
            ));
        }
        Ok(Self { kernels, transform })
    }

    fn stage_of(&self, name: &str) -> Option<SimStage> {
        let pos = self.kernels.iter().position(|k| k == name)?;
        match pos {
            0 => Some(SimStage::Ingest),
            1 => Some(SimStage::Transform),
            2 => Some(SimStage::Egress),
            _ => Some(SimStage::Auxiliary),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimStage {
    Ingest,
    Transform,
    Egress,
    /// Exported but not part of the streaming path; runs as a no-op.
    Auxiliary,
}

// ─── Fault injection and logging ─────────────────────────────────────────

/// A failure the simulator injects on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimFault {
    /// Report no devices of any class.
    NoDevices,
    /// Fail the `n`-th buffer allocation (0-based).
    AllocateBuffer { nth: usize },
    /// Fail every enqueue of the named kernel.
    EnqueueKernel(String),
    /// Fail every queue wait.
    Finish,
    /// Fail every map call.
    MapBuffer,
    /// Reject argument `index` of the named kernel, as a runtime does when
    /// the argument does not match the kernel's signature.
    SetKernelArg { kernel: String, index: u32 },
}

/// One recorded runtime call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimOp {
    CreateContext,
    /// `ordinal` is the queue's creation index.
    CreateQueue { ordinal: usize },
    BuildProgram,
    CreateKernel { name: String },
    CreateBuffer { bytes: usize },
    SetArg { kernel: String, index: u32, arg: KernelArg },
    EnqueueTask { queue: usize, kernel: String },
    Finish { queue: usize },
    Map { buffer: usize, mode: MapMode },
    Unmap { buffer: usize },
    Release { kind: HandleKind, id: usize },
}

// ─── Runtime state ───────────────────────────────────────────────────────

struct SimBuffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped: Option<MapMode>,
}

impl SimBuffer {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len.max(1)].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self {
            ptr,
            len,
            mapped: None,
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: ptr owns an allocation of at least `len` bytes, and no host
        // mapping is outstanding when kernels read it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len.max(1));
        // SAFETY: ptr/len came from Box::into_raw on a boxed slice of this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

// SAFETY: the buffer exclusively owns its allocation; access is serialized
// by the runtime mutex.
unsafe impl Send for SimBuffer {}

struct SimKernel {
    name: String,
    stage: SimStage,
    transform: TransformOp,
    args: BTreeMap<u32, KernelArg>,
}

enum SimObject {
    Context,
    Queue { ordinal: usize },
    Program { image: SimImage },
    Kernel(SimKernel),
    Buffer(SimBuffer),
}

impl SimObject {
    fn kind(&self) -> HandleKind {
        match self {
            Self::Context => HandleKind::Context,
            Self::Queue { .. } => HandleKind::Queue,
            Self::Program { .. } => HandleKind::Program,
            Self::Kernel(_) => HandleKind::Kernel,
            Self::Buffer(_) => HandleKind::Buffer,
        }
    }
}

struct SimState {
    next_id: usize,
    queues_created: usize,
    buffers_created: usize,
    objects: HashMap<usize, SimObject>,
    ingest_link: VecDeque<Vec<u8>>,
    egress_link: VecDeque<Vec<u8>>,
    faults: Vec<SimFault>,
    ops: Vec<SimOp>,
}

impl SimState {
    fn insert(&mut self, object: SimObject) -> RawHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        RawHandle::from_id(id)
    }

    fn expect_kind(&self, handle: RawHandle, kind: HandleKind, op: &'static str) -> Result<()> {
        match self.objects.get(&handle.id()) {
            Some(obj) if obj.kind() == kind => Ok(()),
            Some(obj) => Err(sim_error(
                op,
                format!("{handle:?} is a {}, expected a {kind}", obj.kind()),
            )),
            None => Err(sim_error(op, format!("{handle:?} is not a live {kind}"))),
        }
    }

    fn queue_ordinal(&self, queue: RawHandle, op: &'static str) -> Result<usize> {
        match self.objects.get(&queue.id()) {
            Some(SimObject::Queue { ordinal }) => Ok(*ordinal),
            _ => Err(sim_error(op, format!("{queue:?} is not a live queue"))),
        }
    }

    fn buffer_mut(&mut self, buffer: RawHandle, op: &'static str) -> Result<&mut SimBuffer> {
        match self.objects.get_mut(&buffer.id()) {
            Some(SimObject::Buffer(buf)) => Ok(buf),
            _ => Err(sim_error(op, format!("{buffer:?} is not a live buffer"))),
        }
    }

    fn has_fault(&self, fault: &SimFault) -> bool {
        self.faults.iter().any(|f| f == fault)
    }

    fn run_kernel(&mut self, kernel: RawHandle) -> Result<()> {
        const OP: &str = "enqueue_task";
        let (stage, transform, args, name) = match self.objects.get(&kernel.id()) {
            Some(SimObject::Kernel(k)) => (k.stage, k.transform, k.args.clone(), k.name.clone()),
            _ => return Err(sim_error(OP, format!("{kernel:?} is not a live kernel"))),
        };

        let arg_at = |index: u32| -> Result<KernelArg> {
            args.get(&index).copied().ok_or_else(|| {
                sim_error(OP, format!("kernel `{name}` argument {index} is not set"))
            })
        };
        let int_at = |index: u32| -> Result<usize> {
            match arg_at(index)? {
                KernelArg::Int(v) if v > 0 => Ok(v as usize),
                other => Err(sim_error(
                    OP,
                    format!(
                        "kernel `{name}` argument {index} must be a positive int, got {other:?}"
                    ),
                )),
            }
        };
        let buffer_at = |index: u32| -> Result<RawHandle> {
            match arg_at(index)? {
                KernelArg::Buffer(h) => Ok(h),
                other => Err(sim_error(
                    OP,
                    format!("kernel `{name}` argument {index} must be a buffer, got {other:?}"),
                )),
            }
        };

        match stage {
            SimStage::Ingest => {
                let buffer = buffer_at(0)?;
                let (width, height) = (int_at(1)?, int_at(2)?);
                let buf = self.buffer_mut(buffer, OP)?;
                check_unmapped(buf, &name)?;
                let len = width * height;
                if len > buf.len {
                    return Err(sim_error(
                        OP,
                        format!(
                            "kernel `{name}` reads {len} bytes from a {}-byte buffer",
                            buf.len
                        ),
                    ));
                }
                let frame = buf.bytes()[..len].to_vec();
                self.ingest_link.push_back(frame);
            }
            SimStage::Transform => {
                let (width, height) = (int_at(0)?, int_at(1)?);
                let frame = self.ingest_link.pop_front().ok_or_else(|| {
                    sim_error(OP, format!("kernel `{name}` stalled: ingest link is empty"))
                })?;
                if frame.len() != width * height {
                    return Err(sim_error(
                        OP,
                        format!(
                            "kernel `{name}` expected {} bytes on the link, got {}",
                            width * height,
                            frame.len()
                        ),
                    ));
                }
                self.egress_link.push_back(transform.apply(&frame, width, height));
            }
            SimStage::Egress => {
                let buffer = buffer_at(0)?;
                let (width, height) = (int_at(1)?, int_at(2)?);
                let frame = self.egress_link.pop_front().ok_or_else(|| {
                    sim_error(OP, format!("kernel `{name}` stalled: egress link is empty"))
                })?;
                let buf = self.buffer_mut(buffer, OP)?;
                check_unmapped(buf, &name)?;
                let len = width * height;
                if len > buf.len || frame.len() != len {
                    return Err(sim_error(
                        OP,
                        format!(
                            "kernel `{name}` cannot write {len} bytes to a {}-byte buffer",
                            buf.len
                        ),
                    ));
                }
                buf.bytes_mut()[..len].copy_from_slice(&frame);
            }
            SimStage::Auxiliary => {}
        }
        Ok(())
    }
}

fn check_unmapped(buf: &SimBuffer, kernel: &str) -> Result<()> {
    if let Some(mode) = buf.mapped {
        return Err(sim_error(
            "enqueue_task",
            format!("kernel `{kernel}` touches a buffer mapped for host {mode:?} access"),
        ));
    }
    Ok(())
}

fn sim_error(op: &'static str, reason: String) -> EngineError {
    EngineError::Driver { op, reason }
}

/// In-process accelerator runtime.
pub struct SimRuntime {
    default_image: SimImage,
    state: Mutex<SimState>,
}

impl SimRuntime {
    /// `default_image` is what [`SimRuntime::default_binary`] returns; the
    /// runtime builds whatever image it is handed.
    pub fn new(default_image: SimImage) -> Self {
        Self {
            default_image,
            state: Mutex::new(SimState {
                next_id: FIRST_OBJECT_ID,
                queues_created: 0,
                buffers_created: 0,
                objects: HashMap::new(),
                ingest_link: VecDeque::new(),
                egress_link: VecDeque::new(),
                faults: Vec::new(),
                ops: Vec::new(),
            }),
        }
    }

    /// Serialized form of the image this runtime was created with.
    pub fn default_binary(&self) -> Vec<u8> {
        self.default_image.to_bytes()
    }

    /// Arm a fault. Faults stay armed until [`SimRuntime::clear_faults`].
    pub fn inject(&self, fault: SimFault) {
        self.lock_unchecked().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock_unchecked().faults.clear();
    }

    /// Every runtime call recorded so far, in call order.
    pub fn op_log(&self) -> Vec<SimOp> {
        self.lock_unchecked().ops.clone()
    }

    /// Release calls recorded so far, in call order.
    pub fn release_log(&self) -> Vec<(HandleKind, usize)> {
        self.lock_unchecked()
            .ops
            .iter()
            .filter_map(|op| match op {
                SimOp::Release { kind, id } => Some((*kind, *id)),
                _ => None,
            })
            .collect()
    }

    /// Number of contexts, queues, programs, kernels and buffers not yet released.
    pub fn live_handles(&self) -> usize {
        self.lock_unchecked().objects.len()
    }

    /// Number of buffers currently mapped for host access.
    pub fn mapped_buffers(&self) -> usize {
        self.lock_unchecked()
            .objects
            .values()
            .filter(|o| matches!(o, SimObject::Buffer(b) if b.mapped.is_some()))
            .count()
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| sim_error(op, "simulator state poisoned".into()))
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new(SimImage::identity())
    }
}

impl ComputeRuntime for SimRuntime {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(vec![PlatformInfo {
            index: 0,
            handle: RawHandle::from_id(PLATFORM_ID),
            name: "accelflow simulator".into(),
            vendor: "accelflow".into(),
            version: "ACCELSIM1".into(),
        }])
    }

    fn devices(&self, platform: &PlatformInfo, class: DeviceClass) -> Result<Vec<DeviceInfo>> {
        let state = self.lock("devices")?;
        if platform.handle.id() != PLATFORM_ID || state.has_fault(&SimFault::NoDevices) {
            return Ok(Vec::new());
        }
        if !matches!(class, DeviceClass::Accelerator | DeviceClass::Any) {
            return Ok(Vec::new());
        }
        Ok(vec![DeviceInfo {
            index: 0,
            handle: RawHandle::from_id(DEVICE_ID),
            name: "simulated streaming accelerator".into(),
            class: DeviceClass::Accelerator,
            global_mem_bytes: SIM_GLOBAL_MEM_BYTES,
        }])
    }

    fn create_context(&self, device: RawHandle) -> Result<RawHandle> {
        let mut state = self.lock("create_context")?;
        if device.id() != DEVICE_ID {
            return Err(sim_error("create_context", format!("{device:?} is not a device")));
        }
        state.ops.push(SimOp::CreateContext);
        Ok(state.insert(SimObject::Context))
    }

    fn create_queue(&self, context: RawHandle, device: RawHandle) -> Result<RawHandle> {
        let mut state = self.lock("create_queue")?;
        state.expect_kind(context, HandleKind::Context, "create_queue")?;
        if device.id() != DEVICE_ID {
            return Err(sim_error("create_queue", format!("{device:?} is not a device")));
        }
        let ordinal = state.queues_created;
        state.queues_created += 1;
        state.ops.push(SimOp::CreateQueue { ordinal });
        Ok(state.insert(SimObject::Queue { ordinal }))
    }

    fn build_program(
        &self,
        context: RawHandle,
        _device: RawHandle,
        binary: &[u8],
    ) -> Result<RawHandle> {
        let mut state = self.lock("build_program")?;
        state.expect_kind(context, HandleKind::Context, "build_program")?;
        state.ops.push(SimOp::BuildProgram);
        let image = SimImage::parse(binary).map_err(|log| EngineError::BuildRejected {
            code: "SIM_INVALID_BINARY".into(),
            log,
        })?;
        Ok(state.insert(SimObject::Program { image }))
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> Result<RawHandle> {
        let mut state = self.lock("create_kernel")?;
        let image = match state.objects.get(&program.id()) {
            Some(SimObject::Program { image }) => image.clone(),
            _ => {
                return Err(sim_error(
                    "create_kernel",
                    format!("{program:?} is not a live program"),
                ));
            }
        };
        state.ops.push(SimOp::CreateKernel { name: name.into() });
        let stage = image.stage_of(name).ok_or_else(|| EngineError::KernelNotFound {
            name: name.to_string(),
        })?;
        Ok(state.insert(SimObject::Kernel(SimKernel {
            name: name.to_string(),
            stage,
            transform: image.transform,
            args: BTreeMap::new(),
        })))
    }

    fn create_buffer(&self, context: RawHandle, bytes: usize) -> Result<RawHandle> {
        let mut state = self.lock("create_buffer")?;
        state.expect_kind(context, HandleKind::Context, "create_buffer")?;
        let nth = state.buffers_created;
        state.buffers_created += 1;
        state.ops.push(SimOp::CreateBuffer { bytes });
        if state.has_fault(&SimFault::AllocateBuffer { nth }) {
            return Err(sim_error("create_buffer", "injected allocation failure".into()));
        }
        if bytes == 0 {
            return Err(sim_error("create_buffer", "zero-sized buffer".into()));
        }
        Ok(state.insert(SimObject::Buffer(SimBuffer::zeroed(bytes))))
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: KernelArg) -> Result<()> {
        let mut state = self.lock("set_kernel_arg")?;
        if let KernelArg::Buffer(buffer) = arg {
            state.expect_kind(buffer, HandleKind::Buffer, "set_kernel_arg")?;
        }
        let name = match state.objects.get_mut(&kernel.id()) {
            Some(SimObject::Kernel(k)) => {
                k.args.insert(index, arg);
                k.name.clone()
            }
            _ => {
                return Err(sim_error(
                    "set_kernel_arg",
                    format!("{kernel:?} is not a live kernel"),
                ));
            }
        };
        state.ops.push(SimOp::SetArg {
            kernel: name.clone(),
            index,
            arg,
        });
        if state.has_fault(&SimFault::SetKernelArg {
            kernel: name.clone(),
            index,
        }) {
            return Err(sim_error(
                "set_kernel_arg",
                format!("kernel `{name}` rejects argument {index} ({arg:?})"),
            ));
        }
        Ok(())
    }

    fn enqueue_task(&self, queue: RawHandle, kernel: RawHandle) -> Result<()> {
        let mut state = self.lock("enqueue_task")?;
        let ordinal = state.queue_ordinal(queue, "enqueue_task")?;
        let name = match state.objects.get(&kernel.id()) {
            Some(SimObject::Kernel(k)) => k.name.clone(),
            _ => {
                return Err(sim_error(
                    "enqueue_task",
                    format!("{kernel:?} is not a live kernel"),
                ));
            }
        };
        state.ops.push(SimOp::EnqueueTask {
            queue: ordinal,
            kernel: name.clone(),
        });
        if state.has_fault(&SimFault::EnqueueKernel(name.clone())) {
            return Err(sim_error("enqueue_task", format!("injected failure for `{name}`")));
        }
        trace!(queue = ordinal, kernel = %name, "sim task");
        state.run_kernel(kernel)
    }

    fn finish(&self, queue: RawHandle) -> Result<()> {
        let mut state = self.lock("finish")?;
        let ordinal = state.queue_ordinal(queue, "finish")?;
        state.ops.push(SimOp::Finish { queue: ordinal });
        if state.has_fault(&SimFault::Finish) {
            return Err(sim_error("finish", "injected queue failure".into()));
        }
        Ok(())
    }

    fn map_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        mode: MapMode,
        bytes: usize,
    ) -> Result<NonNull<u8>> {
        let mut state = self.lock("map_buffer")?;
        state.queue_ordinal(queue, "map_buffer")?;
        state.ops.push(SimOp::Map {
            buffer: buffer.id(),
            mode,
        });
        if state.has_fault(&SimFault::MapBuffer) {
            return Err(sim_error("map_buffer", "injected map failure".into()));
        }
        let buf = state.buffer_mut(buffer, "map_buffer")?;
        if buf.mapped.is_some() {
            return Err(sim_error("map_buffer", "buffer is already mapped".into()));
        }
        if bytes > buf.len {
            return Err(sim_error(
                "map_buffer",
                format!("map of {bytes} bytes exceeds {}-byte buffer", buf.len),
            ));
        }
        buf.mapped = Some(mode);
        Ok(buf.ptr)
    }

    fn unmap_buffer(&self, queue: RawHandle, buffer: RawHandle, ptr: NonNull<u8>) -> Result<()> {
        let mut state = self.lock("unmap_buffer")?;
        state.queue_ordinal(queue, "unmap_buffer")?;
        state.ops.push(SimOp::Unmap {
            buffer: buffer.id(),
        });
        let buf = state.buffer_mut(buffer, "unmap_buffer")?;
        if buf.mapped.is_none() || buf.ptr != ptr {
            return Err(sim_error(
                "unmap_buffer",
                "pointer does not match an outstanding mapping".into(),
            ));
        }
        buf.mapped = None;
        Ok(())
    }

    fn release(&self, kind: HandleKind, handle: RawHandle) -> Result<()> {
        let mut state = self.lock("release")?;
        state.ops.push(SimOp::Release {
            kind,
            id: handle.id(),
        });
        state.expect_kind(handle, kind, "release")?;
        state.objects.remove(&handle.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(sim: &SimRuntime) -> (RawHandle, RawHandle) {
        let platform = sim.platforms().expect("platforms").remove(0);
        let device = sim
            .devices(&platform, DeviceClass::Accelerator)
            .expect("devices")
            .remove(0);
        let ctx = sim.create_context(device.handle).expect("context");
        let queue = sim.create_queue(ctx, device.handle).expect("queue");
        (ctx, queue)
    }

    #[test]
    fn image_text_form_parses_back() {
        let image = SimImage::with_transform(TransformOp::Sobel).with_kernels([
            "mem_read",
            "sobel",
            "mem_write",
        ]);
        let parsed = SimImage::parse(&image.to_bytes()).expect("parse");
        assert_eq!(parsed, image);
    }

    #[test]
    fn image_without_header_is_rejected() {
        let err = SimImage::parse(b"\x7fELF garbage").expect_err("must reject");
        assert!(err.contains("ACCELSIM1"));
        let err = SimImage::parse(b"ACCELSIM1\nkernels=ingest,egress\n").expect_err("two kernels");
        assert!(err.contains("three kernels"));
    }

    #[test]
    fn gpu_class_finds_no_device() {
        let sim = SimRuntime::default();
        let platform = sim.platforms().expect("platforms").remove(0);
        assert!(sim.devices(&platform, DeviceClass::Gpu).expect("devices").is_empty());
        assert_eq!(sim.devices(&platform, DeviceClass::Any).expect("devices").len(), 1);
    }

    #[test]
    fn double_map_is_rejected() {
        let sim = SimRuntime::default();
        let (ctx, queue) = setup(&sim);
        let buf = sim.create_buffer(ctx, 16).expect("buffer");
        let ptr = sim.map_buffer(queue, buf, MapMode::Write, 16).expect("map");
        assert!(sim.map_buffer(queue, buf, MapMode::Read, 16).is_err());
        sim.unmap_buffer(queue, buf, ptr).expect("unmap");
        assert_eq!(sim.mapped_buffers(), 0);
    }

    #[test]
    fn transform_before_ingest_stalls() {
        let sim = SimRuntime::default();
        let (ctx, queue) = setup(&sim);
        let program = sim
            .build_program(ctx, RawHandle::from_id(DEVICE_ID), &SimImage::identity().to_bytes())
            .expect("build");
        let transform = sim.create_kernel(program, "transform").expect("kernel");
        sim.set_kernel_arg(transform, 0, KernelArg::Int(4)).expect("arg");
        sim.set_kernel_arg(transform, 1, KernelArg::Int(4)).expect("arg");
        let err = sim.enqueue_task(queue, transform).expect_err("stall");
        assert!(err.to_string().contains("stalled"));
    }

    #[test]
    fn sobel_flat_image_is_black_and_step_edge_is_bright() {
        let (w, h) = (8, 6);
        let flat = vec![90u8; w * h];
        assert!(TransformOp::Sobel.apply(&flat, w, h).iter().all(|&p| p == 0));

        let mut step = vec![0u8; w * h];
        for y in 0..h {
            for x in w / 2..w {
                step[y * w + x] = 200;
            }
        }
        let out = TransformOp::Sobel.apply(&step, w, h);
        assert_eq!(out[2 * w + w / 2], 255);
        assert_eq!(out[2 * w + 1], 0);
        assert_eq!(out[0], 0, "border stays black");
    }

    #[test]
    fn invert_is_an_involution() {
        let src: Vec<u8> = (0..=255).collect();
        let once = TransformOp::Invert.apply(&src, 16, 16);
        assert_eq!(TransformOp::Invert.apply(&once, 16, 16), src);
    }
}
