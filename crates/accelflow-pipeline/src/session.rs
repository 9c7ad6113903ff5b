//! Device session: one device, one context, three independent queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use accelflow_core::error::{EngineError, Result};
use accelflow_core::handle::DeviceHandle;
use accelflow_core::runtime::{ComputeRuntime, DeviceInfo, HandleKind, PlatformInfo, RawHandle};
use accelflow_core::types::QueueRole;
use tracing::{debug, info};

use crate::buffers::MapFence;
use crate::config::DeviceSelector;
use crate::teardown::TeardownReport;

// ─── Device memory accounting ───────────────────────────────────────────────

/// Atomic device-memory byte counters for buffers allocated in a session.
pub(crate) struct DeviceMemory {
    current: AtomicUsize,
    peak: AtomicUsize,
    limit: u64,
}

impl DeviceMemory {
    fn new(limit: u64) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    /// Bytes still available, or `None` if the device reported no limit.
    #[inline]
    pub(crate) fn headroom(&self) -> Option<u64> {
        if self.limit == 0 {
            return None;
        }
        let current = self.current.load(Ordering::Relaxed) as u64;
        Some(self.limit.saturating_sub(current))
    }

    #[inline]
    pub(crate) fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

fn queue_label(role: QueueRole) -> &'static str {
    match role {
        QueueRole::Ingest => "ingest queue",
        QueueRole::Transform => "transform queue",
        QueueRole::Egress => "egress queue",
    }
}

/// An open device with its context and the three stage queues.
///
/// Field order is drop order: the queues are released before the context.
pub struct Session {
    ingest: DeviceHandle,
    transform: DeviceHandle,
    egress: DeviceHandle,
    context: DeviceHandle,
    fence: MapFence,
    memory: Arc<DeviceMemory>,
    platform: PlatformInfo,
    device: DeviceInfo,
    runtime: Arc<dyn ComputeRuntime>,
}

impl Session {
    /// Select a device and create the context and queues.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no platform or no device of the requested
    /// class exists; `Driver` if context or queue creation fails. Anything
    /// created before the failure is released on return.
    pub fn open(runtime: Arc<dyn ComputeRuntime>, selector: &DeviceSelector) -> Result<Self> {
        let (platform, device) = select_device(runtime.as_ref(), selector)?;
        info!(
            runtime = runtime.name(),
            platform = %platform.name,
            vendor = %platform.vendor,
            device = %device.name,
            class = %device.class,
            global_mem_mb = device.global_mem_bytes / (1024 * 1024),
            "Device selected"
        );

        let context = DeviceHandle::new(
            runtime.clone(),
            HandleKind::Context,
            "context",
            runtime.create_context(device.handle)?,
        );
        let ctx = context.raw()?;

        let open_queue = |role: QueueRole| -> Result<DeviceHandle> {
            let raw = runtime.create_queue(ctx, device.handle)?;
            debug!(queue = %role, ?raw, "Queue created");
            Ok(DeviceHandle::new(
                runtime.clone(),
                HandleKind::Queue,
                queue_label(role),
                raw,
            ))
        };
        let ingest = open_queue(QueueRole::Ingest)?;
        let transform = open_queue(QueueRole::Transform)?;
        let egress = open_queue(QueueRole::Egress)?;

        Ok(Self {
            ingest,
            transform,
            egress,
            context,
            fence: MapFence::new(),
            memory: Arc::new(DeviceMemory::new(device.global_mem_bytes)),
            platform,
            device,
            runtime,
        })
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Raw handle of the selected device.
    #[inline]
    pub fn device_handle(&self) -> RawHandle {
        self.device.handle
    }

    pub fn context(&self) -> Result<RawHandle> {
        self.context.raw()
    }

    /// The queue dedicated to `role`.
    pub fn queue(&self, role: QueueRole) -> Result<RawHandle> {
        match role {
            QueueRole::Ingest => self.ingest.raw(),
            QueueRole::Transform => self.transform.raw(),
            QueueRole::Egress => self.egress.raw(),
        }
    }

    /// Map fence shared by every buffer allocated in this session.
    #[inline]
    pub fn fence(&self) -> &MapFence {
        &self.fence
    }

    pub(crate) fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    /// `(current, peak)` bytes of device memory held by session buffers.
    pub fn memory_usage(&self) -> (usize, usize) {
        self.memory.snapshot()
    }

    pub fn is_open(&self) -> bool {
        self.context.is_live()
    }

    /// Release the queues, then the context. Idempotent.
    pub fn close(&mut self, report: &mut TeardownReport) {
        report.release(&mut self.ingest);
        report.release(&mut self.transform);
        report.release(&mut self.egress);
        report.release(&mut self.context);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("runtime", &self.runtime.name())
            .field("device", &self.device.name)
            .field("open", &self.is_open())
            .finish()
    }
}

fn select_device(
    runtime: &dyn ComputeRuntime,
    selector: &DeviceSelector,
) -> Result<(PlatformInfo, DeviceInfo)> {
    let platforms = runtime.platforms()?;
    if platforms.is_empty() {
        return Err(EngineError::DeviceUnavailable(format!(
            "{} runtime reports no platforms",
            runtime.name()
        )));
    }

    let searched: Vec<&PlatformInfo> = match selector.platform {
        Some(index) => {
            let platform = platforms.get(index).ok_or_else(|| {
                EngineError::DeviceUnavailable(format!(
                    "platform index {index} out of range ({} available)",
                    platforms.len()
                ))
            })?;
            vec![platform]
        }
        None => platforms.iter().collect(),
    };

    let mut matches = Vec::new();
    for platform in searched {
        for device in runtime.devices(platform, selector.class)? {
            matches.push((platform.clone(), device));
        }
    }

    let found = matches.len();
    if found == 0 {
        return Err(EngineError::DeviceUnavailable(format!(
            "no {} device found on {} platform(s)",
            selector.class,
            platforms.len()
        )));
    }
    matches.into_iter().nth(selector.device).ok_or_else(|| {
        EngineError::DeviceUnavailable(format!(
            "device index {} out of range ({found} {} device(s) found)",
            selector.device, selector.class
        ))
    })
}

#[cfg(test)]
mod tests {
    use accelflow_core::sim::{SimFault, SimOp, SimRuntime};
    use accelflow_core::types::{BufferRole, DeviceClass};

    use super::*;
    use crate::buffers::DeviceBuffer;

    fn sim() -> Arc<SimRuntime> {
        Arc::new(SimRuntime::default())
    }

    #[test]
    fn opens_one_context_and_three_queues() {
        let sim = sim();
        let session = Session::open(sim.clone(), &DeviceSelector::default()).expect("open");
        assert_eq!(sim.live_handles(), 4);
        let ops = sim.op_log();
        assert_eq!(ops[0], SimOp::CreateContext);
        assert_eq!(
            &ops[1..],
            &[
                SimOp::CreateQueue { ordinal: 0 },
                SimOp::CreateQueue { ordinal: 1 },
                SimOp::CreateQueue { ordinal: 2 },
            ]
        );
        let queues: Vec<RawHandle> = QueueRole::ALL
            .iter()
            .map(|&r| session.queue(r).expect("queue"))
            .collect();
        assert_ne!(queues[0], queues[1]);
        assert_ne!(queues[1], queues[2]);
    }

    #[test]
    fn missing_device_class_fails_fast() {
        let sim = sim();
        let selector = DeviceSelector {
            class: DeviceClass::Gpu,
            ..DeviceSelector::default()
        };
        let err = Session::open(sim.clone(), &selector).expect_err("no gpu");
        assert!(matches!(err, EngineError::DeviceUnavailable(_)));
        assert_eq!(sim.live_handles(), 0);
        assert!(sim.op_log().is_empty());
    }

    #[test]
    fn no_devices_is_device_unavailable() {
        let sim = sim();
        sim.inject(SimFault::NoDevices);
        let err = Session::open(sim, &DeviceSelector::default()).expect_err("no devices");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let selector = DeviceSelector {
            platform: Some(3),
            ..DeviceSelector::default()
        };
        assert!(Session::open(sim(), &selector).is_err());
        let selector = DeviceSelector {
            device: 1,
            ..DeviceSelector::default()
        };
        assert!(Session::open(sim(), &selector).is_err());
    }

    #[test]
    fn close_releases_queues_then_context_once() {
        let sim = sim();
        let mut session = Session::open(sim.clone(), &DeviceSelector::default()).expect("open");
        let mut report = TeardownReport::default();
        session.close(&mut report);
        session.close(&mut report);
        assert_eq!(
            report.released,
            vec!["ingest queue", "transform queue", "egress queue", "context"]
        );
        assert!(!session.is_open());
        assert!(session.queue(QueueRole::Egress).is_err());
        drop(session);
        assert_eq!(sim.release_log().len(), 4);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn drop_releases_queues_before_context() {
        let sim = sim();
        drop(Session::open(sim.clone(), &DeviceSelector::default()).expect("open"));
        let kinds: Vec<HandleKind> = sim.release_log().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                HandleKind::Queue,
                HandleKind::Queue,
                HandleKind::Queue,
                HandleKind::Context
            ]
        );
    }

    #[test]
    fn allocation_on_a_released_queue_leaves_no_accounting() {
        let sim = sim();
        let mut session = Session::open(sim.clone(), &DeviceSelector::default()).expect("open");
        session.egress.release().expect("release egress queue");

        let err = DeviceBuffer::allocate(&session, BufferRole::Output, 64)
            .err()
            .expect("egress queue is gone");
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(session.memory_usage(), (0, 0));
        assert!(!sim.op_log().iter().any(|op| matches!(op, SimOp::CreateBuffer { .. })));

        let input = DeviceBuffer::allocate(&session, BufferRole::Input, 64).expect("input");
        assert_eq!(session.memory_usage(), (64, 64));
        drop(input);
        assert_eq!(session.memory_usage(), (0, 64));
    }

    #[test]
    fn memory_accounting_tracks_peak() {
        let memory = DeviceMemory::new(1000);
        memory.on_alloc(600);
        memory.on_alloc(300);
        memory.on_free(600);
        assert_eq!(memory.snapshot(), (300, 900));
        assert_eq!(memory.headroom(), Some(700));
        assert_eq!(DeviceMemory::new(0).headroom(), None);
    }
}
