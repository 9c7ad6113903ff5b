//! Typed error hierarchy for the orchestrator.
//!
//! Uses `thiserror` for library-grade errors. The CLI maps each variant to a
//! process exit code through [`EngineError::exit_code`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured logging without string parsing.

use std::path::PathBuf;

use crate::types::{BufferRole, QueueRole};

/// Which phase of the process an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Raised before the frame loop starts. The loop is never entered.
    Setup,
    /// Raised while the frame loop is running. Pipeline state is undefined.
    Runtime,
    /// Bad command line or configuration input.
    Usage,
}

/// All errors originating from the accelflow orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Setup ─────────────────────────────────────────────────────────
    #[error("compute runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("no usable device: {0}")]
    DeviceUnavailable(String),

    #[error("pipeline binary not found: {}", path.display())]
    BinaryNotFound { path: PathBuf },

    #[error("failed to read pipeline binary {}: {source}", path.display())]
    BinaryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("program build rejected ({code}): {log}")]
    BuildRejected { code: String, log: String },

    #[error("kernel `{name}` not found in pipeline program")]
    KernelNotFound { name: String },

    #[error("failed to allocate {bytes} bytes for {role} buffer: {reason}")]
    AllocationFailed {
        role: BufferRole,
        bytes: usize,
        reason: String,
    },

    #[error("{op} failed: {reason}")]
    Driver { op: &'static str, reason: String },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    // ── Frame loop ───────────────────────────────────────────────────
    #[error("failed to map {role} buffer: {reason}")]
    MapFailed { role: BufferRole, reason: String },

    #[error("failed to submit {queue} task: {reason}")]
    SubmitFailed { queue: QueueRole, reason: String },

    #[error("failed waiting on {queue} queue: {reason}")]
    WaitFailed { queue: QueueRole, reason: String },

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("frame source error: {0}")]
    Source(String),

    #[error("display error: {0}")]
    Display(String),

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ── Usage ────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable integer error code for structured logging.
    ///
    /// Codes are grouped by category:
    /// - 1xx: setup
    /// - 2xx: frame loop
    /// - 3xx: invariants
    /// - 4xx: usage
    pub fn error_code(&self) -> u32 {
        match self {
            Self::RuntimeUnavailable(_) => 100,
            Self::DeviceUnavailable(_) => 101,
            Self::BinaryNotFound { .. } => 102,
            Self::BinaryRead { .. } => 103,
            Self::BuildRejected { .. } => 104,
            Self::KernelNotFound { .. } => 105,
            Self::AllocationFailed { .. } => 106,
            Self::Driver { .. } => 107,
            Self::DimensionMismatch(_) => 108,
            Self::MapFailed { .. } => 200,
            Self::SubmitFailed { .. } => 201,
            Self::WaitFailed { .. } => 202,
            Self::BufferTooSmall { .. } => 203,
            Self::Source(_) => 204,
            Self::Display(_) => 205,
            Self::InvariantViolation(_) => 300,
            Self::Config(_) => 400,
        }
    }

    /// Phase the error belongs to.
    ///
    /// `Driver` errors are classified as setup failures; the frame loop wraps
    /// driver calls into `MapFailed`/`SubmitFailed`/`WaitFailed` instead.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RuntimeUnavailable(_)
            | Self::DeviceUnavailable(_)
            | Self::BinaryNotFound { .. }
            | Self::BinaryRead { .. }
            | Self::BuildRejected { .. }
            | Self::KernelNotFound { .. }
            | Self::AllocationFailed { .. }
            | Self::Driver { .. }
            | Self::DimensionMismatch(_) => ErrorClass::Setup,
            Self::MapFailed { .. }
            | Self::SubmitFailed { .. }
            | Self::WaitFailed { .. }
            | Self::BufferTooSmall { .. }
            | Self::Source(_)
            | Self::Display(_)
            | Self::InvariantViolation(_) => ErrorClass::Runtime,
            Self::Config(_) => ErrorClass::Usage,
        }
    }

    /// Process exit code for this error. Never zero.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Setup => 2,
            ErrorClass::Runtime => 3,
            ErrorClass::Usage => 4,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
