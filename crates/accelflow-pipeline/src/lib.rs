#![doc = include_str!("../README.md")]

pub mod binary;
pub mod binder;
pub mod buffers;
pub mod config;
pub mod driver;
pub mod orchestrator;
pub mod session;
pub mod teardown;

pub use binder::{BoundPipeline, KernelBindings};
pub use config::{DeviceSelector, KernelNames, PipelineConfig, UploadPolicy, WaitPolicy};
pub use driver::{CycleState, FrameCycleDriver, RunSummary, StopReason};
pub use orchestrator::Orchestrator;
pub use session::Session;
pub use teardown::{TEARDOWN_ORDER, TeardownReport};
