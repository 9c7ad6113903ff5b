#![doc = include_str!("../README.md")]

pub mod error;
pub mod frame_io;
pub mod handle;
pub mod runtime;
pub mod sim;
pub mod types;

pub use error::{EngineError, ErrorClass, Result};
pub use runtime::{ComputeRuntime, DeviceInfo, HandleKind, KernelArg, PlatformInfo, RawHandle};
pub use types::{BufferRole, DeviceClass, FrameDims, MapMode, QueueRole};
