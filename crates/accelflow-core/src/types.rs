//! Shared value types: frame dimensions, queue/buffer roles, map modes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Immutable frame size in pixels, fixed once at setup.
///
/// Frames are single-channel 8-bit planes with no row padding, so the byte
/// length is always exactly `width * height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameDims {
    width: u32,
    height: u32,
}

impl FrameDims {
    /// Validate and construct.
    ///
    /// Both sides must be non-zero and fit the signed 32-bit integer kernel
    /// arguments the pipeline binds them to.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::DimensionMismatch(format!(
                "frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        if width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(EngineError::DimensionMismatch(format!(
                "frame dimensions {width}x{height} exceed the kernel argument range"
            )));
        }
        Ok(Self { width, height })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Width as the `int` kernel argument.
    #[inline]
    pub fn width_arg(&self) -> i32 {
        self.width as i32
    }

    /// Height as the `int` kernel argument.
    #[inline]
    pub fn height_arg(&self) -> i32 {
        self.height as i32
    }

    /// Exact byte length of one grayscale plane.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for FrameDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One of the three independent execution queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRole {
    Ingest,
    Transform,
    Egress,
}

impl QueueRole {
    /// Submission order within one frame cycle.
    pub const ALL: [QueueRole; 3] = [QueueRole::Ingest, QueueRole::Transform, QueueRole::Egress];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Transform => "transform",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two host-visible device buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    Input,
    Output,
}

impl BufferRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    /// Queue that maps this buffer.
    ///
    /// Map/unmap is issued on the queue of the stage that accesses the buffer,
    /// so queue order fences host access against that stage's task.
    pub fn queue(self) -> QueueRole {
        match self {
            Self::Input => QueueRole::Ingest,
            Self::Output => QueueRole::Egress,
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host access requested by a map call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
}

impl MapMode {
    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Class of compute device to select.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// FPGA or other dedicated accelerator.
    #[default]
    Accelerator,
    Gpu,
    Cpu,
    /// Any device the platform exposes.
    Any,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accelerator => "accelerator",
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_has_no_padding() {
        for (w, h) in [(1, 1), (3, 7), (640, 480), (641, 479), (1920, 1080)] {
            let dims = FrameDims::new(w, h).expect("valid dims");
            assert_eq!(dims.byte_len(), (w * h) as usize);
        }
    }

    #[test]
    fn zero_and_oversized_dims_are_rejected() {
        assert!(FrameDims::new(0, 480).is_err());
        assert!(FrameDims::new(640, 0).is_err());
        assert!(FrameDims::new(i32::MAX as u32 + 1, 1).is_err());
        assert!(FrameDims::new(i32::MAX as u32, 1).is_ok());
    }

    #[test]
    fn buffers_map_on_their_stage_queue() {
        assert_eq!(BufferRole::Input.queue(), QueueRole::Ingest);
        assert_eq!(BufferRole::Output.queue(), QueueRole::Egress);
    }
}
