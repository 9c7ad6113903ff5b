//! Frame source and display traits.
//!
//! These traits decouple the orchestrator from capture and presentation.
//! Implementations live in the CLI (still image, synthetic pattern, window,
//! headless); tests provide their own.

use crate::error::Result;
use crate::types::FrameDims;

// ─── Frame source (capture → input buffer) ───────────────────────────────

/// Outcome of one [`FrameSource::read_frame`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// `dst` now holds a complete frame.
    Ready,
    /// The source has no more frames. `dst` contents are unspecified.
    Exhausted,
}

/// Supplies grayscale planes of exactly `dims().byte_len()` bytes.
///
/// Dimensions are negotiated once, before setup, and never change.
pub trait FrameSource {
    /// Dimensions of every frame this source produces.
    fn dims(&self) -> FrameDims;

    /// Write the next frame directly into `dst` (the mapped input buffer).
    ///
    /// `dst.len()` equals `dims().byte_len()`.
    fn read_frame(&mut self, dst: &mut [u8]) -> Result<FrameStatus>;
}

// ─── Display (output buffer → screen) ────────────────────────────────────

/// Per-cycle decision returned by a display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayControl {
    Continue,
    /// The user asked to stop (quit key, escape, window closed).
    Stop,
}

/// Presents one grayscale plane per cycle.
pub trait FrameDisplay {
    /// Show `frame` with a status `label`. `frame` borrows the mapped output
    /// buffer and must not be retained past this call.
    fn present(&mut self, frame: &[u8], dims: FrameDims, label: &str) -> Result<DisplayControl>;
}

impl<D: FrameDisplay + ?Sized> FrameDisplay for Box<D> {
    fn present(&mut self, frame: &[u8], dims: FrameDims, label: &str) -> Result<DisplayControl> {
        (**self).present(frame, dims, label)
    }
}
