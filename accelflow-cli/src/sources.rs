//! Frame sources: still images and synthetic patterns.

use std::path::Path;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::frame_io::{FrameSource, FrameStatus};
use accelflow_core::types::FrameDims;
use clap::ValueEnum;
use image::imageops::FilterType;
use tracing::{debug, info};

/// A single grayscale plane replayed every frame.
pub struct StillSource {
    dims: FrameDims,
    pixels: Vec<u8>,
}

impl StillSource {
    /// Decode `path` to 8-bit grayscale.
    ///
    /// The image keeps its own size unless `resize_to` names another one.
    /// An unreadable file is a usage error: it is reported before setup.
    pub fn open(path: &Path, resize_to: Option<FrameDims>) -> Result<Self> {
        let gray = image::open(path)
            .map_err(|e| EngineError::Config(format!("cannot open {}: {e}", path.display())))?
            .to_luma8();
        let (w, h) = gray.dimensions();
        let (gray, dims) = match resize_to {
            Some(dims) if (w, h) != (dims.width(), dims.height()) => {
                debug!(from = %format!("{w}x{h}"), to = %dims, "Resizing input image");
                let resized = image::imageops::resize(
                    &gray,
                    dims.width(),
                    dims.height(),
                    FilterType::Triangle,
                );
                (resized, dims)
            }
            _ => (gray, FrameDims::new(w, h)?),
        };
        info!(path = %path.display(), dims = %dims, "Still image loaded");
        Ok(Self {
            dims,
            pixels: gray.into_raw(),
        })
    }
}

impl FrameSource for StillSource {
    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn read_frame(&mut self, dst: &mut [u8]) -> Result<FrameStatus> {
        copy_frame(&self.pixels, dst)?;
        Ok(FrameStatus::Ready)
    }
}

/// Synthetic test pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Pattern {
    /// Every pixel set to `--value`.
    Uniform,
    /// Horizontal ramp 0..=255.
    Gradient,
    /// 32-pixel checkerboard of 0 and `--value`.
    Checker,
}

pub struct PatternSource {
    dims: FrameDims,
    pixels: Vec<u8>,
}

impl PatternSource {
    pub fn new(pattern: Pattern, dims: FrameDims, value: u8) -> Self {
        Self {
            dims,
            pixels: render(pattern, dims, value),
        }
    }
}

impl FrameSource for PatternSource {
    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn read_frame(&mut self, dst: &mut [u8]) -> Result<FrameStatus> {
        copy_frame(&self.pixels, dst)?;
        Ok(FrameStatus::Ready)
    }
}

const CHECKER_CELL: usize = 32;

fn render(pattern: Pattern, dims: FrameDims, value: u8) -> Vec<u8> {
    let (w, h) = (dims.width() as usize, dims.height() as usize);
    match pattern {
        Pattern::Uniform => vec![value; w * h],
        Pattern::Gradient => {
            let span = (w - 1).max(1);
            (0..h)
                .flat_map(|_| (0..w).map(move |x| (x * 255 / span) as u8))
                .collect()
        }
        Pattern::Checker => (0..h)
            .flat_map(|y| {
                (0..w).map(move |x| {
                    if (x / CHECKER_CELL + y / CHECKER_CELL) % 2 == 0 {
                        0
                    } else {
                        value
                    }
                })
            })
            .collect(),
    }
}

fn copy_frame(src: &[u8], dst: &mut [u8]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(EngineError::BufferTooSmall {
            need: src.len(),
            have: dst.len(),
        });
    }
    dst.copy_from_slice(src);
    Ok(())
}
