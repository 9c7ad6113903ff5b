//! Frame displays: headless logging, an optional window, and last-frame capture.

use std::path::Path;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::frame_io::{DisplayControl, FrameDisplay};
use accelflow_core::types::FrameDims;
use tracing::{debug, info};

/// Discards frames; logs the status label periodically.
pub struct HeadlessDisplay {
    presented: u64,
    log_every: u64,
}

impl HeadlessDisplay {
    pub fn new(log_every: u64) -> Self {
        Self {
            presented: 0,
            log_every: log_every.max(1),
        }
    }
}

impl FrameDisplay for HeadlessDisplay {
    fn present(&mut self, _frame: &[u8], _dims: FrameDims, label: &str) -> Result<DisplayControl> {
        self.presented += 1;
        if self.presented % self.log_every == 0 {
            info!(frame = self.presented, status = label, "Frame");
        } else {
            debug!(frame = self.presented, status = label, "Frame");
        }
        Ok(DisplayControl::Continue)
    }
}

/// Forwards to an inner display and keeps a copy of the last frame.
pub struct KeepLast<D> {
    inner: D,
    last: Option<(Vec<u8>, FrameDims)>,
}

impl<D: FrameDisplay> KeepLast<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, last: None }
    }

    /// Write the last presented frame as an 8-bit grayscale PNG.
    pub fn save_png(&self, path: &Path) -> Result<()> {
        let (pixels, dims) = self
            .last
            .as_ref()
            .ok_or_else(|| EngineError::Display("no frame was presented".into()))?;
        save_gray_png(path, pixels, *dims)
    }
}

impl<D: FrameDisplay> FrameDisplay for KeepLast<D> {
    fn present(&mut self, frame: &[u8], dims: FrameDims, label: &str) -> Result<DisplayControl> {
        match &mut self.last {
            Some((buf, d)) if buf.len() == frame.len() => {
                buf.copy_from_slice(frame);
                *d = dims;
            }
            slot => *slot = Some((frame.to_vec(), dims)),
        }
        self.inner.present(frame, dims, label)
    }
}

pub fn save_gray_png(path: &Path, pixels: &[u8], dims: FrameDims) -> Result<()> {
    let img = image::GrayImage::from_raw(dims.width(), dims.height(), pixels.to_vec())
        .ok_or_else(|| {
            EngineError::Display(format!(
                "{} bytes do not form a {dims} grayscale image",
                pixels.len()
            ))
        })?;
    img.save(path)
        .map_err(|e| EngineError::Display(format!("cannot write {}: {e}", path.display())))?;
    info!(path = %path.display(), dims = %dims, "Last frame saved");
    Ok(())
}

#[cfg(feature = "window")]
pub use window::WindowDisplay;

#[cfg(feature = "window")]
mod window {
    use accelflow_core::error::{EngineError, Result};
    use accelflow_core::frame_io::{DisplayControl, FrameDisplay};
    use accelflow_core::types::FrameDims;
    use minifb::{Key, Window, WindowOptions};

    /// On-screen grayscale output. `q`, Escape or closing the window stops.
    pub struct WindowDisplay {
        window: Window,
        framebuffer: Vec<u32>,
    }

    impl WindowDisplay {
        pub fn open(title: &str, dims: FrameDims) -> Result<Self> {
            let (w, h) = (dims.width() as usize, dims.height() as usize);
            let mut window = Window::new(
                title,
                w,
                h,
                WindowOptions {
                    resize: false,
                    ..WindowOptions::default()
                },
            )
            .map_err(|e| EngineError::Display(format!("cannot open window: {e}")))?;
            window.set_target_fps(0);
            Ok(Self {
                window,
                framebuffer: vec![0; w * h],
            })
        }
    }

    impl FrameDisplay for WindowDisplay {
        fn present(
            &mut self,
            frame: &[u8],
            dims: FrameDims,
            label: &str,
        ) -> Result<DisplayControl> {
            for (dst, &v) in self.framebuffer.iter_mut().zip(frame) {
                let v = v as u32;
                *dst = (v << 16) | (v << 8) | v; // 0x00RRGGBB
            }
            self.window.set_title(label);
            self.window
                .update_with_buffer(
                    &self.framebuffer,
                    dims.width() as usize,
                    dims.height() as usize,
                )
                .map_err(|e| EngineError::Display(format!("window update failed: {e}")))?;

            let quit = !self.window.is_open()
                || self.window.is_key_down(Key::Escape)
                || self.window.is_key_down(Key::Q);
            Ok(if quit {
                DisplayControl::Stop
            } else {
                DisplayControl::Continue
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_last_saves_the_final_frame() {
        let dims = FrameDims::new(4, 2).expect("dims");
        let mut display = KeepLast::new(HeadlessDisplay::new(10));
        assert!(display.save_png(Path::new("/tmp/unused.png")).is_err());

        display.present(&[1; 8], dims, "t | FPS: 1").expect("present");
        display.present(&[42; 8], dims, "t | FPS: 1").expect("present");

        let path = std::env::temp_dir().join(format!("accelflow-last-{}.png", std::process::id()));
        display.save_png(&path).expect("save");
        let img = image::open(&path).expect("reopen").to_luma8();
        assert_eq!(img.dimensions(), (4, 2));
        assert!(img.pixels().all(|p| p.0[0] == 42));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn headless_never_stops() {
        let dims = FrameDims::new(1, 1).expect("dims");
        let mut display = HeadlessDisplay::new(0);
        for _ in 0..3 {
            assert_eq!(
                display.present(&[0], dims, "x").expect("present"),
                DisplayControl::Continue
            );
        }
    }
}
