//! Generated test pattern source (`synthetic://<frames>[@<fps>]`).

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::frame::{Frame, PixelFormat};
use super::FrameSource;

/// Moving gradient with a bright square that jumps every 50 frames.
pub struct SyntheticSource {
    frames: u64,
    fps: Option<f64>,
    width: u32,
    height: u32,
    camera_id: Arc<str>,
    produced: u64,
    open: bool,
}

impl SyntheticSource {
    pub fn new(frames: u64, fps: Option<f64>, width: u32, height: u32, camera_id: Arc<str>) -> Self {
        Self {
            frames,
            fps,
            width,
            height,
            camera_id,
            produced: 0,
            open: false,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.produced as usize;
        let scene = (self.produced / 50) as usize;
        let square = (w.min(h) / 4).max(1);
        let sx = (scene * 37) % w.saturating_sub(square).max(1);
        let sy = (scene * 23) % h.saturating_sub(square).max(1);

        let mut pixels = vec![0u8; w * h * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % w, i / w);
            let in_square = (sx..sx + square).contains(&x) && (sy..sy + square).contains(&y);
            if in_square {
                px.copy_from_slice(&[255, 255, 255]);
            } else {
                let v = ((x + y + shift) % 256) as u8;
                px.copy_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(eyre!(
                "synthetic source needs a non-empty frame size, got {}x{}",
                self.width,
                self.height
            ));
        }
        self.produced = 0;
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(eyre!("synthetic source is not open"));
        }
        if self.produced >= self.frames {
            debug!("Synthetic source exhausted after {} frames", self.produced);
            return Ok(None);
        }
        let pixels = self.render();
        self.produced += 1;
        Ok(Some(Frame::new(
            pixels,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            Arc::clone(&self.camera_id),
        )))
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.frames)
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!("synthetic://{} ({}x{})", self.frames, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_exactly_the_requested_frames() {
        let mut source = SyntheticSource::new(3, Some(10.0), 8, 6, "CAM".into());
        source.open().unwrap();
        let mut count = 0;
        while let Some(frame) = source.read().unwrap() {
            assert_eq!(frame.data.len(), 8 * 6 * 3);
            assert_eq!(frame.source_id(), "CAM");
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(source.total_frames(), Some(3));
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = SyntheticSource::new(1, None, 4, 4, "CAM".into());
        assert!(source.read().is_err());
    }

    #[test]
    fn zero_sized_frames_fail_to_open() {
        let mut source = SyntheticSource::new(1, None, 0, 4, "CAM".into());
        assert!(source.open().is_err());
    }
}
