//! Frame-difference motion detector.

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use super::Analyzer;
use crate::capture::{Frame, PixelFormat};
use crate::events::{Event, Severity};

pub const MOTION_EVENT: &str = "MOTION";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Mean absolute luma difference (0-255) that counts as motion.
    pub threshold: f32,
    /// Score at which the event is raised as critical.
    pub critical_threshold: f32,
    /// Frames to stay quiet after raising an event.
    pub cooldown_frames: u64,
    /// Sample every n-th pixel in both directions.
    pub sample_step: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 12.0,
            critical_threshold: 48.0,
            cooldown_frames: 15,
            sample_step: 4,
        }
    }
}

pub struct MotionAnalyzer {
    config: MotionConfig,
    previous: Option<(u32, u32, Vec<u8>)>,
    quiet_until: u64,
}

impl MotionAnalyzer {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            previous: None,
            quiet_until: 0,
        }
    }

    fn sample_luma(&self, frame: &Frame) -> Option<Vec<u8>> {
        let step = self.config.sample_step.max(1) as usize;
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let stride = frame.meta.stride as usize;
        let data = &frame.data;
        let luma_at: fn(&[u8]) -> u8 = match frame.format() {
            PixelFormat::Rgb24 => |p| luma(p[0], p[1], p[2]),
            PixelFormat::Bgr24 => |p| luma(p[2], p[1], p[0]),
            PixelFormat::Gray8 => |p| p[0],
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg => return None,
        };
        let bpp = frame.format().channels()? as usize;
        if data.len() < stride * h {
            return None;
        }

        let mut out = Vec::with_capacity((w / step + 1) * (h / step + 1));
        for y in (0..h).step_by(step) {
            let row = &data[y * stride..];
            for x in (0..w).step_by(step) {
                out.push(luma_at(&row[x * bpp..x * bpp + bpp]));
            }
        }
        Some(out)
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

impl Analyzer for MotionAnalyzer {
    fn name(&self) -> &str {
        "motion"
    }

    fn process(&mut self, frame: &Frame, frame_index: u64) -> Result<Vec<Event>> {
        let Some(current) = self.sample_luma(frame) else {
            return Ok(Vec::new());
        };
        let dims = (frame.width(), frame.height());

        let score = match self.previous.take() {
            Some((w, h, prev)) if (w, h) == dims && prev.len() == current.len() && !prev.is_empty() => {
                let total: u64 = prev
                    .iter()
                    .zip(&current)
                    .map(|(a, b)| a.abs_diff(*b) as u64)
                    .sum();
                Some(total as f32 / current.len() as f32)
            }
            _ => None,
        };
        self.previous = Some((dims.0, dims.1, current));

        let Some(score) = score else {
            return Ok(Vec::new());
        };
        if score < self.config.threshold || frame_index < self.quiet_until {
            return Ok(Vec::new());
        }
        self.quiet_until = frame_index + self.config.cooldown_frames;

        let severity = if score >= self.config.critical_threshold {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Ok(vec![Event::for_frame(MOTION_EVENT, frame)
            .with_severity(severity)
            .with_metadata("score", score as f64)
            .with_metadata("frame_id", frame_index)])
    }
}
