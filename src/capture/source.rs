//! Frame source contract and descriptor parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Report, Result};
use tracing::{info, instrument};

use super::image_seq::ImageSequenceSource;
use super::synthetic::SyntheticSource;
use super::Frame;
use crate::{utils, CaptureConfig};

/// A capturable video device or file.
///
/// Implementations are driven from a single producer thread: `open` once,
/// `read` until it yields `None`, then `release`. `release` must be safe to
/// call more than once.
pub trait FrameSource: Send {
    /// Acquire the underlying device or file handle.
    fn open(&mut self) -> Result<()>;

    /// Next frame, or `None` once the stream is exhausted.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Nominal frame rate, if the source can report one.
    fn frame_rate(&self) -> Option<f64>;

    /// Total number of frames, if known ahead of time.
    fn total_frames(&self) -> Option<u64>;

    /// Give the device or file handle back.
    fn release(&mut self);

    fn is_open(&self) -> bool;

    /// Human readable name used in logs and status.
    fn describe(&self) -> String;
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDescriptor {
    /// V4L2 device path, or `auto` to probe `/dev/video*`.
    Camera { device: String },
    /// Directory of still images played back in lexical order.
    ImageSequence(PathBuf),
    /// Container file decoded through GStreamer.
    VideoFile(PathBuf),
    /// Generated test pattern.
    Synthetic { frames: u64, fps: Option<f64> },
}

const SYNTHETIC_SCHEME: &str = "synthetic://";

impl FromStr for SourceDescriptor {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(eyre!("empty source descriptor"));
        }
        if let Some(rest) = s.strip_prefix(SYNTHETIC_SCHEME) {
            let (frames, fps) = match rest.split_once('@') {
                Some((frames, fps)) => (frames, Some(fps)),
                None => (rest, None),
            };
            let frames = frames
                .parse::<u64>()
                .map_err(|_| eyre!("invalid synthetic frame count: {:?}", frames))?;
            let fps = fps
                .map(|f| f.parse::<f64>().map_err(|_| eyre!("invalid synthetic fps: {:?}", f)))
                .transpose()?;
            return Ok(SourceDescriptor::Synthetic { frames, fps });
        }
        if s == "auto" {
            return Ok(SourceDescriptor::Camera {
                device: "auto".into(),
            });
        }
        if let Some(index) = utils::parse_device_index(s) {
            return Ok(SourceDescriptor::Camera {
                device: format!("/dev/video{}", index),
            });
        }
        if s.contains("://") {
            return Err(eyre!("unsupported source scheme: {}", s));
        }
        let path = PathBuf::from(s);
        if path.is_dir() {
            Ok(SourceDescriptor::ImageSequence(path))
        } else {
            Ok(SourceDescriptor::VideoFile(path))
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Camera { device } => write!(f, "camera {}", device),
            SourceDescriptor::ImageSequence(path) => write!(f, "images {}", path.display()),
            SourceDescriptor::VideoFile(path) => write!(f, "file {}", path.display()),
            SourceDescriptor::Synthetic { frames, .. } => {
                write!(f, "{}{}", SYNTHETIC_SCHEME, frames)
            }
        }
    }
}

/// Construct and open the source a descriptor names.
#[instrument(skip(config))]
pub fn open_source(
    descriptor: &SourceDescriptor,
    config: &CaptureConfig,
) -> Result<Box<dyn FrameSource>> {
    let camera_id: Arc<str> = config.camera_id.as_str().into();

    let mut source: Box<dyn FrameSource> = match descriptor {
        SourceDescriptor::Synthetic { frames, fps } => Box::new(SyntheticSource::new(
            *frames,
            *fps,
            config.width,
            config.height,
            camera_id,
        )),
        SourceDescriptor::ImageSequence(dir) => Box::new(ImageSequenceSource::new(
            dir.clone(),
            configured_fps(config),
            camera_id,
        )),
        SourceDescriptor::Camera { device } => open_camera(device, config)?,
        SourceDescriptor::VideoFile(path) => open_video_file(path, camera_id)?,
    };

    source.open()?;
    info!("Opened {}", source.describe());
    Ok(source)
}

fn configured_fps(config: &CaptureConfig) -> Option<f64> {
    (config.fps > 0).then_some(config.fps as f64)
}

#[cfg(feature = "v4l2-capture")]
fn open_camera(device: &str, config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    let device = if device == "auto" {
        utils::auto_detect_device()?
    } else {
        utils::FoundDevice::new(device.to_string(), config.format)
    };
    Ok(Box::new(super::v4l2::V4l2Capture::new(device, config.clone())?))
}

#[cfg(not(feature = "v4l2-capture"))]
fn open_camera(device: &str, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    Err(eyre!(
        "camera {} requested but camview was built without the v4l2-capture feature",
        device
    ))
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_video_file(path: &Path, camera_id: Arc<str>) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(super::gst_capture::GstCapture::for_file(
        path, camera_id,
    )?))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_video_file(path: &Path, _camera_id: Arc<str>) -> Result<Box<dyn FrameSource>> {
    if !path.exists() {
        return Err(eyre!("video file not found: {}", path.display()));
    }
    Err(eyre!(
        "video file {} requires the gstreamer-pipeline feature",
        path.display()
    ))
}
