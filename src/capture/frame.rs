use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Frame data with zero-copy semantics
#[derive(Clone, Debug)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    /// Text drawn onto the frame by the annotation layer
    pub overlay: Vec<String>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Assigned by the pipeline, starting at 1. Zero until the frame enters a cycle.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Camera or stream the frame came from.
    pub source_id: Arc<str>,
    /// Wall-clock capture time. Events raised for this frame carry this time.
    pub captured_at: SystemTime,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn channels(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Mjpeg => None,
        }
    }
}

impl Frame {
    /// Build a packed frame captured now. `stride` is derived from the format.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        source_id: Arc<str>,
    ) -> Self {
        let stride = width * format.channels().unwrap_or(1);
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                width,
                height,
                stride,
                format,
                source_id,
                captured_at: SystemTime::now(),
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
            overlay: Vec::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn source_id(&self) -> &str {
        &self.meta.source_id
    }

    pub fn captured_at(&self) -> SystemTime {
        self.meta.captured_at
    }

    /// Same frame with the pipeline's sequence number stamped into its metadata.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        Arc::make_mut(&mut self.meta).sequence = sequence;
        self
    }

    /// Override the capture time, e.g. with a presentation timestamp from a file.
    pub fn with_captured_at(mut self, captured_at: SystemTime) -> Self {
        Arc::make_mut(&mut self.meta).captured_at = captured_at;
        self
    }

    pub fn with_device_timestamp(mut self, ts: Option<Duration>) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = ts;
        self
    }

    /// Copy of this frame carrying new pixels. Metadata and capture instant are shared.
    pub fn with_data(&self, data: Vec<u8>, overlay: Vec<String>) -> Self {
        Self {
            data: Bytes::from(data),
            meta: Arc::clone(&self.meta),
            timestamp: self.timestamp,
            overlay,
        }
    }
}
