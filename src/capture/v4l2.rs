//! Live V4L2 camera capture with memory-mapped buffers

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::{
    capture::{
        decoder,
        frame::{Frame, PixelFormat},
        FrameSource,
    },
    utils::FoundDevice,
    CaptureConfig,
};

/// V4L2 capture feeding decoded RGB24 frames
pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    found: FoundDevice,
    config: CaptureConfig,
    camera_id: Arc<str>,
    width: u32,
    height: u32,
    fps: Option<f64>,
}

impl V4l2Capture {
    /// Open the device node and negotiate format and size
    #[instrument(skip(config))]
    pub fn new(found: FoundDevice, config: CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {:?}", found);

        let device = Device::with_path(&found.path)?;

        // Query capabilities
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        // Set format
        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match found.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => return Err(eyre!("Unsupported camera pixel format: {:?}", other)),
        };
        let fmt = device.set_format(&fmt)?;
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Driver adjusted frame size to {}x{} (requested {}x{})",
                fmt.width, fmt.height, config.width, config.height
            );
        }

        // Frame interval is seconds per frame
        let fps = device.params().ok().and_then(|params| {
            let interval = params.interval;
            (interval.numerator > 0)
                .then(|| interval.denominator as f64 / interval.numerator as f64)
        });

        Ok(Self {
            device: Box::new(device),
            stream: None,
            camera_id: config.camera_id.as_str().into(),
            width: fmt.width,
            height: fmt.height,
            found,
            config,
            fps,
        })
    }
}

impl FrameSource for V4l2Capture {
    /// Start streaming with memory-mapped buffers
    fn open(&mut self) -> Result<()> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| eyre!("Stream not started"))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        let decoded = decoder::decode_frame(&buf[..used], self.found.format, self.width, self.height)?;

        let frame = Frame::new(
            decoded.pixels,
            decoded.width,
            decoded.height,
            PixelFormat::Rgb24,
            Arc::clone(&self.camera_id),
        )
        .with_device_timestamp(Some(device_ts));
        Ok(Some(frame))
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn total_frames(&self) -> Option<u64> {
        None
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            info!("Released {}", self.found.path);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        format!("camera {} ({}x{})", self.found.path, self.width, self.height)
    }
}
