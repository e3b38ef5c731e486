//! GStreamer-based video file decoding

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::FrameSource;

/// Decodes any container GStreamer understands into RGB24 frames
pub struct GstCapture {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    camera_id: Arc<str>,
    fps: Option<f64>,
    total_frames: Option<u64>,
    started_at: SystemTime,
    playing: bool,
}

impl GstCapture {
    /// Build a `filesrc ! decodebin` pipeline for a local file
    #[instrument(skip(camera_id))]
    pub fn for_file(path: &Path, camera_id: Arc<str>) -> Result<Self> {
        if !path.exists() {
            return Err(eyre!("video file not found: {}", path.display()));
        }

        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        let pipeline_str = format!(
            "filesrc location=\"{}\" ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            path.display()
        );
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre!("Failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| eyre!("Failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| eyre!("Failed to cast to AppSink"))?;

        // Files are paced by the engine, not by the pipeline clock
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 4u32);
        appsink.set_property("drop", false);
        appsink.set_property("sync", false);

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            appsink,
            camera_id,
            fps: None,
            total_frames: None,
            started_at: SystemTime::now(),
            playing: false,
        })
    }

    fn wait_for_state(&self, what: &str) -> Result<()> {
        let (state_change, _, _) = self.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => Ok(()),
            Ok(gst::StateChangeSuccess::Async) => {
                debug!("Pipeline still {} asynchronously", what);
                Ok(())
            }
            Err(e) => Err(eyre!("Failed while {}: {:?}", what, e)),
        }
    }
}

impl FrameSource for GstCapture {
    fn open(&mut self) -> Result<()> {
        // Preroll to learn the negotiated caps and stream duration
        self.pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| eyre!("Failed to preroll pipeline: {:?}", e))?;
        self.wait_for_state("prerolling")?;

        let preroll_caps = self
            .appsink
            .pull_preroll()
            .ok()
            .and_then(|sample| sample.caps().map(|caps| caps.to_owned()));
        if let Some(caps) = preroll_caps {
            if let Ok(info) = gst_video::VideoInfo::from_caps(&caps) {
                let fps = info.fps();
                if fps.numer() > 0 && fps.denom() > 0 {
                    self.fps = Some(fps.numer() as f64 / fps.denom() as f64);
                }
            }
        }
        let duration = self.pipeline.query_duration::<gst::ClockTime>();
        self.total_frames = match (duration, self.fps) {
            (Some(d), Some(fps)) => Some((d.nseconds() as f64 / 1e9 * fps).round() as u64),
            _ => None,
        };

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start pipeline: {:?}", e))?;
        self.wait_for_state("starting")?;

        self.started_at = SystemTime::now();
        self.playing = true;
        info!(
            "Playing {} (fps {:?}, frames {:?})",
            self.path.display(),
            self.fps,
            self.total_frames
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.playing {
            return Err(eyre!("pipeline is not playing"));
        }

        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) if self.appsink.is_eos() => return Ok(None),
            Err(_) => return Err(eyre!("Failed to pull sample from pipeline")),
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| eyre!("Sample contains no buffer"))?;
        let caps = sample.caps().ok_or_else(|| eyre!("Sample has no caps"))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| eyre!("Failed to parse video info from caps"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| eyre!("Failed to map buffer"))?;

        // Rows may be padded; repack to a tight RGB24 layout
        let (width, height) = (info.width(), info.height());
        let row = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let data = map.as_slice();
        let pixels = if stride == row {
            data[..row * height as usize].to_vec()
        } else {
            let mut packed = Vec::with_capacity(row * height as usize);
            for y in 0..height as usize {
                packed.extend_from_slice(&data[y * stride..y * stride + row]);
            }
            packed
        };

        let pts = buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds()));
        let captured_at = pts
            .map(|pts| self.started_at + pts)
            .unwrap_or_else(SystemTime::now);

        Ok(Some(
            Frame::new(pixels, width, height, PixelFormat::Rgb24, Arc::clone(&self.camera_id))
                .with_captured_at(captured_at)
                .with_device_timestamp(pts),
        ))
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn release(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }

    fn is_open(&self) -> bool {
        self.playing
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.release();
    }
}
