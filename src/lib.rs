//! camview: real-time frame processing.
//!
//! A [`Pipeline`] reads frames from a [`FrameSource`], runs them through an
//! ordered [`AnalyzerSet`], publishes the resulting events to an
//! [`EventSink`], annotates each frame and keeps the newest ones in a
//! drop-oldest [`FrameBuffer`] for preview consumers. Progress is observed
//! through copied [`Status`] snapshots.

pub mod analyzer;
pub mod capture;
pub mod events;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use capture::frame::PixelFormat;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

pub use analyzer::{Analyzer, AnalyzerSet, MotionAnalyzer, MotionConfig};
pub use capture::{Frame, FrameSource, SourceDescriptor};
pub use events::{Event, EventSink, Severity};
pub use pipeline::{
    EngineState, FrameBuffer, Pipeline, PipelineError, SourceInfo, Status, StatusHandle,
    StopOutcome,
};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "camview.toml";
pub const ENV_PREFIX: &str = "CAMVIEW";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
    pub analyzers: AnalyzersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source descriptor: camera index or path, image directory, video file
    /// or `synthetic://<frames>[@<fps>]`.
    pub source: String,
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    /// Requested rate for cameras and image sequences. 0 leaves it to the device.
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_buffer_size: usize,
    /// Used when the source reports no usable frame rate. A non-positive
    /// value disables pacing.
    pub default_fps: f64,
    pub stop_timeout_ms: u64,
    /// CPU core for the producer thread.
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub log_file: String,
    pub log_enabled: bool,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzersConfig {
    pub motion: MotionConfig,
}

/// Works in every build. Cameras need the `v4l2-capture` feature and video
/// files need `gstreamer-pipeline`.
pub const DEFAULT_SOURCE: &str = "synthetic://300@30";

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.into(),
            camera_id: "CAM_01".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_buffer_size: pipeline::ringbuf::DEFAULT_CAPACITY,
            default_fps: 30.0,
            stop_timeout_ms: 2000,
            pin_core: None,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log_file: "data/logs/events.jsonl".into(),
            log_enabled: true,
            channel_capacity: 256,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file, then `CAMVIEW__SECTION__KEY` variables.
    ///
    /// An explicit `path` must exist; the default `camview.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let loaded: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.frame_buffer_size == 0 {
            return Err(eyre!("pipeline.frame_buffer_size must be at least 1"));
        }
        if self.pipeline.stop_timeout_ms == 0 {
            return Err(eyre!("pipeline.stop_timeout_ms must be positive"));
        }
        if self.events.channel_capacity == 0 {
            return Err(eyre!("events.channel_capacity must be at least 1"));
        }
        if self.capture.camera_id.trim().is_empty() {
            return Err(eyre!("capture.camera_id must not be empty"));
        }
        Ok(())
    }

    pub fn source_descriptor(&self) -> Result<SourceDescriptor> {
        self.capture.source.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.frame_buffer_size, 30);
        assert_eq!(config.pipeline.default_fps, 30.0);
        assert_eq!(config.events.log_file, "data/logs/events.jsonl");
    }

    #[test]
    fn default_source_opens_without_optional_features() {
        let config = Config::default();
        let descriptor = config.source_descriptor().unwrap();
        let mut source = capture::open_source(&descriptor, &config.capture).unwrap();
        assert!(source.is_open());
        assert_eq!(source.total_frames(), Some(300));
        assert_eq!(source.frame_rate(), Some(30.0));
        assert!(source.read().unwrap().is_some());
        source.release();
    }

    #[test]
    fn validation_rejects_zero_sizes() {
        let mut config = Config::default();
        config.pipeline.frame_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stop_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camview.toml");
        std::fs::write(
            &path,
            r#"
[capture]
source = "synthetic://20@10"
camera_id = "GATE"

[pipeline]
frame_buffer_size = 8

[analyzers.motion]
threshold = 30.0
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.camera_id, "GATE");
        assert_eq!(config.pipeline.frame_buffer_size, 8);
        assert_eq!(config.pipeline.stop_timeout_ms, 2000);
        assert_eq!(config.analyzers.motion.threshold, 30.0);
        assert_eq!(config.analyzers.motion.cooldown_frames, 15);
        assert_eq!(
            config.source_descriptor().unwrap(),
            SourceDescriptor::Synthetic {
                frames: 20,
                fps: Some(10.0)
            }
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
