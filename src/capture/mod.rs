pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod image_seq;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use source::{open_source, FrameSource, SourceDescriptor};
#[cfg(feature = "v4l2-capture")]
pub use v4l2::V4l2Capture;
