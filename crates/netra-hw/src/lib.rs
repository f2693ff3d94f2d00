//! netra-hw: video acquisition for the verification pipeline.
//!
//! Provides V4L2 camera capture and ffmpeg-decoded file/stream capture
//! behind a single `FrameSource` trait, resolved from one descriptor string.

pub mod camera;
pub mod ffmpeg;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use ffmpeg::FfmpegSource;
pub use frame::{Crop, Frame};
pub use source::{
    open_source, FrameSource, Geometry, SourceDescriptor, SourceError, OPEN_TIMEOUT, READ_TIMEOUT,
};
