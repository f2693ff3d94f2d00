//! Video origin abstraction: one descriptor string resolves to either a
//! V4L2 camera or an ffmpeg-decoded file / network stream.

use crate::camera::Camera;
use crate::ffmpeg::FfmpegSource;
use crate::frame::Frame;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Longest wait for the first frame when a source is opened.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest wait for any later frame. A stalled source surfaces as
/// [`SourceError::Read`] after this long.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid video source descriptor: {0:?}")]
    InvalidDescriptor(String),
    #[error("frame read failed: {0}")]
    Read(String),
}

/// Requested capture geometry. Cameras may negotiate something else;
/// ffmpeg sources scale to exactly this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local camera by index (`/dev/video{index}`).
    Camera(u32),
    /// File path or network URL decoded by ffmpeg.
    Location(String),
}

impl SourceDescriptor {
    /// Resolve a configuration string: integer-looking ⇒ camera index,
    /// `/dev/videoN` ⇒ camera index, anything else ⇒ path/URL.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SourceError::InvalidDescriptor(raw.to_string()));
        }
        if let Some(index) = parse_device_index(trimmed) {
            return Ok(Self::Camera(index));
        }
        Ok(Self::Location(trimmed.to_string()))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(index) => write!(f, "camera:{index}"),
            Self::Location(location) => f.write_str(location),
        }
    }
}

fn parse_device_index(raw: &str) -> Option<u32> {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse().ok();
    }
    let digits = raw.strip_prefix("/dev/video")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok();
    }
    None
}

/// An ordered, blocking sequence of frames.
///
/// `Ok(None)` signals end-of-stream. Resources are released on drop.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Open the source named by `descriptor`.
pub fn open_source(
    descriptor: &SourceDescriptor,
    geometry: Geometry,
) -> Result<Box<dyn FrameSource + Send>, SourceError> {
    match descriptor {
        SourceDescriptor::Camera(index) => {
            let camera = Camera::open_index(*index, geometry)
                .map_err(|e| SourceError::Unavailable(format!("{descriptor}: {e}")))?;
            Ok(Box::new(camera))
        }
        SourceDescriptor::Location(location) => {
            let source = FfmpegSource::open(location, geometry)?;
            Ok(Box::new(source))
        }
    }
}
