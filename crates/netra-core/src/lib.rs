//! netra-core: face detection, recognition, matching and tracking.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings,
//! both running via ONNX Runtime for CPU inference, plus a cosine-distance
//! gallery matcher and an IoU tracker for following faces across frames.

pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod tracker;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceDetect, FaceDetector};
pub use gallery::{CosineMatcher, Gallery, GalleryEntry, Matcher};
pub use recognizer::{FaceEmbed, FaceRecognizer, RecognizerError};
pub use tracker::{Track, TrackId, Tracker, TrackerConfig, TrackerUpdate};
pub use types::{
    BoundingBox, Detection, Embedding, Identity, LectureContext, MatchResult, StudentRecord,
};

/// Default directory for ONNX model files: `$XDG_DATA_HOME/netra/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Netra data directory: `$XDG_DATA_HOME/netra`, falling back to `~/.local/share/netra`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("netra")
}
