use netra_hw::Geometry;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("NETRA_VIDEO_SOURCE is not set")]
    MissingVideoSource,
    #[error("frame skip must be at least 1")]
    InvalidFrameSkip,
    #[error("recognition threshold {0} is outside (0, 2]")]
    InvalidThreshold(f32),
    #[error("jpeg quality {0} is outside 1..=100")]
    InvalidJpegQuality(u8),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera index, `/dev/videoN`, file path or stream URL.
    pub video_source: Option<String>,
    /// Cosine distance below which a probe is accepted.
    pub recognition_threshold: f32,
    /// Run detection on every Nth frame.
    pub frame_skip: u64,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// HTTP listen address.
    pub bind_addr: String,
    /// Requested capture geometry.
    pub capture: Geometry,
    pub jpeg_quality: u8,
    /// How long a stream reader waits for a frame before re-checking for stop.
    pub stream_timeout: Duration,
    /// Processed frames a lost track is remembered for.
    pub track_buffer: u32,
    /// How long `stop` waits for the session thread before detaching it.
    pub stop_timeout: Duration,
}

impl Config {
    /// Load configuration from `NETRA_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = netra_core::data_dir();
        let model_dir = get("NETRA_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(netra_core::default_model_dir);
        let db_path = get("NETRA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("netra.db"));

        Self {
            video_source: get("NETRA_VIDEO_SOURCE"),
            recognition_threshold: parse_or(&get, "NETRA_RECOGNITION_THRESHOLD", 0.4),
            frame_skip: parse_or(&get, "NETRA_FRAME_SKIP", 5),
            model_dir,
            db_path,
            bind_addr: get("NETRA_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            capture: Geometry {
                width: parse_or(&get, "NETRA_CAPTURE_WIDTH", 640),
                height: parse_or(&get, "NETRA_CAPTURE_HEIGHT", 480),
            },
            jpeg_quality: parse_or(&get, "NETRA_JPEG_QUALITY", 80),
            stream_timeout: Duration::from_millis(parse_or(&get, "NETRA_STREAM_TIMEOUT_MS", 1000)),
            track_buffer: parse_or(&get, "NETRA_TRACK_BUFFER", 30),
            stop_timeout: Duration::from_millis(parse_or(&get, "NETRA_STOP_TIMEOUT_MS", 5000)),
        }
    }

    /// Check the settings a verification session depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.video_source.as_deref() {
            Some(s) if !s.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingVideoSource),
        }
        if self.frame_skip == 0 {
            return Err(ConfigError::InvalidFrameSkip);
        }
        let t = self.recognition_threshold;
        if !(t > 0.0 && t <= 2.0) {
            return Err(ConfigError::InvalidThreshold(t));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::InvalidJpegQuality(self.jpeg_quality));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable value, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.video_source, None);
        assert!((c.recognition_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(c.frame_skip, 5);
        assert_eq!(c.bind_addr, "0.0.0.0:8000");
        assert_eq!(c.capture, Geometry { width: 640, height: 480 });
        assert_eq!(c.stream_timeout, Duration::from_secs(1));
        assert_eq!(c.track_buffer, 30);
        assert_eq!(c.stop_timeout, Duration::from_secs(5));
        assert!(c.db_path.ends_with("netra/netra.db"));
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let c = config(&[
            ("NETRA_VIDEO_SOURCE", "rtsp://cam/1"),
            ("NETRA_FRAME_SKIP", "3"),
            ("NETRA_RECOGNITION_THRESHOLD", "nope"),
            ("NETRA_MODEL_DIR", "/opt/models"),
        ]);
        assert_eq!(c.video_source.as_deref(), Some("rtsp://cam/1"));
        assert_eq!(c.frame_skip, 3);
        assert!((c.recognition_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(c.scrfd_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(c.arcface_model_path(), "/opt/models/w600k_r50.onnx");
    }

    #[test]
    fn test_validate() {
        assert_eq!(config(&[]).validate(), Err(ConfigError::MissingVideoSource));
        assert_eq!(
            config(&[("NETRA_VIDEO_SOURCE", "  ")]).validate(),
            Err(ConfigError::MissingVideoSource)
        );
        assert_eq!(
            config(&[("NETRA_VIDEO_SOURCE", "0"), ("NETRA_FRAME_SKIP", "0")]).validate(),
            Err(ConfigError::InvalidFrameSkip)
        );
        assert_eq!(
            config(&[("NETRA_VIDEO_SOURCE", "0"), ("NETRA_RECOGNITION_THRESHOLD", "2.5")]).validate(),
            Err(ConfigError::InvalidThreshold(2.5))
        );
        assert!(config(&[("NETRA_VIDEO_SOURCE", "0")]).validate().is_ok());
    }
}
