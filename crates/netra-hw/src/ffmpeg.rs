//! File and network stream capture through an `ffmpeg` subprocess that
//! decodes to raw `rgb24` frames on stdout.
//!
//! Stdout is drained by a reader thread into a small bounded channel, so
//! every read has a deadline even when the upstream stalls mid-frame.

use crate::frame::{rgb_len, Frame};
use crate::source::{FrameSource, Geometry, SourceError, OPEN_TIMEOUT, READ_TIMEOUT};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

/// Decoded frames buffered between the reader thread and the session.
const PIPE_QUEUE: usize = 2;

/// What the reader thread hands over for one frame slot.
enum Chunk {
    Frame(Vec<u8>),
    End,
    Failed(String),
}

/// ffmpeg-backed frame source for video files and RTSP/HTTP/UDP URLs.
///
/// The child process is killed and reaped on drop.
pub struct FfmpegSource {
    location: String,
    child: Child,
    chunks: Receiver<Chunk>,
    geometry: Geometry,
    read_timeout: Duration,
    pending: Option<Frame>,
    sequence: u64,
}

impl FfmpegSource {
    /// Spawn ffmpeg for `location` and wait up to [`OPEN_TIMEOUT`] for the first frame.
    ///
    /// Reading eagerly means a missing file, refused or stalled connection,
    /// or undecodable input fails here rather than on the first `next_frame`.
    pub fn open(location: &str, geometry: Geometry) -> Result<Self, SourceError> {
        let is_url = location.contains("://");
        if !is_url && !Path::new(location).exists() {
            return Err(SourceError::Unavailable(format!("{location}: no such file")));
        }

        let mut cmd = build_command(location, geometry, is_url);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("failed to spawn ffmpeg: {e}")))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Unavailable("failed to capture ffmpeg stdout".into()));
        };

        let chunks = spawn_pipe_reader(stdout, rgb_len(geometry.width, geometry.height))
            .map_err(|e| SourceError::Unavailable(format!("failed to spawn reader thread: {e}")))?;

        let mut source = Self {
            location: location.to_string(),
            child,
            chunks,
            geometry,
            read_timeout: READ_TIMEOUT,
            pending: None,
            sequence: 0,
        };

        match source.read_frame(OPEN_TIMEOUT) {
            Ok(Some(frame)) => source.pending = Some(frame),
            Ok(None) => {
                return Err(SourceError::Unavailable(format!(
                    "{location}: stream ended before the first frame"
                )))
            }
            Err(e) => return Err(SourceError::Unavailable(format!("{location}: {e}"))),
        }

        tracing::info!(
            location,
            width = geometry.width,
            height = geometry.height,
            "opened ffmpeg source"
        );

        Ok(source)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        let Some(buffer) = recv_chunk(&self.chunks, timeout)? else {
            return Ok(None);
        };
        self.sequence += 1;
        Frame::from_rgb(buffer, self.geometry.width, self.geometry.height, self.sequence)
            .map(Some)
            .map_err(|e| SourceError::Read(e.to_string()))
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.read_frame(self.read_timeout)
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        tracing::debug!(location = %self.location, "ffmpeg source released");
    }
}

/// Read fixed-size frames from `pipe` on a background thread.
///
/// The thread exits on EOF, on a read error, or once the receiver is dropped.
fn spawn_pipe_reader(
    mut pipe: impl Read + Send + 'static,
    frame_len: usize,
) -> std::io::Result<Receiver<Chunk>> {
    let (tx, rx) = bounded(PIPE_QUEUE);
    thread::Builder::new()
        .name("netra-ffmpeg-reader".into())
        .spawn(move || loop {
            let mut buffer = vec![0u8; frame_len];
            let chunk = match pipe.read_exact(&mut buffer) {
                Ok(()) => Chunk::Frame(buffer),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => Chunk::End,
                Err(e) => Chunk::Failed(e.to_string()),
            };
            let last = !matches!(chunk, Chunk::Frame(_));
            if tx.send(chunk).is_err() || last {
                break;
            }
        })?;
    Ok(rx)
}

/// Wait up to `timeout` for the next frame buffer. `Ok(None)` is end-of-stream.
fn recv_chunk(chunks: &Receiver<Chunk>, timeout: Duration) -> Result<Option<Vec<u8>>, SourceError> {
    match chunks.recv_timeout(timeout) {
        Ok(Chunk::Frame(buffer)) => Ok(Some(buffer)),
        Ok(Chunk::End) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        Ok(Chunk::Failed(e)) => Err(SourceError::Read(e)),
        Err(RecvTimeoutError::Timeout) => Err(SourceError::Read(format!(
            "no frame within {} ms",
            timeout.as_millis()
        ))),
    }
}

fn build_command(location: &str, geometry: Geometry, is_url: bool) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    if is_url {
        // Socket-level deadline in microseconds; ffmpeg exits when it fires.
        let micros = READ_TIMEOUT.as_micros().to_string();
        if location.starts_with("rtsp://") || location.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport").arg("tcp").arg("-timeout").arg(&micros);
        } else {
            cmd.arg("-rw_timeout").arg(&micros);
        }
        cmd.arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay");
    } else {
        // Pace file playback at its native frame rate.
        cmd.arg("-re");
    }

    cmd.arg("-i")
        .arg(location)
        .arg("-an")
        .arg("-vf")
        .arg(format!("scale={}:{}", geometry.width, geometry.height))
        .arg("-pix_fmt")
        .arg("rgb24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}
