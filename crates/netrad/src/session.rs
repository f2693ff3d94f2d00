//! One verification session: the per-frame loop run on its own thread.

use crate::annotate::{self, Overlay};
use crate::confirmer::Confirmer;
use crate::stream::FrameBuffer;
use bytes::Bytes;
use netra_core::{FaceDetect, FaceEmbed, Tracker};
use netra_hw::{Frame, FrameSource, SourceError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// The hardware and model pieces a session runs on.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource + Send>,
    pub detector: Box<dyn FaceDetect + Send>,
    pub embedder: Box<dyn FaceEmbed + Send>,
}

/// Counters shared with the controller for status reporting.
#[derive(Default)]
pub struct SessionStats {
    frames_read: AtomicU64,
    frames_processed: AtomicU64,
    active_tracks: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub active_tracks: usize,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
        }
    }
}

/// What the loop hands on for one input frame.
pub enum Emitted {
    /// Skipped by frame-skip; identical to the input.
    Passthrough(Frame),
    /// Ran detection. `annotated` is a copy with overlays; `raw` is untouched.
    Annotated { raw: Frame, annotated: Frame },
}

impl Emitted {
    /// The frame to show viewers.
    pub fn frame(&self) -> &Frame {
        match self {
            Self::Passthrough(frame) => frame,
            Self::Annotated { annotated, .. } => annotated,
        }
    }
}

pub struct Session {
    source: Box<dyn FrameSource + Send>,
    detector: Box<dyn FaceDetect + Send>,
    embedder: Box<dyn FaceEmbed + Send>,
    tracker: Tracker,
    confirmer: Confirmer,
    frame_skip: u64,
    frame_count: u64,
    stats: Arc<SessionStats>,
}

impl Session {
    pub fn new(
        parts: PipelineParts,
        tracker: Tracker,
        confirmer: Confirmer,
        frame_skip: u64,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            source: parts.source,
            detector: parts.detector,
            embedder: parts.embedder,
            tracker,
            confirmer,
            frame_skip: frame_skip.max(1),
            frame_count: 0,
            stats,
        }
    }

    /// Run one frame through frame-skip, detection, tracking and resolution.
    pub fn process(&mut self, frame: Frame) -> Emitted {
        self.frame_count += 1;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        if self.frame_count % self.frame_skip != 0 {
            return Emitted::Passthrough(frame);
        }
        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(frame = self.frame_count, error = %e, "face detection failed");
                Vec::new()
            }
        };

        let update = self.tracker.update(&detections, (frame.width, frame.height));
        self.confirmer.forget(&update.removed);
        self.stats
            .active_tracks
            .store(update.active.len(), Ordering::Relaxed);

        let mut overlays = Vec::with_capacity(update.active.len());
        for track in &update.active {
            let label = self.confirmer.resolve(track, &frame, self.embedder.as_mut());
            overlays.push(Overlay {
                bbox: track.bbox,
                label: label.display_name().to_string(),
                known: label.is_known(),
            });
        }

        let mut annotated = frame.clone();
        annotate::annotate(&mut annotated, &overlays, self.frame_count);
        Emitted::Annotated {
            raw: frame,
            annotated,
        }
    }

    /// Loop until `stop` is set or the source ends, pushing JPEG frames to `sink`.
    ///
    /// A source read error ends the session with that error. The source is
    /// released when this returns.
    pub fn run(mut self, stop: &AtomicBool, sink: &FrameBuffer, jpeg_quality: u8) -> Result<(), SourceError> {
        let origin = self.source.describe();
        tracing::info!(source = %origin, frame_skip = self.frame_skip, "session loop started");

        loop {
            if stop.load(Ordering::Acquire) {
                tracing::info!(frames = self.frame_count, "session stop requested");
                break;
            }
            let Some(frame) = self.source.next_frame()? else {
                tracing::info!(frames = self.frame_count, source = %origin, "end of stream");
                break;
            };

            let emitted = self.process(frame);
            match annotate::encode_jpeg(emitted.frame(), jpeg_quality) {
                Ok(jpeg) => {
                    sink.push(Bytes::from(jpeg));
                }
                Err(e) => tracing::warn!(frame = self.frame_count, error = %e, "jpeg encoding failed"),
            }
        }

        tracing::info!(
            frames = self.frame_count,
            confirmed = self.confirmer.confirmed_count(),
            "session loop finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmer::AttendanceSnapshot;
    use crate::testing::{
        enrolled_store, face_frame, lecture, AfterScript, ScriptedDetector, ScriptedEmbedder,
        ScriptedSource,
    };
    use chrono::Local;
    use netra_core::{Embedding, Gallery, TrackerConfig};
    use netra_store::{RecordStore, SqliteStore};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        session: Session,
        seen: Arc<Mutex<Vec<u64>>>,
        store: Arc<SqliteStore>,
        attendance: Arc<Mutex<AttendanceSnapshot>>,
        stats: Arc<SessionStats>,
    }

    fn fixture(source: ScriptedSource, detector: ScriptedDetector, frame_skip: u64) -> Fixture {
        let store = enrolled_store();
        let gallery = Gallery::from_records(store.load_all_embeddings().unwrap());
        let attendance = Arc::new(Mutex::new(AttendanceSnapshot::new()));
        let confirmer = Confirmer::new(gallery, 0.4, lecture(), store.clone(), attendance.clone());
        let seen = Arc::clone(&detector.seen);
        let stats = Arc::new(SessionStats::default());
        let parts = PipelineParts {
            source: Box::new(source),
            detector: Box::new(detector),
            embedder: Box::new(ScriptedEmbedder::repeating(Embedding::new(vec![1.0, 0.0]))),
        };
        let session = Session::new(
            parts,
            Tracker::new(TrackerConfig::default()),
            confirmer,
            frame_skip,
            Arc::clone(&stats),
        );
        Fixture {
            session,
            seen,
            store,
            attendance,
            stats,
        }
    }

    #[test]
    fn test_frame_skip_processes_every_nth_frame() {
        let mut f = fixture(ScriptedSource::new(0, AfterScript::End), ScriptedDetector::default(), 5);

        for seq in 1..=12 {
            let input = face_frame(seq);
            let original = input.data.clone();
            match f.session.process(input) {
                Emitted::Passthrough(out) => {
                    assert_ne!(seq % 5, 0);
                    assert_eq!(out.data, original);
                }
                Emitted::Annotated { raw, annotated } => {
                    assert_eq!(seq % 5, 0);
                    assert_eq!(raw.data, original);
                    assert_ne!(annotated.data, original);
                }
            }
        }
        assert_eq!(*f.seen.lock().unwrap(), vec![5, 10]);
        let stats = f.stats.snapshot();
        assert_eq!(stats.frames_read, 12);
        assert_eq!(stats.frames_processed, 2);
    }

    #[test]
    fn test_zero_detections_never_write() {
        let detector = ScriptedDetector {
            empty: (1..=20).collect(),
            ..ScriptedDetector::default()
        };
        let mut f = fixture(ScriptedSource::new(0, AfterScript::End), detector, 1);
        for seq in 1..=20 {
            f.session.process(face_frame(seq));
        }
        assert!(f.attendance.lock().unwrap().is_empty());
        assert!(f.store.attendance_records(Local::now().date_naive()).unwrap().is_empty());
    }

    #[test]
    fn test_detection_failure_treated_as_no_faces() {
        let detector = ScriptedDetector {
            failing: vec![1, 2],
            ..ScriptedDetector::default()
        };
        let mut f = fixture(ScriptedSource::new(0, AfterScript::End), detector, 1);
        assert!(matches!(f.session.process(face_frame(1)), Emitted::Annotated { .. }));
        f.session.process(face_frame(2));
        assert!(f.attendance.lock().unwrap().is_empty());

        f.session.process(face_frame(3));
        assert!(f.attendance.lock().unwrap().contains_key("S1"));
    }

    #[test]
    fn test_known_face_recorded_once_across_frames() {
        let mut f = fixture(ScriptedSource::new(0, AfterScript::End), ScriptedDetector::default(), 1);
        for seq in 1..=10 {
            f.session.process(face_frame(seq));
        }
        let snapshot = f.attendance.lock().unwrap().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["S1"].name, "Asha");
        let rows = f.store.attendance_records(Local::now().date_naive()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(f.stats.snapshot().active_tracks, 1);
    }

    #[test]
    fn test_run_until_end_of_stream() {
        let source = ScriptedSource::new(6, AfterScript::End);
        let released = source.released_flag();
        let f = fixture(source, ScriptedDetector::default(), 2);
        let sink = FrameBuffer::with_capacity(16);
        let stop = AtomicBool::new(false);

        f.session.run(&stop, &sink, 80).unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(sink.len(), 6);
        assert_eq!(*f.seen.lock().unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn test_run_surfaces_read_failure() {
        let source = ScriptedSource::new(2, AfterScript::Fail);
        let released = source.released_flag();
        let f = fixture(source, ScriptedDetector::default(), 1);
        let sink = FrameBuffer::default();
        let stop = AtomicBool::new(false);

        assert!(matches!(f.session.run(&stop, &sink, 80), Err(SourceError::Read(_))));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_honors_stop_flag() {
        let f = fixture(ScriptedSource::new(0, AfterScript::Endless), ScriptedDetector::default(), 5);
        let sink = Arc::new(FrameBuffer::default());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (stop, sink) = (Arc::clone(&stop), Arc::clone(&sink));
            std::thread::spawn(move || f.session.run(&stop, &sink, 80))
        };
        std::thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Release);
        assert!(handle.join().unwrap().is_ok());
        assert!(sink.len() > 0);
    }
}
