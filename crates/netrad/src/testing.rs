//! Scripted pipeline pieces for unit tests. No models, camera or ffmpeg.

use crate::config::Config;
use crate::engine::{InitError, PipelineBackend};
use crate::session::PipelineParts;
use netra_core::{
    BoundingBox, Detection, DetectorError, Embedding, FaceDetect, FaceEmbed, LectureContext,
    RecognizerError, StudentRecord, Track,
};
use netra_hw::{Crop, Frame, FrameSource, SourceError};
use netra_store::{NewStudent, RecordStore, SqliteStore, StoreError};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// Where the scripted detector reports its face.
pub fn face_box() -> BoundingBox {
    BoundingBox::new(10.0, 8.0, 40.0, 38.0)
}

/// S1 Asha (SYCO) at [1, 0] and S2 Bilal (TYCO) at [0.5, √3/2].
pub fn enrolled_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    let students = [
        ("S1", "Asha", "SYCO", vec![1.0, 0.0]),
        ("S2", "Bilal", "TYCO", vec![0.5, (3.0f32).sqrt() / 2.0]),
    ];
    for (id, name, class, values) in students {
        let embedding = Embedding::new(values);
        store
            .upsert_student(&NewStudent {
                id,
                name,
                class,
                parent_phone: None,
                department: None,
                embedding: &embedding,
            })
            .unwrap();
    }
    Arc::new(store)
}

/// A frame whose pixels all carry a value derived from `sequence`.
pub fn face_frame(sequence: u64) -> Frame {
    let fill = (sequence % 200) as u8 + 20;
    Frame::from_rgb(vec![fill; (WIDTH * HEIGHT * 3) as usize], WIDTH, HEIGHT, sequence).unwrap()
}

pub fn track(id: u64) -> Track {
    Track {
        id,
        bbox: face_box(),
        confidence: 0.9,
        hits: 1,
    }
}

pub fn config() -> Config {
    Config {
        video_source: Some("scripted".into()),
        recognition_threshold: 0.4,
        frame_skip: 1,
        model_dir: PathBuf::from("/nonexistent/models"),
        db_path: PathBuf::from(":memory:"),
        bind_addr: "127.0.0.1:0".into(),
        capture: netra_hw::Geometry::default(),
        jpeg_quality: 80,
        stream_timeout: Duration::from_millis(50),
        track_buffer: 30,
        stop_timeout: Duration::from_millis(200),
    }
}

pub fn lecture() -> LectureContext {
    LectureContext {
        subject: "DBMS".into(),
        teacher: "Prof. Rao".into(),
        hall: "H-101".into(),
        time_slot: "10:00-11:00".into(),
        class: None,
    }
}

/// Returns the same embedding for every crop, or fails every call.
pub struct ScriptedEmbedder {
    result: Option<Embedding>,
    pub calls: usize,
}

impl ScriptedEmbedder {
    pub fn repeating(embedding: Embedding) -> Self {
        Self {
            result: Some(embedding),
            calls: 0,
        }
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            calls: 0,
        }
    }
}

impl FaceEmbed for ScriptedEmbedder {
    fn embed(&mut self, crop: &Crop) -> Result<Option<Embedding>, RecognizerError> {
        self.calls += 1;
        if crop.is_empty() {
            return Ok(None);
        }
        self.result
            .clone()
            .map(Some)
            .ok_or_else(|| RecognizerError::InferenceFailed("scripted failure".into()))
    }
}

/// Reports one face on every frame, except sequences listed as empty or failing.
/// Records every sequence it was asked to detect.
#[derive(Default)]
pub struct ScriptedDetector {
    pub empty: Vec<u64>,
    pub failing: Vec<u64>,
    pub seen: Arc<Mutex<Vec<u64>>>,
}

impl FaceDetect for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        self.seen.lock().unwrap().push(frame.sequence);
        if self.failing.contains(&frame.sequence) {
            return Err(DetectorError::InferenceFailed("scripted failure".into()));
        }
        if self.empty.contains(&frame.sequence) {
            return Ok(Vec::new());
        }
        Ok(vec![Detection::new(face_box(), 0.9)])
    }
}

/// Plays back a fixed list of frames, then ends, fails, keeps producing
/// frames until dropped, or blocks in one long read before failing.
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
    after: AfterScript,
    next_sequence: u64,
    released: Arc<AtomicBool>,
}

#[derive(Clone, Copy, PartialEq)]
pub enum AfterScript {
    End,
    Fail,
    Endless,
    /// Blocks for this long on the next read, then reports a read error.
    Stall(Duration),
}

impl ScriptedSource {
    pub fn new(count: u64, after: AfterScript) -> Self {
        Self {
            frames: (1..=count).map(face_frame).collect(),
            after,
            next_sequence: count + 1,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        match self.after {
            AfterScript::End => Ok(None),
            AfterScript::Fail => Err(SourceError::Read("scripted disconnect".into())),
            AfterScript::Stall(delay) => {
                std::thread::sleep(delay);
                Err(SourceError::Read("scripted stall".into()))
            }
            AfterScript::Endless => {
                std::thread::sleep(Duration::from_millis(2));
                let frame = face_frame(self.next_sequence);
                self.next_sequence += 1;
                Ok(Some(frame))
            }
        }
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Backend handing out scripted parts. Fails the first `fail_opens` opens.
pub struct ScriptedBackend {
    pub frames: u64,
    pub after: AfterScript,
    pub embedding: Embedding,
    pub fail_opens: AtomicUsize,
    pub opens: AtomicUsize,
    /// When set, `open` waits on this barrier twice: once on entry, once before returning.
    pub gate: Option<Arc<Barrier>>,
    pub released: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ScriptedBackend {
    pub fn new(frames: u64, after: AfterScript) -> Self {
        Self {
            frames,
            after,
            embedding: Embedding::new(vec![1.0, 0.0]),
            fail_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            gate: None,
            released: Mutex::new(Vec::new()),
        }
    }
}

impl PipelineBackend for ScriptedBackend {
    fn open(&self, _config: &Config) -> Result<PipelineParts, InitError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
            gate.wait();
        }
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InitError::Source(SourceError::Unavailable("scripted".into())));
        }
        let source = ScriptedSource::new(self.frames, self.after);
        self.released.lock().unwrap().push(source.released_flag());
        Ok(PipelineParts {
            source: Box::new(source),
            detector: Box::new(ScriptedDetector::default()),
            embedder: Box::new(ScriptedEmbedder::repeating(self.embedding.clone())),
        })
    }
}

/// Store whose attendance writes always fail.
pub struct FailingStore {
    records: Vec<StudentRecord>,
}

impl FailingStore {
    pub fn new(records: Vec<StudentRecord>) -> Self {
        Self { records }
    }
}

impl RecordStore for FailingStore {
    fn load_all_embeddings(&self) -> Result<Vec<StudentRecord>, StoreError> {
        Ok(self.records.clone())
    }

    fn get_class(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.id == student_id)
            .map(|r| r.class.clone()))
    }

    fn record_attendance(
        &self,
        _student_id: &str,
        _name: &str,
        _lecture: &LectureContext,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Poisoned)
    }
}
