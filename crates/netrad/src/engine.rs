use crate::config::{Config, ConfigError};
use crate::confirmer::{AttendanceSnapshot, Confirmer};
use crate::session::{PipelineParts, Session, SessionStats, StatsSnapshot};
use crate::stream::FrameBuffer;
use netra_core::{
    DetectorError, FaceDetector, FaceRecognizer, Gallery, LectureContext, RecognizerError,
    Tracker, TrackerConfig,
};
use netra_hw::{open_source, SourceDescriptor, SourceError};
use netra_store::{RecordStore, StoreError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Verification is already running.")]
    AlreadyRunning,
    #[error("Verification was stopped during initialization.")]
    Cancelled,
    #[error("Failed to initialize verification pipeline: {0}")]
    Init(#[from] InitError),
}

#[derive(Error, Debug, PartialEq)]
pub enum StopError {
    #[error("Verification is not running.")]
    NotRunning,
}

/// Builds the source, detector and embedder for a new session.
pub trait PipelineBackend: Send + Sync {
    fn open(&self, config: &Config) -> Result<PipelineParts, InitError>;
}

/// SCRFD + ArcFace on ONNX Runtime, reading from the configured video source.
pub struct OnnxBackend;

impl PipelineBackend for OnnxBackend {
    fn open(&self, config: &Config) -> Result<PipelineParts, InitError> {
        let detector = FaceDetector::load(&config.scrfd_model_path())?;
        tracing::info!(path = %config.scrfd_model_path(), "SCRFD detector loaded");

        let embedder = FaceRecognizer::load(&config.arcface_model_path())?;
        tracing::info!(path = %config.arcface_model_path(), "ArcFace recognizer loaded");

        let raw = config.video_source.as_deref().unwrap_or_default();
        let descriptor = SourceDescriptor::parse(raw)?;
        let source = open_source(&descriptor, config.capture)?;
        tracing::info!(source = %source.describe(), "video source opened");

        Ok(PipelineParts {
            source,
            detector: Box::new(detector),
            embedder: Box::new(embedder),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Initializing,
    Running,
    Stopping,
    Failed,
}

/// How a session thread ended.
#[derive(Debug, Clone)]
enum SessionExit {
    Finished,
    Crashed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: PipelineState,
    pub lecture: Option<LectureContext>,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub confirmed: usize,
    pub last_error: Option<String>,
}

struct ActiveSession {
    lecture: LectureContext,
    stop: Arc<AtomicBool>,
    frames: Arc<FrameBuffer>,
    attendance: Arc<Mutex<AttendanceSnapshot>>,
    stats: Arc<SessionStats>,
    exit: Arc<Mutex<Option<SessionExit>>>,
    handle: JoinHandle<()>,
}

impl ActiveSession {
    fn exit(&self) -> Option<SessionExit> {
        lock(&self.exit).clone()
    }

    fn snapshot(&self) -> AttendanceSnapshot {
        lock(&self.attendance).clone()
    }

    /// Signal stop, wake stream readers and wait up to `timeout` for the thread.
    fn shut_down(self, timeout: Duration) {
        self.stop.store(true, Ordering::Release);
        self.frames.close();

        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            if self.handle.join().is_err() {
                tracing::error!("session thread panicked");
            }
        } else {
            // The thread still owns the source and drops it once its
            // pending read returns or times out.
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "session thread did not exit in time; detaching"
            );
        }
    }
}

struct Slot {
    state: PipelineState,
    session: Option<ActiveSession>,
    last_error: Option<String>,
    /// Set by a stop that arrives while a session is still initializing.
    stop_requested: bool,
}

impl Slot {
    /// Fold a session that ended on its own into the reported state.
    fn observed_state(&mut self) -> PipelineState {
        if self.state == PipelineState::Running {
            match self.session.as_ref().and_then(ActiveSession::exit) {
                Some(SessionExit::Finished) => self.state = PipelineState::Idle,
                Some(SessionExit::Crashed(reason)) => {
                    self.state = PipelineState::Failed;
                    self.last_error = Some(reason);
                }
                None => {}
            }
        }
        self.state
    }
}

/// Owns the single verification session and its lifecycle.
pub struct VerificationController {
    config: Config,
    backend: Arc<dyn PipelineBackend>,
    store: Arc<dyn RecordStore>,
    slot: Mutex<Slot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VerificationController {
    pub fn new(config: Config, backend: Arc<dyn PipelineBackend>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            backend,
            store,
            slot: Mutex::new(Slot {
                state: PipelineState::Idle,
                session: None,
                last_error: None,
                stop_requested: false,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize a session for `lecture` and start its thread.
    ///
    /// Blocks for model loading and source opening; the loop itself runs
    /// on a dedicated thread.
    pub fn start(&self, lecture: LectureContext) -> Result<(), StartError> {
        let previous = {
            let mut slot = lock(&self.slot);
            match slot.observed_state() {
                PipelineState::Initializing | PipelineState::Running | PipelineState::Stopping => {
                    tracing::warn!(state = ?slot.state, "start rejected; session already active");
                    return Err(StartError::AlreadyRunning);
                }
                PipelineState::Idle | PipelineState::Failed => {}
            }
            slot.state = PipelineState::Initializing;
            slot.stop_requested = false;
            slot.session.take()
        };

        if let Some(old) = previous {
            old.shut_down(self.config.stop_timeout);
        }

        tracing::info!(
            subject = %lecture.subject,
            time_slot = %lecture.time_slot,
            class = ?lecture.class,
            "starting verification session"
        );
        let result = self.initialize(lecture);

        let mut slot = lock(&self.slot);
        match result {
            Ok(session) if slot.stop_requested => {
                slot.stop_requested = false;
                drop(slot);
                tracing::info!("stop requested during initialization; discarding session");
                session.shut_down(self.config.stop_timeout);
                let mut slot = lock(&self.slot);
                slot.state = PipelineState::Idle;
                Err(StartError::Cancelled)
            }
            Ok(session) => {
                slot.state = PipelineState::Running;
                slot.session = Some(session);
                slot.last_error = None;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "session initialization failed");
                slot.stop_requested = false;
                slot.state = PipelineState::Failed;
                slot.last_error = Some(e.to_string());
                Err(StartError::Init(e))
            }
        }
    }

    fn initialize(&self, lecture: LectureContext) -> Result<ActiveSession, InitError> {
        self.config.validate()?;

        let gallery = Gallery::from_records(self.store.load_all_embeddings()?);
        if gallery.is_empty() {
            tracing::warn!("gallery is empty; every face will be unknown");
        }

        let parts = self.backend.open(&self.config)?;
        let tracker = Tracker::new(TrackerConfig {
            track_buffer: self.config.track_buffer,
            ..TrackerConfig::default()
        });

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(FrameBuffer::default());
        let attendance = Arc::new(Mutex::new(AttendanceSnapshot::new()));
        let stats = Arc::new(SessionStats::default());
        let exit = Arc::new(Mutex::new(None));

        let confirmer = Confirmer::new(
            gallery,
            self.config.recognition_threshold,
            lecture.clone(),
            Arc::clone(&self.store),
            Arc::clone(&attendance),
        );
        let session = Session::new(parts, tracker, confirmer, self.config.frame_skip, Arc::clone(&stats));

        let handle = {
            let (stop, frames, exit) = (Arc::clone(&stop), Arc::clone(&frames), Arc::clone(&exit));
            let quality = self.config.jpeg_quality;
            std::thread::Builder::new()
                .name("netra-session".into())
                .spawn(move || {
                    let outcome = match session.run(&stop, &frames, quality) {
                        Ok(()) => SessionExit::Finished,
                        Err(e) => {
                            tracing::error!(error = %e, "session crashed");
                            SessionExit::Crashed(e.to_string())
                        }
                    };
                    *lock(&exit) = Some(outcome);
                    frames.close();
                })
                .map_err(InitError::Spawn)?
        };

        Ok(ActiveSession {
            lecture,
            stop,
            frames,
            attendance,
            stats,
            exit,
            handle,
        })
    }

    /// Stop the held session. A second call reports `NotRunning`.
    ///
    /// During initialization the stop is recorded and the session is torn
    /// down as soon as `start` finishes building it.
    pub fn stop(&self) -> Result<(), StopError> {
        let session = {
            let mut slot = lock(&self.slot);
            if slot.state == PipelineState::Initializing {
                tracing::info!("stop requested while initializing");
                slot.stop_requested = true;
                return Ok(());
            }
            let Some(session) = slot.session.take() else {
                return Err(StopError::NotRunning);
            };
            slot.state = PipelineState::Stopping;
            session
        };

        tracing::info!("stopping verification session");
        let crashed = match session.exit() {
            Some(SessionExit::Crashed(reason)) => Some(reason),
            _ => None,
        };
        session.shut_down(self.config.stop_timeout);

        let mut slot = lock(&self.slot);
        slot.state = PipelineState::Idle;
        if crashed.is_some() {
            slot.last_error = crashed;
        }
        tracing::info!("verification session stopped");
        Ok(())
    }

    /// Confirmed attendance of the held session; empty when none is held.
    pub fn attendance_snapshot(&self) -> AttendanceSnapshot {
        lock(&self.slot)
            .session
            .as_ref()
            .map(ActiveSession::snapshot)
            .unwrap_or_default()
    }

    pub fn status(&self) -> ControllerStatus {
        let mut slot = lock(&self.slot);
        let state = slot.observed_state();
        let session = slot.session.as_ref();
        ControllerStatus {
            state,
            lecture: session.map(|s| s.lecture.clone()),
            stats: session.map(|s| s.stats.snapshot()).unwrap_or_default(),
            confirmed: session.map(|s| lock(&s.attendance).len()).unwrap_or(0),
            last_error: slot.last_error.clone(),
        }
    }

    /// Frame buffer of the running session, for stream readers.
    pub fn frames(&self) -> Option<Arc<FrameBuffer>> {
        let mut slot = lock(&self.slot);
        if slot.observed_state() != PipelineState::Running {
            return None;
        }
        slot.session.as_ref().map(|s| Arc::clone(&s.frames))
    }

    /// Stop any held session; used at daemon exit.
    pub fn shutdown(&self) {
        if self.stop().is_ok() {
            tracing::info!("session stopped for shutdown");
        }
    }
}
