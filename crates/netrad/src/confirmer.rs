//! Per-track identity resolution and once-per-session attendance writes.

use chrono::Local;
use netra_core::{
    CosineMatcher, FaceEmbed, Gallery, Identity, LectureContext, Matcher, Track, TrackId,
};
use netra_hw::Frame;
use netra_store::RecordStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// One confirmed attendance in the running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEntry {
    pub name: String,
    pub timestamp: String,
}

/// Student id → confirmation, as shown to clients.
pub type AttendanceSnapshot = BTreeMap<String, AttendanceEntry>;

/// Fixed label of a resolved track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackLabel {
    Known { student_id: String, name: String },
    Unknown,
}

impl TrackLabel {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::Known { name, .. } => name,
            Self::Unknown => "Unknown",
        }
    }
}

pub struct Confirmer {
    gallery: Gallery,
    threshold: f32,
    lecture: LectureContext,
    store: Arc<dyn RecordStore>,
    labels: HashMap<TrackId, TrackLabel>,
    confirmed: Arc<Mutex<AttendanceSnapshot>>,
}

impl Confirmer {
    pub fn new(
        gallery: Gallery,
        threshold: f32,
        lecture: LectureContext,
        store: Arc<dyn RecordStore>,
        confirmed: Arc<Mutex<AttendanceSnapshot>>,
    ) -> Self {
        Self {
            gallery,
            threshold,
            lecture,
            store,
            labels: HashMap::new(),
            confirmed,
        }
    }

    /// Label for `track`, resolving it from `frame` on first sight.
    ///
    /// A track is embedded and matched at most once; later calls return the
    /// stored label.
    pub fn resolve(
        &mut self,
        track: &Track,
        frame: &Frame,
        embedder: &mut dyn FaceEmbed,
    ) -> TrackLabel {
        if let Some(label) = self.labels.get(&track.id) {
            return label.clone();
        }

        let label = self.identify(track, frame, embedder);
        if let TrackLabel::Known { student_id, name } = &label {
            self.confirm(student_id, name);
        }
        self.labels.insert(track.id, label.clone());
        label
    }

    /// Drop labels for tracks the tracker no longer holds.
    pub fn forget(&mut self, removed: &[TrackId]) {
        for id in removed {
            self.labels.remove(id);
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn identify(&self, track: &Track, frame: &Frame, embedder: &mut dyn FaceEmbed) -> TrackLabel {
        let b = track.bbox;
        let crop = frame.crop(b.x1, b.y1, b.x2, b.y2);
        let probe = match embedder.embed(&crop) {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                tracing::debug!(track = track.id, "empty face crop; track stays unknown");
                return TrackLabel::Unknown;
            }
            Err(e) => {
                tracing::warn!(track = track.id, error = %e, "embedding failed; track stays unknown");
                return TrackLabel::Unknown;
            }
        };

        let result = CosineMatcher.best_match(&probe, &self.gallery, self.threshold);
        match result.identity {
            Identity::Known(ref student_id) => {
                let name = self.gallery.name_of(student_id).to_string();
                tracing::info!(
                    track = track.id,
                    student = %student_id,
                    name = %name,
                    distance = result.distance,
                    gap = ?result.confidence_gap(),
                    "face recognized"
                );
                TrackLabel::Known { student_id: student_id.clone(), name }
            }
            Identity::Unknown => {
                tracing::debug!(track = track.id, distance = result.distance, "face not recognized");
                TrackLabel::Unknown
            }
        }
    }

    fn confirm(&self, student_id: &str, name: &str) {
        if self
            .confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(student_id)
        {
            return;
        }

        if let Some(required) = &self.lecture.class {
            match self.store.get_class(student_id) {
                Ok(Some(class)) if &class == required => {}
                Ok(class) => {
                    tracing::info!(
                        student = %student_id,
                        class = ?class,
                        required = %required,
                        "student not in lecture class; attendance skipped"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(student = %student_id, error = %e, "class lookup failed");
                    return;
                }
            }
        }

        match self.store.record_attendance(student_id, name, &self.lecture) {
            Ok(inserted) => {
                let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                tracing::info!(student = %student_id, name, inserted, "attendance confirmed");
                self.confirmed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        student_id.to_string(),
                        AttendanceEntry {
                            name: name.to_string(),
                            timestamp,
                        },
                    );
            }
            Err(e) => {
                tracing::error!(student = %student_id, error = %e, "failed to store attendance");
            }
        }
    }
}
