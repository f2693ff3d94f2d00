//! ByteTrack-style multi-face tracker.
//!
//! Associates per-frame detections to persistent track identities by IoU
//! against constant-velocity predicted boxes, in two stages: high-confidence
//! detections first (against every live track), then low-confidence
//! detections against tracks still unmatched. Tracks that miss a frame go
//! `Lost` and are kept for `track_buffer` updates so a brief detection drop
//! does not change identity.

use crate::types::{BoundingBox, Detection};
use serde::Serialize;

/// Tracker-assigned identity. Monotonic, never reused by one tracker.
pub type TrackId = u64;

/// Lifecycle state of a track inside the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    /// Matched a detection on the latest update.
    #[default]
    Tracked,
    /// Missed one or more updates; still eligible for re-association.
    Lost,
}

/// Association thresholds and memory window.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Detections at or above this confidence take part in the first stage.
    pub high_threshold: f32,
    /// Detections below this confidence are ignored entirely.
    pub low_threshold: f32,
    /// Unmatched detections at or above this confidence start a new track.
    pub new_track_threshold: f32,
    /// Minimum IoU for a first-stage match.
    pub match_iou: f32,
    /// Minimum IoU for a second-stage (low-confidence) match.
    pub low_match_iou: f32,
    /// Updates a lost track survives before removal ("time to die").
    pub track_buffer: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.6,
            low_threshold: 0.1,
            new_track_threshold: 0.6,
            match_iou: 0.2,
            low_match_iou: 0.5,
            track_buffer: 30,
        }
    }
}

/// A track as reported to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Number of updates this track matched a detection.
    pub hits: u32,
}

/// Result of one tracker update.
#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    /// Tracks matched on this update, ordered by id.
    pub active: Vec<Track>,
    /// Tracks dropped on this update after exceeding the memory window.
    pub removed: Vec<TrackId>,
}

struct Entry {
    track: Track,
    state: TrackState,
    /// Per-update corner velocity (dx1, dy1, dx2, dy2).
    velocity: [f32; 4],
    frames_lost: u32,
}

impl Entry {
    fn predicted(&self) -> BoundingBox {
        let b = self.track.bbox;
        let v = self.velocity;
        BoundingBox::new(b.x1 + v[0], b.y1 + v[1], b.x2 + v[2], b.y2 + v[3])
    }

    fn apply(&mut self, det: &Detection) {
        let old = self.track.bbox;
        let new = det.bbox;
        let delta = [new.x1 - old.x1, new.y1 - old.y1, new.x2 - old.x2, new.y2 - old.y2];
        for (v, d) in self.velocity.iter_mut().zip(delta) {
            *v = 0.5 * *v + 0.5 * d;
        }
        self.track.bbox = new;
        self.track.confidence = det.confidence;
        self.track.hits += 1;
        self.state = TrackState::Tracked;
        self.frames_lost = 0;
    }
}

/// Multi-face tracker. One instance per verification session.
pub struct Tracker {
    config: TrackerConfig,
    entries: Vec<Entry>,
    next_id: TrackId,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Advance the tracker by one frame.
    ///
    /// An empty `detections` slice is valid: every track goes lost and ages.
    pub fn update(&mut self, detections: &[Detection], frame_size: (u32, u32)) -> TrackerUpdate {
        let frame_box = BoundingBox::new(0.0, 0.0, frame_size.0 as f32, frame_size.1 as f32);
        let usable: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.config.low_threshold)
            .filter(|d| d.bbox.area() > 0.0 && d.bbox.iou(&frame_box) > 0.0)
            .collect();

        let (high, low): (Vec<&Detection>, Vec<&Detection>) = usable
            .into_iter()
            .partition(|d| d.confidence >= self.config.high_threshold);

        let predicted: Vec<BoundingBox> = self.entries.iter().map(Entry::predicted).collect();
        let mut entry_matched = vec![false; self.entries.len()];

        // Stage 1: high-confidence detections against all live tracks.
        let all_entries: Vec<usize> = (0..self.entries.len()).collect();
        let (pairs, unmatched_high) = associate(&all_entries, &predicted, &high, self.config.match_iou);
        for (e, d) in pairs {
            self.entries[e].apply(high[d]);
            entry_matched[e] = true;
        }

        // Stage 2: low-confidence detections against tracks that were tracked
        // last frame and are still unmatched.
        let remaining: Vec<usize> = (0..self.entries.len())
            .filter(|&e| !entry_matched[e] && self.entries[e].state == TrackState::Tracked)
            .collect();
        let (pairs, _) = associate(&remaining, &predicted, &low, self.config.low_match_iou);
        for (e, d) in pairs {
            self.entries[e].apply(low[d]);
            entry_matched[e] = true;
        }

        // Age unmatched tracks and collect the expired ones.
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (idx, mut entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if !entry_matched[idx] {
                entry.state = TrackState::Lost;
                entry.frames_lost += 1;
                entry.track.bbox = predicted[idx];
                if entry.frames_lost > self.config.track_buffer {
                    tracing::debug!(track = entry.track.id, "track removed");
                    removed.push(entry.track.id);
                    continue;
                }
            }
            kept.push(entry);
        }
        self.entries = kept;

        for d in unmatched_high {
            let det = high[d];
            if det.confidence < self.config.new_track_threshold {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            tracing::debug!(track = id, confidence = det.confidence, "track started");
            self.entries.push(Entry {
                track: Track {
                    id,
                    bbox: det.bbox,
                    confidence: det.confidence,
                    hits: 1,
                },
                state: TrackState::Tracked,
                velocity: [0.0; 4],
                frames_lost: 0,
            });
        }

        let mut active: Vec<Track> = self
            .entries
            .iter()
            .filter(|e| e.state == TrackState::Tracked)
            .map(|e| e.track.clone())
            .collect();
        active.sort_by_key(|t| t.id);

        TrackerUpdate { active, removed }
    }
}

/// Greedy IoU association: repeatedly take the highest-IoU (entry, detection)
/// pair above `min_iou`. Returns matched pairs (entry index, detection index)
/// and the detection indices left unmatched.
fn associate(
    entries: &[usize],
    predicted: &[BoundingBox],
    detections: &[&Detection],
    min_iou: f32,
) -> (Vec<(usize, usize)>, Vec<usize>) {
    let mut candidates = Vec::new();
    for &e in entries {
        for (d, det) in detections.iter().enumerate() {
            let iou = predicted[e].iou(&det.bbox);
            if iou >= min_iou {
                candidates.push((iou, e, d));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_entries = Vec::new();
    let mut used_dets = vec![false; detections.len()];
    let mut pairs = Vec::new();
    for (_, e, d) in candidates {
        if used_dets[d] || used_entries.contains(&e) {
            continue;
        }
        used_dets[d] = true;
        used_entries.push(e);
        pairs.push((e, d));
    }

    let unmatched = (0..detections.len()).filter(|&d| !used_dets[d]).collect();
    (pairs, unmatched)
}
