//! Session-scoped embedding gallery and nearest-neighbour matching.

use crate::types::{Embedding, Identity, MatchResult, StudentRecord};
use std::collections::BTreeMap;

/// One enrolled face in the gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Immutable snapshot of enrolled embeddings, keyed by student identifier.
///
/// Entries iterate in identifier order, so matching is reproducible
/// across runs for the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: BTreeMap<String, GalleryEntry>,
}

impl Gallery {
    /// Build a snapshot from store records, skipping records without an embedding.
    pub fn from_records(records: impl IntoIterator<Item = StudentRecord>) -> Self {
        let mut entries = BTreeMap::new();
        let mut total = 0usize;

        for record in records {
            total += 1;
            if record.embedding.values.is_empty() {
                tracing::warn!(student = %record.id, "student has missing or invalid embedding");
                continue;
            }
            entries.insert(
                record.id,
                GalleryEntry {
                    name: record.name,
                    embedding: record.embedding,
                },
            );
        }

        tracing::info!(valid = entries.len(), total, "loaded embedding gallery");
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&GalleryEntry> {
        self.entries.get(id)
    }

    /// Display name for `id`, or `"Unknown"`.
    pub fn name_of(&self, id: &str) -> &str {
        self.entries.get(id).map(|e| e.name.as_str()).unwrap_or("Unknown")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GalleryEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }
}

/// Strategy for comparing a probe embedding against an enrolled gallery.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Linear-scan cosine-distance matcher.
///
/// Accepts the nearest entry only when its distance is strictly below the
/// threshold. On exactly equal distances the first entry in identifier
/// order wins. Entries whose dimensionality differs from the probe are
/// skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for (id, entry) in gallery.iter() {
            if entry.embedding.dim() != probe.dim() {
                tracing::debug!(student = id, "skipping gallery entry with mismatched dimension");
                continue;
            }
            let dist = probe.cosine_distance(&entry.embedding);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {
                    if runner_up.map_or(true, |r| dist < r) {
                        runner_up = Some(dist);
                    }
                }
                _ => {
                    runner_up = best.map(|(_, d)| d);
                    best = Some((id, dist));
                }
            }
        }

        match best {
            Some((id, distance)) if distance < threshold => MatchResult {
                identity: Identity::Known(id.to_string()),
                distance,
                runner_up,
            },
            Some((_, distance)) => MatchResult {
                identity: Identity::Unknown,
                distance,
                runner_up,
            },
            None => MatchResult {
                identity: Identity::Unknown,
                distance: 2.0,
                runner_up: None,
            },
        }
    }
}
