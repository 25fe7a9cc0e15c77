//! Face matching against the known-face set with vote tallying.
//!
//! A candidate embedding is compared with every enrolled embedding; each
//! enrolled embedding within tolerance casts one vote for its name. The
//! name with the most votes wins, and ties go to whichever name entered
//! the tally first. The same tally then runs across all regions of a frame
//! to pick the frame's single recognized identity.

use crate::types::{BoundingBox, DetectedFace, Embedding, KnownFaceSet, UNKNOWN};
use indexmap::IndexMap;

/// Default Euclidean distance tolerance for a positive match.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Per-name vote counter that remembers insertion order.
#[derive(Debug, Default)]
pub struct VoteTally {
    counts: IndexMap<String, usize>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vote(&mut self, name: &str) {
        match self.counts.get_mut(name) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(name.to_string(), 1);
            }
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Name with the highest vote count; the earliest inserted wins a tie.
    pub fn winner(&self) -> Option<&str> {
        let mut best: Option<(&str, usize)> = None;
        for (name, &count) in &self.counts {
            match best {
                Some((_, best_count)) if count <= best_count => {}
                _ => best = Some((name.as_str(), count)),
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Strategy for resolving a candidate embedding to an enrolled identity.
pub trait Matcher {
    fn best_match(&self, candidate: &Embedding, known: &KnownFaceSet, tolerance: f32) -> Option<String>;
}

/// Euclidean distance matcher with per-name voting.
///
/// Iterates every enrolled embedding; there is no early exit on the first
/// match so that multiple embeddings of one person all count.
pub struct DistanceMatcher;

impl Matcher for DistanceMatcher {
    fn best_match(&self, candidate: &Embedding, known: &KnownFaceSet, tolerance: f32) -> Option<String> {
        let mut tally = VoteTally::new();
        let mut mismatched = 0usize;
        for face in known.iter() {
            if !candidate.is_comparable(&face.embedding) {
                mismatched += 1;
                continue;
            }
            // NaN distances compare false and never vote.
            if candidate.euclidean_distance(&face.embedding) <= tolerance {
                tally.vote(&face.name);
            }
        }
        if mismatched > 0 {
            tracing::warn!(
                embedding_len = candidate.values.len(),
                skipped = mismatched,
                "embedding dimensions differ from enrolled faces; entries skipped"
            );
        }
        tally.winner().map(str::to_string)
    }
}

/// A face region with the name drawn next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLabel {
    pub bbox: BoundingBox,
    pub name: String,
}

/// Outcome of recognizing one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    /// One label per detected region, in detection order.
    pub labels: Vec<FaceLabel>,
    /// The frame's recognized identity: `None` when no face was detected,
    /// [`UNKNOWN`] when faces were found but none matched.
    pub identity: Option<String>,
}

/// Label every detected region and elect the frame's identity.
pub fn recognize<M: Matcher + ?Sized>(
    matcher: &M,
    faces: &[DetectedFace],
    known: &KnownFaceSet,
    tolerance: f32,
) -> Recognition {
    if faces.is_empty() {
        return Recognition::default();
    }

    let mut frame_tally = VoteTally::new();
    let labels = faces
        .iter()
        .map(|face| {
            let name = match matcher.best_match(&face.embedding, known, tolerance) {
                Some(name) => {
                    frame_tally.vote(&name);
                    name
                }
                None => UNKNOWN.to_string(),
            };
            FaceLabel {
                bbox: face.bbox,
                name,
            }
        })
        .collect();

    let identity = frame_tally.winner().unwrap_or(UNKNOWN).to_string();
    tracing::debug!(regions = faces.len(), identity = %identity, "frame recognized");

    Recognition {
        labels,
        identity: Some(identity),
    }
}
