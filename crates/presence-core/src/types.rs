use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance reported for embeddings that cannot be compared (length mismatch).
pub const MAX_DISTANCE: f32 = 2.0;

/// Face region reported by the embedding provider, in raw frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// The same region after the frame is flipped around its vertical axis.
    pub fn mirrored(&self, frame_width: u32) -> BoundingBox {
        BoundingBox {
            x: frame_width as f32 - (self.x + self.width),
            ..*self
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingParseError {
    #[error("malformed embedding JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Face embedding vector as produced by the external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Parse the stored representation: a JSON array of numbers.
    pub fn from_json(raw: &str) -> Result<Self, EmbeddingParseError> {
        let values: Vec<f32> = serde_json::from_str(raw)?;
        if values.is_empty() {
            return Err(EmbeddingParseError::Empty);
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingParseError::NonFinite(idx));
        }
        Ok(Self::new(values))
    }

    /// Serialize to the stored representation.
    pub fn to_json(&self) -> String {
        // A Vec<f32> of finite values always serializes.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero-norm vectors score 0.0; vectors of different length score -1.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return -1.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Cosine distance `1 - cos(a, b)` in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// One row of the in-memory matching snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine distance of the nearest entry, `None` for an empty gallery.
    pub distance: Option<f32>,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
}

impl MatchResult {
    fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            identity_id: None,
            display_name: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Find the nearest gallery entry; it matches only when its distance is
    /// strictly below `threshold`.
    fn compare(&self, probe: &Embedding, gallery: &[CacheEntry], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over cosine distance.
///
/// Always scans the whole gallery; there is no early exit on a good match.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[CacheEntry], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = probe.distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                distance: Some(best_dist),
                identity_id: Some(gallery[idx].identity_id.clone()),
                display_name: Some(gallery[idx].display_name.clone()),
            },
            Some(idx) => MatchResult {
                identity_id: Some(gallery[idx].identity_id.clone()),
                display_name: Some(gallery[idx].display_name.clone()),
                ..MatchResult::no_match(Some(best_dist))
            },
            None => MatchResult::no_match(None),
        }
    }
}
