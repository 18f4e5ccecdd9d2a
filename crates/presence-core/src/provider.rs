//! Embedding provider contract.
//!
//! The face model lives outside this workspace. The core only needs one
//! capability from it: turn an image into an embedding plus the region the
//! face was found in.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding provider failed: {0}")]
    Failed(String),
}

/// A successful extraction.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub embedding: Embedding,
    /// Where the face was found, in the coordinates of the input image.
    pub detection: BoundingBox,
}

/// External face embedding capability.
///
/// Implementations may block for tens to hundreds of milliseconds; callers
/// must not hold any frame lock while calling `embed`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, image: &RgbImage) -> Result<FaceEmbedding, ProviderError>;
}
