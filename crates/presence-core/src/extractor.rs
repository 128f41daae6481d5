//! Embedding extractor contract.
//!
//! Face detection, landmarking and embedding are someone else's job; the
//! engine only needs "frame in, one descriptor out" plus a load step.

use crate::types::{Descriptor, DistanceMetric};
use async_trait::async_trait;
use presence_hw::Frame;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("more than one face detected")]
    MultipleFacesDetected,
    #[error("embedding model not loaded; call load() first")]
    ModelNotLoaded,
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("extractor failure: {0}")]
    Upstream(String),
}

impl ExtractionError {
    /// True for the two outcomes that describe the picture rather than a failure.
    pub fn is_face_outcome(&self) -> bool {
        matches!(
            self,
            ExtractionError::NoFaceDetected | ExtractionError::MultipleFacesDetected
        )
    }
}

/// Turns an image into exactly one face descriptor.
///
/// Implementations must be idempotent for a fixed image and must fail fast
/// with [`ExtractionError::ModelNotLoaded`] when `extract` is called before
/// `load` has completed.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// Load the embedding model. Idempotent once it has succeeded.
    async fn load(&self) -> Result<(), ExtractionError>;

    fn is_loaded(&self) -> bool;

    async fn extract(&self, frame: &Frame) -> Result<Descriptor, ExtractionError>;

    /// Dimensionality N of produced descriptors.
    fn dimension(&self) -> usize;

    /// Metric the descriptors (and therefore the threshold) are calibrated for.
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }
}
