//! presence-core: descriptor matching and the enrollment / verification engine.
//!
//! Face detection and embedding happen behind [`EmbeddingExtractor`]; this
//! crate owns everything from "one descriptor per frame" onwards: the gallery,
//! the nearest-neighbour decision and the workflow state machines.

pub mod enroll;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod types;
pub mod vectorizer;
pub mod verify;

#[cfg(test)]
mod testing;

pub use enroll::{
    BackfillCandidate, BackfillOutcome, BackfillReport, EnrollOptions, EnrollmentError,
    EnrollmentWorkflow,
};
pub use extractor::{EmbeddingExtractor, ExtractionError};
pub use gallery::{
    Gallery, GallerySnapshot, GalleryStats, GalleryStore, MemoryGalleryStore, StoreError,
};
pub use matcher::{EuclideanMatcher, Matcher};
pub use types::{
    Descriptor, DescriptorError, DistanceMetric, GalleryEntry, Identity, IdentityError,
    MatchResult, Threshold, ThresholdError, DEFAULT_THRESHOLD, MAX_IDENTITY_LEN,
};
pub use vectorizer::{ImageLocator, VectorRef, VectorizationService, VectorizeError};
pub use verify::{ReleaseHandle, VerificationWorkflow, WorkflowError, WorkflowState};
