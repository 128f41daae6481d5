//! Enrollment workflow: capture/upload → extraction → gallery write.

use crate::extractor::{EmbeddingExtractor, ExtractionError};
use crate::gallery::{Gallery, StoreError};
use crate::types::{GalleryEntry, Identity, IdentityError};
use crate::vectorizer::{ImageLocator, VectorRef, VectorizationService, VectorizeError};
use presence_hw::{Frame, FrameError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("no face detected in the enrollment image")]
    NoFaceDetected,
    #[error("more than one face in the enrollment image")]
    MultipleFacesDetected,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("embedding model not loaded")]
    ModelNotLoaded,
    #[error("identity is already enrolled")]
    AlreadyEnrolled,
    #[error("upstream service failure: {0}")]
    UpstreamServiceFailure(String),
}

impl From<ExtractionError> for EnrollmentError {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::NoFaceDetected => EnrollmentError::NoFaceDetected,
            ExtractionError::MultipleFacesDetected => EnrollmentError::MultipleFacesDetected,
            ExtractionError::ModelNotLoaded => EnrollmentError::ModelNotLoaded,
            ExtractionError::ModelUnavailable(reason) | ExtractionError::Upstream(reason) => {
                EnrollmentError::UpstreamServiceFailure(reason)
            }
        }
    }
}

impl From<StoreError> for EnrollmentError {
    fn from(e: StoreError) -> Self {
        EnrollmentError::UpstreamServiceFailure(e.to_string())
    }
}

impl From<FrameError> for EnrollmentError {
    fn from(e: FrameError) -> Self {
        EnrollmentError::InvalidImage(e.to_string())
    }
}

impl From<IdentityError> for EnrollmentError {
    fn from(e: IdentityError) -> Self {
        EnrollmentError::InvalidIdentity(e.to_string())
    }
}

impl From<VectorizeError> for EnrollmentError {
    fn from(e: VectorizeError) -> Self {
        match e {
            VectorizeError::AlreadyEnrolled => EnrollmentError::AlreadyEnrolled,
            VectorizeError::Rejected(reason) => EnrollmentError::InvalidImage(reason),
            VectorizeError::Upstream(reason) => EnrollmentError::UpstreamServiceFailure(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrollOptions {
    /// Drop the identity's previous entries once the new descriptor is extracted.
    pub replace_existing: bool,
}

/// One identity to consider during a batch backfill.
#[derive(Debug, Clone)]
pub struct BackfillCandidate {
    pub identity: Identity,
    /// Remote enrollment photo, if the identity has one on file.
    pub locator: Option<ImageLocator>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackfillOutcome {
    Enrolled { vector_id: String },
    AlreadyEnrolled,
    NoImage,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<(Identity, BackfillOutcome)>,
}

impl BackfillReport {
    fn record(&mut self, identity: Identity, outcome: BackfillOutcome) {
        match &outcome {
            BackfillOutcome::Enrolled { .. } => self.processed += 1,
            BackfillOutcome::AlreadyEnrolled | BackfillOutcome::NoImage => self.skipped += 1,
            BackfillOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push((identity, outcome));
    }
}

pub struct EnrollmentWorkflow {
    extractor: Arc<dyn EmbeddingExtractor>,
    gallery: Arc<Gallery>,
    vectorizer: Option<Arc<dyn VectorizationService>>,
}

impl EnrollmentWorkflow {
    pub fn new(extractor: Arc<dyn EmbeddingExtractor>, gallery: Arc<Gallery>) -> Self {
        Self {
            extractor,
            gallery,
            vectorizer: None,
        }
    }

    pub fn with_vectorizer(mut self, vectorizer: Arc<dyn VectorizationService>) -> Self {
        self.vectorizer = Some(vectorizer);
        self
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Load the embedding model if nobody has yet.
    pub async fn prepare(&self) -> Result<(), EnrollmentError> {
        if !self.extractor.is_loaded() {
            self.extractor.load().await?;
        }
        Ok(())
    }

    pub async fn enroll(
        &self,
        identity: &Identity,
        frame: &Frame,
    ) -> Result<GalleryEntry, EnrollmentError> {
        self.enroll_with(identity, frame, EnrollOptions::default())
            .await
    }

    pub async fn enroll_with(
        &self,
        identity: &Identity,
        frame: &Frame,
        options: EnrollOptions,
    ) -> Result<GalleryEntry, EnrollmentError> {
        let descriptor = match self.extractor.extract(frame).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "enrollment extraction failed");
                return Err(e.into());
            }
        };

        let previous = if options.replace_existing {
            self.gallery.entries_for(identity).await?
        } else {
            Vec::new()
        };

        // The new descriptor lands before the old ones go, so a failed write
        // never leaves the identity without any.
        let entry = self
            .gallery
            .append(GalleryEntry::new(identity.clone(), descriptor))
            .await?;
        tracing::info!(identity = %identity, entry_id = %entry.id, "descriptor enrolled");

        for old in &previous {
            if let Err(e) = self.gallery.remove_entry(&old.id).await {
                tracing::warn!(
                    identity = %identity,
                    entry_id = %old.id,
                    error = %e,
                    "stale descriptor left behind after replacement"
                );
                return Err(e.into());
            }
        }
        if !previous.is_empty() {
            tracing::info!(
                identity = %identity,
                removed = previous.len(),
                "previous descriptors replaced"
            );
        }
        Ok(entry)
    }

    /// Decode an uploaded image (PNG, JPEG, ...) and enroll it.
    pub async fn enroll_image(
        &self,
        identity: &Identity,
        bytes: &[u8],
        options: EnrollOptions,
    ) -> Result<GalleryEntry, EnrollmentError> {
        let frame = Frame::decode(bytes)?;
        self.enroll_with(identity, &frame, options).await
    }

    /// Hand enrollment to the vectorization service.
    pub async fn enroll_remote(
        &self,
        identity: &Identity,
        locator: &ImageLocator,
    ) -> Result<VectorRef, EnrollmentError> {
        let vectorizer = self.vectorizer.as_ref().ok_or_else(|| {
            EnrollmentError::UpstreamServiceFailure("no vectorization service configured".into())
        })?;
        let vector = vectorizer.vectorize(identity, locator).await?;
        // The service wrote to the backing store behind our back.
        self.gallery.invalidate();
        tracing::info!(identity = %identity, vector_id = %vector, "remote enrollment complete");
        Ok(vector)
    }

    pub async fn remove(&self, identity: &Identity) -> Result<usize, EnrollmentError> {
        let removed = self.gallery.remove_identity(identity).await?;
        tracing::info!(identity = %identity, removed, "identity removed");
        Ok(removed)
    }

    /// Vectorize every candidate that has a photo but no descriptors yet.
    pub async fn backfill(
        &self,
        candidates: Vec<BackfillCandidate>,
    ) -> Result<BackfillReport, EnrollmentError> {
        let enrolled: std::collections::BTreeSet<Identity> = self
            .gallery
            .snapshot()
            .await?
            .entries()
            .iter()
            .map(|e| e.identity.clone())
            .collect();

        let mut report = BackfillReport::default();
        for candidate in candidates {
            let outcome = if enrolled.contains(&candidate.identity) {
                BackfillOutcome::AlreadyEnrolled
            } else if let Some(locator) = &candidate.locator {
                match self.enroll_remote(&candidate.identity, locator).await {
                    Ok(vector) => BackfillOutcome::Enrolled { vector_id: vector.0 },
                    Err(EnrollmentError::AlreadyEnrolled) => BackfillOutcome::AlreadyEnrolled,
                    Err(e) => BackfillOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            } else {
                BackfillOutcome::NoImage
            };
            report.record(candidate.identity, outcome);
        }

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::MemoryGalleryStore;
    use crate::testing::*;
    use crate::types::Threshold;
    use crate::verify::VerificationWorkflow;
    use crate::gallery::GalleryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const CAROL: [u8; 4] = [120, 60, 200, 30];
    const DAVE: [u8; 4] = [30, 220, 60, 150];

    fn identity(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn setup() -> (EnrollmentWorkflow, Arc<Gallery>) {
        let gallery = Arc::new(Gallery::new(Arc::new(MemoryGalleryStore::new())));
        let wf = EnrollmentWorkflow::new(Arc::new(PixelExtractor::loaded()), gallery.clone());
        (wf, gallery)
    }

    /// Vectorizer that "stores" by appending a fixed descriptor to the gallery.
    struct FakeVectorizer {
        gallery: Arc<Gallery>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorizationService for FakeVectorizer {
        async fn vectorize(
            &self,
            identity: &Identity,
            locator: &ImageLocator,
        ) -> Result<VectorRef, VectorizeError> {
            self.seen.lock().unwrap().push(locator.to_string());
            if locator.as_str().ends_with("broken.jpg") {
                return Err(VectorizeError::Rejected("no face in image".into()));
            }
            let entry = self
                .gallery
                .append(GalleryEntry::new(identity.clone(), descriptor_of(DAVE)))
                .await
                .map_err(|e| VectorizeError::Upstream(e.to_string()))?;
            Ok(VectorRef(entry.id))
        }
    }

    #[tokio::test]
    async fn test_enroll_then_verify_matches() {
        let (enroller, gallery) = setup();
        let extractor = Arc::new(PixelExtractor::new());
        let source = Arc::new(ScriptedSource::new(face_frame(CAROL)));
        let entry = enroller
            .enroll(&identity("E7"), &face_frame(CAROL))
            .await
            .unwrap();
        assert_eq!(entry.identity, identity("E7"));

        let mut verifier =
            VerificationWorkflow::new(extractor, source, gallery, Threshold::default());
        verifier.start().await.unwrap();
        let result = verifier.scan().await.unwrap();
        assert_eq!(result.identity(), Some(&identity("E7")));
        assert_eq!(result.distance(), Some(0.0));
    }

    #[tokio::test]
    async fn test_enroll_rejects_faceless_and_crowded_images() {
        let (enroller, gallery) = setup();
        assert_eq!(
            enroller.enroll(&identity("E1"), &empty_frame()).await,
            Err(EnrollmentError::NoFaceDetected)
        );
        assert_eq!(
            enroller.enroll(&identity("E1"), &crowd_frame()).await,
            Err(EnrollmentError::MultipleFacesDetected)
        );
        assert!(gallery.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_before_prepare_fails_fast() {
        let gallery = Arc::new(Gallery::new(Arc::new(MemoryGalleryStore::new())));
        let enroller = EnrollmentWorkflow::new(Arc::new(PixelExtractor::new()), gallery);
        assert_eq!(
            enroller.enroll(&identity("E1"), &face_frame(CAROL)).await,
            Err(EnrollmentError::ModelNotLoaded)
        );
        enroller.prepare().await.unwrap();
        assert!(enroller
            .enroll(&identity("E1"), &face_frame(CAROL))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_re_enrollment_appends() {
        let (enroller, gallery) = setup();
        let e1 = identity("E1");
        enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();
        enroller.enroll(&e1, &face_frame(DAVE)).await.unwrap();
        assert_eq!(gallery.entries_for(&e1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_existing_swaps_entries() {
        let (enroller, gallery) = setup();
        let e1 = identity("E1");
        enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();
        enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();

        let replace = EnrollOptions {
            replace_existing: true,
        };
        let fresh = enroller
            .enroll_with(&e1, &face_frame(DAVE), replace)
            .await
            .unwrap();
        let entries = gallery.entries_for(&e1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_replace_keeps_old_entries_when_extraction_fails() {
        let (enroller, gallery) = setup();
        let e1 = identity("E1");
        enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();

        let replace = EnrollOptions {
            replace_existing: true,
        };
        let err = enroller
            .enroll_with(&e1, &empty_frame(), replace)
            .await
            .unwrap_err();
        assert_eq!(err, EnrollmentError::NoFaceDetected);
        assert_eq!(gallery.entries_for(&e1).await.unwrap().len(), 1);
    }

    /// Memory store whose appends can be switched to fail.
    struct FlakyStore {
        inner: MemoryGalleryStore,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl GalleryStore for FlakyStore {
        async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
            self.inner.load_all().await
        }
        async fn load_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError> {
            self.inner.load_for(identity).await
        }
        async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.append(entry).await
        }
        async fn delete_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
            self.inner.delete_identity(identity).await
        }
        async fn delete_entry(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_entry(id).await
        }
    }

    #[tokio::test]
    async fn test_replace_keeps_old_entries_when_store_write_fails() {
        let store = Arc::new(FlakyStore {
            inner: MemoryGalleryStore::new(),
            fail_appends: AtomicBool::new(false),
        });
        let gallery = Arc::new(Gallery::new(store.clone()));
        let enroller =
            EnrollmentWorkflow::new(Arc::new(PixelExtractor::loaded()), gallery.clone());
        let e1 = identity("E1");
        let original = enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();

        store.fail_appends.store(true, Ordering::SeqCst);
        let replace = EnrollOptions {
            replace_existing: true,
        };
        let err = enroller
            .enroll_with(&e1, &face_frame(DAVE), replace)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::UpstreamServiceFailure(_)));

        let entries = gallery.entries_for(&e1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, original.id);
    }

    #[tokio::test]
    async fn test_enroll_image_rejects_garbage() {
        let (enroller, _) = setup();
        let err = enroller
            .enroll_image(&identity("E1"), b"definitely not a png", EnrollOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let (enroller, gallery) = setup();
        let e1 = identity("E1");
        enroller.enroll(&e1, &face_frame(CAROL)).await.unwrap();
        enroller.enroll(&e1, &face_frame(DAVE)).await.unwrap();
        enroller
            .enroll(&identity("E2"), &face_frame(DAVE))
            .await
            .unwrap();

        assert_eq!(enroller.remove(&e1).await.unwrap(), 2);
        let stats = gallery.stats().await.unwrap();
        assert_eq!(stats.identities, 1);
        assert_eq!(stats.descriptors, 1);
    }

    #[tokio::test]
    async fn test_enroll_remote_without_service() {
        let (enroller, _) = setup();
        let locator = ImageLocator::new("https://cdn.example.com/e1.jpg").unwrap();
        assert!(matches!(
            enroller.enroll_remote(&identity("E1"), &locator).await,
            Err(EnrollmentError::UpstreamServiceFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_backfill_skips_enrolled_and_reports() {
        let (enroller, gallery) = setup();
        let enroller = enroller.with_vectorizer(Arc::new(FakeVectorizer {
            gallery: gallery.clone(),
            seen: Mutex::new(Vec::new()),
        }));
        enroller
            .enroll(&identity("E1"), &face_frame(CAROL))
            .await
            .unwrap();

        let candidate = |id: &str, url: Option<&str>| BackfillCandidate {
            identity: identity(id),
            locator: url.map(|u| ImageLocator::new(u).unwrap()),
        };
        let report = enroller
            .backfill(vec![
                candidate("E1", Some("https://cdn.example.com/e1.jpg")),
                candidate("E2", Some("https://cdn.example.com/e2.jpg")),
                candidate("E3", None),
                candidate("E4", Some("https://cdn.example.com/broken.jpg")),
            ])
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes[0].1, BackfillOutcome::AlreadyEnrolled);
        assert!(matches!(
            report.outcomes[1].1,
            BackfillOutcome::Enrolled { .. }
        ));
        assert_eq!(report.outcomes[2].1, BackfillOutcome::NoImage);
        assert_eq!(
            gallery.entries_for(&identity("E2")).await.unwrap().len(),
            1
        );
    }
}
