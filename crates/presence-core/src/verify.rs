//! Verification workflow: live capture → extraction → matching → decision.
//!
//! One workflow instance owns one capture stream and one view of the gallery.
//! Scans are sequential (`scan` takes `&mut self`); release is the only
//! cancellation primitive and may be triggered from another task through a
//! [`ReleaseHandle`].

use crate::extractor::{EmbeddingExtractor, ExtractionError};
use crate::gallery::{Gallery, StoreError};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::{DistanceMetric, GalleryEntry, Identity, MatchResult, Threshold};
use presence_hw::{CaptureError, CaptureSource, CaptureStream, Frame};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowState {
    Idle,
    ModelLoading,
    /// Model loaded, no live feed.
    Ready,
    /// Model loaded and the capture stream is open.
    Capturing,
    Scanning,
    Result(MatchResult),
    /// Model load failed; the instance must be recreated.
    Failed(String),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("embedding model failed to load: {0}")]
    ModelLoad(ExtractionError),
    #[error("workflow is defunct after a model load failure")]
    Defunct,
    #[error("workflow not started")]
    NotStarted,
    #[error("no live capture feed; open the capture source first")]
    NoCaptureFeed,
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("extraction: {0}")]
    Extraction(ExtractionError),
    #[error("gallery: {0}")]
    Gallery(#[from] StoreError),
    #[error("capture source released")]
    Released,
    #[error("no descriptors enrolled for {0}")]
    NotEnrolled(Identity),
    #[error("scan timed out after {0:?}")]
    Timeout(Duration),
}

impl WorkflowError {
    /// Fatal errors require a new workflow instance; everything else can be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkflowError::ModelLoad(_) | WorkflowError::Defunct)
    }
}

/// State shared between the workflow and its release handles.
struct Shared {
    state: watch::Sender<WorkflowState>,
    stream: Mutex<Option<Arc<dyn CaptureStream>>>,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn stream(&self) -> Option<Arc<dyn CaptureStream>> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|s| !s.is_closed())
    }

    fn release(&self) {
        self.token().cancel();
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stream) = stream {
            stream.close();
            tracing::info!("capture source released");
        }
        self.reset();
    }

    fn reset(&self) {
        self.state.send_if_modified(|state| match state {
            WorkflowState::Idle | WorkflowState::Failed(_) => false,
            _ => {
                *state = WorkflowState::Idle;
                true
            }
        });
    }

    /// Move to `next` unless `token` was cancelled or the workflow failed.
    ///
    /// The token is checked under the state lock. A release cancels its token
    /// before it writes `Idle`, so a transition that loses the race can never
    /// overwrite that `Idle`.
    fn advance(&self, token: &CancellationToken, next: WorkflowState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if token.is_cancelled() || matches!(state, WorkflowState::Failed(_)) {
                return false;
            }
            *state = next;
            applied = true;
            true
        });
        applied
    }

    /// Back to `Idle` after a released operation, unless the workflow failed.
    fn released(&self) -> WorkflowError {
        self.reset();
        WorkflowError::Released
    }

    /// Return to `Capturing` or `Ready` unless the workflow was released or failed meanwhile.
    fn settle(&self) {
        let live = self.stream().is_some();
        self.state.send_if_modified(|state| match state {
            WorkflowState::Idle | WorkflowState::Failed(_) => false,
            _ => {
                *state = if live {
                    WorkflowState::Capturing
                } else {
                    WorkflowState::Ready
                };
                true
            }
        });
    }
}

/// Cloneable handle that releases the workflow's capture source from any task.
#[derive(Clone)]
pub struct ReleaseHandle {
    shared: Arc<Shared>,
}

impl ReleaseHandle {
    /// Close the stream, abandon a pending read, and move to `Idle`. Idempotent.
    pub fn release(&self) {
        self.shared.release();
    }
}

pub struct VerificationWorkflow {
    extractor: Arc<dyn EmbeddingExtractor>,
    source: Arc<dyn CaptureSource>,
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    shared: Arc<Shared>,
}

impl VerificationWorkflow {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        source: Arc<dyn CaptureSource>,
        gallery: Arc<Gallery>,
        threshold: Threshold,
    ) -> Self {
        let (state, _) = watch::channel(WorkflowState::Idle);
        Self {
            extractor,
            source,
            gallery,
            matcher: EuclideanMatcher::new(threshold),
            shared: Arc::new(Shared {
                state,
                stream: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.shared.state.borrow().clone()
    }

    /// Observe state transitions. Intermediate states may be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.shared.state.subscribe()
    }

    pub fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.matcher.threshold()
    }

    pub fn has_live_feed(&self) -> bool {
        self.shared.stream().is_some()
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    /// Load the model, then try to open the capture source.
    ///
    /// A model failure is fatal. A capture failure is returned but leaves the
    /// workflow `Ready`, so still images can be verified and
    /// [`open_capture`](Self::open_capture) retried.
    pub async fn start(&mut self) -> Result<(), WorkflowError> {
        match self.state() {
            WorkflowState::Idle => {}
            WorkflowState::Failed(_) => return Err(WorkflowError::Defunct),
            _ => return Ok(()),
        }

        let token = CancellationToken::new();
        *self.shared.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        if !self.shared.advance(&token, WorkflowState::ModelLoading) {
            return Err(self.shared.released());
        }

        let loaded = match self.extractor.metric() {
            DistanceMetric::Euclidean => self.extractor.load().await,
        };
        if let Err(e) = loaded {
            tracing::error!(error = %e, "embedding model failed to load");
            self.shared
                .state
                .send_replace(WorkflowState::Failed(e.to_string()));
            return Err(WorkflowError::ModelLoad(e));
        }
        if !self.shared.advance(&token, WorkflowState::Ready) {
            return Err(self.shared.released());
        }
        tracing::info!(
            dimension = self.extractor.dimension(),
            threshold = self.threshold().value(),
            "embedding model ready"
        );

        self.open_feed(token).await
    }

    /// Open the capture source. Also the manual retry after a failed start.
    pub async fn open_capture(&mut self) -> Result<(), WorkflowError> {
        match self.state() {
            WorkflowState::Ready => {}
            WorkflowState::Failed(_) => return Err(WorkflowError::Defunct),
            WorkflowState::Idle | WorkflowState::ModelLoading => {
                return Err(WorkflowError::NotStarted)
            }
            _ => return Err(WorkflowError::Capture(CaptureError::AlreadyOpen)),
        }
        let token = self.shared.token();
        self.open_feed(token).await
    }

    async fn open_feed(&mut self, token: CancellationToken) -> Result<(), WorkflowError> {
        let stream = match self.source.open().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "capture source unavailable; ready without a live feed"
                );
                return Err(WorkflowError::Capture(e));
            }
        };

        {
            // A release takes the slot after cancelling, so checking under the lock
            // means the stream is either seen by that release or never stored.
            let mut slot = self.shared.stream.lock().unwrap_or_else(|e| e.into_inner());
            if token.is_cancelled() {
                drop(slot);
                stream.close();
                return Err(self.shared.released());
            }
            *slot = Some(stream);
        }
        if !self.shared.advance(&token, WorkflowState::Capturing) {
            return Err(self.shared.released());
        }
        tracing::info!(source = %self.source.describe(), "live capture feed open");
        Ok(())
    }

    fn ensure_scannable(&self) -> Result<(), WorkflowError> {
        match self.state() {
            WorkflowState::Ready | WorkflowState::Capturing | WorkflowState::Result(_) => Ok(()),
            WorkflowState::Failed(_) => Err(WorkflowError::Defunct),
            WorkflowState::Idle | WorkflowState::ModelLoading | WorkflowState::Scanning => {
                Err(WorkflowError::NotStarted)
            }
        }
    }

    /// Read exactly one frame from the live feed and decide who it is.
    pub async fn scan(&mut self) -> Result<MatchResult, WorkflowError> {
        self.ensure_scannable()?;
        self.scan_live(None).await
    }

    /// [`scan`](Self::scan) bounded by a caller-chosen timeout.
    pub async fn scan_within(&mut self, timeout: Duration) -> Result<MatchResult, WorkflowError> {
        match tokio::time::timeout(timeout, self.scan()).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(timeout)),
        }
    }

    /// Check a claimed identity against one live frame.
    ///
    /// Only the claimant's own descriptors are compared, so a closer match
    /// with somebody else still reports `NoMatch`.
    pub async fn verify_claim(
        &mut self,
        identity: &Identity,
    ) -> Result<MatchResult, WorkflowError> {
        self.ensure_scannable()?;
        let entries = self.claimed_entries(identity).await?;
        self.scan_live(Some(entries)).await
    }

    /// [`verify_claim`](Self::verify_claim) bounded by a caller-chosen timeout.
    pub async fn verify_claim_within(
        &mut self,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<MatchResult, WorkflowError> {
        match tokio::time::timeout(timeout, self.verify_claim(identity)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(timeout)),
        }
    }

    /// Verify a caller-supplied still image without touching the capture device.
    pub async fn verify_frame(&mut self, frame: Frame) -> Result<MatchResult, WorkflowError> {
        self.ensure_scannable()?;
        let token = self.begin_scan()?;
        self.evaluate(frame, token, None).await
    }

    /// Check a claimed identity against a still image.
    pub async fn verify_claim_frame(
        &mut self,
        identity: &Identity,
        frame: Frame,
    ) -> Result<MatchResult, WorkflowError> {
        self.ensure_scannable()?;
        let entries = self.claimed_entries(identity).await?;
        let token = self.begin_scan()?;
        self.evaluate(frame, token, Some(entries)).await
    }

    /// Grab one frame from the live feed without scanning it (camera-driven enrollment).
    pub async fn capture_frame(&mut self) -> Result<Frame, WorkflowError> {
        self.ensure_scannable()?;
        let stream = self.shared.stream().ok_or(WorkflowError::NoCaptureFeed)?;
        let token = self.shared.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(WorkflowError::Released),
            frame = stream.read_frame() => frame.map_err(|e| {
                if token.is_cancelled() { WorkflowError::Released } else { WorkflowError::Capture(e) }
            }),
        }
    }

    async fn claimed_entries(
        &self,
        identity: &Identity,
    ) -> Result<Vec<GalleryEntry>, WorkflowError> {
        let entries = self.gallery.entries_for(identity).await?;
        if entries.is_empty() {
            return Err(WorkflowError::NotEnrolled(identity.clone()));
        }
        Ok(entries)
    }

    /// Enter `Scanning` under the current token, or report the release that beat us.
    fn begin_scan(&self) -> Result<CancellationToken, WorkflowError> {
        let token = self.shared.token();
        if !self.shared.advance(&token, WorkflowState::Scanning) {
            return Err(self.shared.released());
        }
        Ok(token)
    }

    fn timed_out(&self, timeout: Duration) -> WorkflowError {
        tracing::warn!(?timeout, "scan timed out");
        self.shared.settle();
        WorkflowError::Timeout(timeout)
    }

    async fn scan_live(
        &mut self,
        claimed: Option<Vec<GalleryEntry>>,
    ) -> Result<MatchResult, WorkflowError> {
        let stream = self.shared.stream().ok_or(WorkflowError::NoCaptureFeed)?;
        let token = self.begin_scan()?;

        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(self.shared.released()),
            frame = stream.read_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) if token.is_cancelled() => return Err(self.shared.released()),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                self.shared.settle();
                return Err(WorkflowError::Capture(e));
            }
        };
        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "scanning a dark frame");
        }

        self.evaluate(frame, token, claimed).await
    }

    /// Extract and match one frame, against `claimed` when given or the whole gallery.
    async fn evaluate(
        &mut self,
        frame: Frame,
        token: CancellationToken,
        claimed: Option<Vec<GalleryEntry>>,
    ) -> Result<MatchResult, WorkflowError> {
        // Extraction is not interrupted by a release; its result is dropped instead.
        let extracted = self.extractor.extract(&frame).await;
        if token.is_cancelled() {
            tracing::debug!("scan finished after release; result discarded");
            return Err(self.shared.released());
        }

        let result = match extracted {
            Ok(query) => match claimed {
                Some(entries) => self.matcher.compare(&query, &entries),
                None => {
                    let snapshot = match self.gallery.snapshot().await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            tracing::warn!(error = %e, "gallery unavailable for scan");
                            self.shared.settle();
                            return Err(WorkflowError::Gallery(e));
                        }
                    };
                    self.matcher.compare(&query, snapshot.entries())
                }
            },
            Err(e) if !e.is_face_outcome() => {
                tracing::warn!(error = %e, "descriptor extraction failed");
                self.shared.settle();
                return Err(WorkflowError::Extraction(e));
            }
            Err(ExtractionError::MultipleFacesDetected) => MatchResult::AmbiguousCapture,
            Err(_) => MatchResult::NoFaceDetected,
        };

        if !self.shared.advance(&token, WorkflowState::Result(result.clone())) {
            tracing::debug!("scan finished after release; result discarded");
            return Err(self.shared.released());
        }

        match &result {
            MatchResult::Matched { identity, distance } => {
                tracing::info!(identity = %identity, distance, "verification matched")
            }
            MatchResult::NoMatch { best_distance } => {
                tracing::info!(best_distance, "verification: no match")
            }
            MatchResult::NoFaceDetected => tracing::info!("verification: no face detected"),
            MatchResult::AmbiguousCapture => tracing::info!("verification: multiple faces"),
        }

        self.shared.settle();
        Ok(result)
    }

    /// Close the capture stream and return to `Idle`. Safe from any state.
    pub fn release(&self) {
        self.shared.release();
    }
}

impl Drop for VerificationWorkflow {
    fn drop(&mut self) {
        self.shared.release();
    }
}
