//! Enrollment of a new identity from a face image.
//!
//! ```text
//! Received ─► Detected ─► LivenessChecked ─► Embedded ─► Stored
//!     │           │               │              └────► Duplicate
//!     └───────────┴───────────────┴──► Rejected(reason)
//! ```
//!
//! The crop path used by document ingestion enters at `Received` and goes
//! straight to `Embedded`. Only the store decides uniqueness: two concurrent
//! enrollments of one key both reach `Embedded` and exactly one is `Stored`.

use crate::engine::{EngineError, EngineHandle};
use crate::error::PipelineError;
use image::RgbImage;
use rollcall_core::liveness::{self, LivenessVerdict};
use rollcall_core::{Embedding, ExtractorError, FaceCandidate, IdentityKey};
use rollcall_store::{FaceStore, StoreError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoFace,
    MultipleFaces(usize),
    NotLive,
    /// The detected box lies outside the image.
    EmptyCrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Received,
    Detected,
    LivenessChecked,
    Embedded,
    Stored,
    Rejected(RejectReason),
    Duplicate,
}

impl EnrollmentState {
    pub fn can_advance_to(&self, next: &EnrollmentState) -> bool {
        use EnrollmentState::*;
        matches!(
            (self, next),
            (Received, Detected)
                | (Received, Embedded)
                | (Received, Rejected(_))
                | (Detected, LivenessChecked)
                | (Detected, Rejected(_))
                | (LivenessChecked, Embedded)
                | (LivenessChecked, Rejected(_))
                | (Embedded, Stored)
                | (Embedded, Duplicate)
        )
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    pub state: EnrollmentState,
    /// Set once the face was embedded, whether or not it was stored.
    pub embedding: Option<Embedding>,
    pub liveness: Option<LivenessVerdict>,
}

impl EnrollmentOutcome {
    /// The stored embedding, or the failure taxonomy entry for any other end state.
    pub fn into_result(self) -> Result<Embedding, PipelineError> {
        match self.state {
            EnrollmentState::Stored => self
                .embedding
                .ok_or_else(|| PipelineError::ExtractionFailed("no embedding recorded".into())),
            EnrollmentState::Duplicate => Err(PipelineError::DuplicateIdentity),
            EnrollmentState::Rejected(RejectReason::NoFace | RejectReason::EmptyCrop) => {
                Err(PipelineError::NoFaceDetected)
            }
            EnrollmentState::Rejected(RejectReason::MultipleFaces(n)) => {
                Err(PipelineError::MultipleFacesDetected(n))
            }
            EnrollmentState::Rejected(RejectReason::NotLive) => Err(PipelineError::LivenessFailed(
                self.liveness.map_or(0.0, |v| v.ear),
            )),
            other => Err(PipelineError::ExtractionFailed(format!(
                "enrollment stopped at {other:?}"
            ))),
        }
    }
}

struct Progress {
    key: IdentityKey,
    state: EnrollmentState,
    embedding: Option<Embedding>,
    liveness: Option<LivenessVerdict>,
}

impl Progress {
    fn new(key: IdentityKey) -> Self {
        Self {
            key,
            state: EnrollmentState::Received,
            embedding: None,
            liveness: None,
        }
    }

    fn advance(&mut self, next: EnrollmentState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal enrollment transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(identity = %self.key, from = ?self.state, to = ?next, "enrollment");
        self.state = next;
    }

    fn reject(mut self, reason: RejectReason) -> EnrollmentOutcome {
        self.advance(EnrollmentState::Rejected(reason));
        tracing::info!(identity = %self.key, reason = ?reason, "enrollment rejected");
        self.finish()
    }

    fn finish(self) -> EnrollmentOutcome {
        EnrollmentOutcome {
            state: self.state,
            embedding: self.embedding,
            liveness: self.liveness,
        }
    }
}

pub struct EnrollmentManager {
    engine: EngineHandle,
    store: Arc<dyn FaceStore>,
    enforce_liveness: bool,
    liveness_threshold: f32,
}

impl EnrollmentManager {
    pub fn new(
        engine: EngineHandle,
        store: Arc<dyn FaceStore>,
        enforce_liveness: bool,
        liveness_threshold: f32,
    ) -> Self {
        Self {
            engine,
            store,
            enforce_liveness,
            liveness_threshold,
        }
    }

    /// Single-image enrollment: exactly one face, liveness, embed, store.
    pub async fn enroll_image(
        &self,
        key: IdentityKey,
        image: Arc<RgbImage>,
        cancel: &CancellationToken,
    ) -> Result<EnrollmentOutcome, PipelineError> {
        let mut progress = Progress::new(key);

        let detections = self.engine.detect(image.clone(), cancel).await?;
        match detections.len() {
            0 => return Ok(progress.reject(RejectReason::NoFace)),
            1 => progress.advance(EnrollmentState::Detected),
            n => return Ok(progress.reject(RejectReason::MultipleFaces(n))),
        }

        let Some(mut candidate) = FaceCandidate::from_detection(&image, &detections[0]) else {
            return Ok(progress.reject(RejectReason::EmptyCrop));
        };

        let verdict = candidate
            .landmarks
            .as_ref()
            .and_then(|lm| liveness::evaluate(lm, self.liveness_threshold));
        candidate.live = verdict.map(|v| v.is_live);
        progress.liveness = verdict;
        match verdict {
            Some(v) => tracing::debug!(identity = %progress.key, ear = v.ear, live = v.is_live, "liveness"),
            None => tracing::debug!(identity = %progress.key, "no eye landmarks for liveness"),
        }
        if self.enforce_liveness && candidate.live != Some(true) {
            return Ok(progress.reject(RejectReason::NotLive));
        }
        progress.advance(EnrollmentState::LivenessChecked);

        let embedding = self.engine.embed(candidate.crop, cancel).await?;
        progress.advance(EnrollmentState::Embedded);
        self.store_embedding(progress, embedding).await
    }

    /// Crop enrollment: the caller already isolated one face.
    pub async fn enroll_crop(
        &self,
        key: IdentityKey,
        crop: RgbImage,
        cancel: &CancellationToken,
    ) -> Result<EnrollmentOutcome, PipelineError> {
        let mut progress = Progress::new(key);
        let embedding = self.engine.embed(crop, cancel).await?;
        progress.advance(EnrollmentState::Embedded);
        self.store_embedding(progress, embedding).await
    }

    async fn store_embedding(
        &self,
        mut progress: Progress,
        embedding: Embedding,
    ) -> Result<EnrollmentOutcome, PipelineError> {
        if embedding.dimension() != self.engine.dimension() {
            return Err(EngineError::Extractor(ExtractorError::DimensionMismatch {
                expected: self.engine.dimension(),
                actual: embedding.dimension(),
            })
            .into());
        }

        let store = Arc::clone(&self.store);
        let key = progress.key.clone();
        let to_insert = embedding.clone();
        let inserted = tokio::task::spawn_blocking(move || store.insert_identity(&key, &to_insert))
            .await?;
        progress.embedding = Some(embedding);

        match inserted {
            Ok(identity) => {
                progress.advance(EnrollmentState::Stored);
                tracing::info!(identity = %progress.key, id = %identity.id, "identity enrolled");
            }
            Err(StoreError::ConstraintViolation(_)) => {
                progress.advance(EnrollmentState::Duplicate);
                tracing::info!(identity = %progress.key, "identity already enrolled");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(progress.finish())
    }
}
