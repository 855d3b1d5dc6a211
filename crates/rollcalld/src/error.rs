use crate::engine::EngineError;
use rollcall_store::StoreError;
use thiserror::Error;

/// Failures of the identity pipeline.
///
/// Detection, liveness and embedding failures are folded into classified
/// outcomes by the callers; only [`PipelineError::is_internal`] cases reach a
/// caller as a generic internal error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, expected one")]
    MultipleFacesDetected(usize),
    #[error("liveness check failed (EAR {0:.3})")]
    LivenessFailed(f32),
    #[error("identity already registered")]
    DuplicateIdentity,
    #[error("upstream registration call failed: {0}")]
    UpstreamCallFailed(String),
    #[error("could not extract images: {0}")]
    ExtractionFailed(String),
    #[error("store constraint violation")]
    StoreConstraintViolation,
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("cannot derive identity from document name {0:?}")]
    InvalidDocumentName(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
    #[error("engine: {0}")]
    Engine(EngineError),
    #[error("store: {0}")]
    Store(StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation(_) => PipelineError::StoreConstraintViolation,
            other => PipelineError::Store(other),
        }
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Engine(other),
        }
    }
}

impl PipelineError {
    /// Faults that are not part of the classified outcome space.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            PipelineError::Engine(_)
                | PipelineError::Store(_)
                | PipelineError::Io(_)
                | PipelineError::Join(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::IdentityKey;

    #[test]
    fn test_constraint_violation_is_elevated() {
        let err: PipelineError = StoreError::ConstraintViolation(IdentityKey::new("a", "b")).into();
        assert!(matches!(err, PipelineError::StoreConstraintViolation));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_engine_cancellation_is_not_internal() {
        let err: PipelineError = EngineError::Cancelled.into();
        assert!(matches!(err, PipelineError::Cancelled));
        let err: PipelineError = EngineError::ChannelClosed.into();
        assert!(err.is_internal());
    }

    #[test]
    fn test_other_store_errors_are_internal() {
        let err: PipelineError = StoreError::Poisoned.into();
        assert!(err.is_internal());
    }
}
