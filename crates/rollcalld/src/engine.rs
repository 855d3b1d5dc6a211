//! Bounded inference pool.
//!
//! Model inference blocks, so each worker is a dedicated OS thread owning its
//! own detector and extractor sessions. Async callers reach a worker through a
//! bounded channel and wait on a oneshot reply; requests are spread
//! round-robin. A cancelled caller stops waiting at once; the worker finishes
//! the request and drops the reply.

use crate::config::Config;
use image::RgbImage;
use rollcall_core::{
    DetectorError, Embedding, EmbeddingExtractor, ExtractorError, FaceDetection, FaceDetector,
    OnnxEmbedder, OnnxFaceDetector,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const WORKER_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("failed to spawn inference worker: {0}")]
    Spawn(std::io::Error),
    #[error("engine has no workers")]
    NoWorkers,
    #[error("request cancelled")]
    Cancelled,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One worker's models.
pub struct ModelSet {
    pub detector: Box<dyn FaceDetector>,
    pub extractor: Box<dyn EmbeddingExtractor>,
}

impl ModelSet {
    /// Load the configured ONNX models.
    pub fn load(config: &Config) -> Result<Self, EngineError> {
        let landmark_path = config.landmark_model_path();
        let detector =
            OnnxFaceDetector::load(&config.detector_model_path(), landmark_path.as_deref())?;
        let extractor = OnnxEmbedder::load(&config.embedding_model_path(), config.embedding_dim)?;
        Ok(Self {
            detector: Box::new(detector),
            extractor: Box::new(extractor),
        })
    }
}

/// Messages sent from async handlers to an inference worker.
enum EngineRequest {
    Detect {
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<Vec<FaceDetection>, EngineError>>,
    },
    Embed {
        face: RgbImage,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the inference workers.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<Vec<mpsc::Sender<EngineRequest>>>,
    next: Arc<AtomicUsize>,
    dimension: usize,
}

impl EngineHandle {
    /// Embedding dimensionality every worker's extractor is held to.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Detect faces in `image`. Any count, including zero, is a success.
    pub async fn detect(
        &self,
        image: Arc<RgbImage>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FaceDetection>, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }, cancel)
            .await
    }

    /// Extract the embedding of a face crop.
    pub async fn embed(
        &self,
        face: RgbImage,
        cancel: &CancellationToken,
    ) -> Result<Embedding, EngineError> {
        self.call(|reply| EngineRequest::Embed { face, reply }, cancel)
            .await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
        cancel: &CancellationToken,
    ) -> Result<T, EngineError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[slot];
        let (reply_tx, reply_rx) = oneshot::channel();

        let exchange = async {
            worker
                .send(request(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = exchange => result,
        }
    }
}

/// Load `config.inference_workers` model sets and start a worker for each.
///
/// Fails fast at startup if any model is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let model_sets = (0..config.inference_workers)
        .map(|_| ModelSet::load(config))
        .collect::<Result<Vec<_>, _>>()?;
    spawn_workers(model_sets, config.embedding_dim)
}

/// Start one worker thread per model set.
pub fn spawn_workers(
    model_sets: Vec<ModelSet>,
    dimension: usize,
) -> Result<EngineHandle, EngineError> {
    if model_sets.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let mut workers = Vec::with_capacity(model_sets.len());
    for (index, models) in model_sets.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel::<EngineRequest>(WORKER_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name(format!("rollcall-infer-{index}"))
            .spawn(move || run_worker(index, models, dimension, rx))
            .map_err(EngineError::Spawn)?;
        workers.push(tx);
    }

    tracing::info!(workers = workers.len(), dimension, "inference engine started");

    Ok(EngineHandle {
        workers: Arc::new(workers),
        next: Arc::new(AtomicUsize::new(0)),
        dimension,
    })
}

fn run_worker(
    index: usize,
    mut models: ModelSet,
    dimension: usize,
    mut rx: mpsc::Receiver<EngineRequest>,
) {
    tracing::debug!(worker = index, "inference worker started");
    while let Some(req) = rx.blocking_recv() {
        match req {
            EngineRequest::Detect { image, reply } => {
                let result = models.detector.detect(&image).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Embed { face, reply } => {
                let result = models
                    .extractor
                    .embed(&face)
                    .map_err(EngineError::from)
                    .and_then(|embedding| check_dimension(embedding, dimension));
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = index, "inference worker exiting");
}

fn check_dimension(embedding: Embedding, dimension: usize) -> Result<Embedding, EngineError> {
    if embedding.dimension() != dimension {
        return Err(ExtractorError::DimensionMismatch {
            expected: dimension,
            actual: embedding.dimension(),
        }
        .into());
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_engine, face_image, FakeExtractor, FakeDetector};

    #[tokio::test]
    async fn test_detect_and_embed_through_workers() {
        let engine = fake_engine(2);
        let cancel = CancellationToken::new();
        let image = Arc::new(face_image(&[[200, 10, 10]]));

        let faces = engine.detect(image.clone(), &cancel).await.unwrap();
        assert_eq!(faces.len(), 1);

        let crop = RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]));
        let embedding = engine.embed(crop, &cancel).await.unwrap();
        assert_eq!(embedding.dimension(), engine.dimension());
    }

    #[tokio::test]
    async fn test_requests_spread_across_workers() {
        let engine = fake_engine(3);
        let cancel = CancellationToken::new();
        for _ in 0..6 {
            let image = Arc::new(face_image(&[]));
            assert!(engine.detect(image, &cancel).await.unwrap().is_empty());
        }
        assert_eq!(engine.next.load(Ordering::Relaxed), 6);
        assert_eq!(engine.worker_count(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_request_returns_cancelled() {
        let engine = fake_engine(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .detect(Arc::new(face_image(&[[1, 2, 3]])), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_dimension_contract_enforced() {
        let models = ModelSet {
            detector: Box::new(FakeDetector),
            extractor: Box::new(FakeExtractor),
        };
        // FakeExtractor emits 3 values; claim a 4-dim contract.
        let engine = spawn_workers(vec![models], 4).unwrap();
        let err = engine
            .embed(RgbImage::new(4, 4), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Extractor(ExtractorError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_no_workers_rejected() {
        assert!(matches!(spawn_workers(Vec::new(), 3), Err(EngineError::NoWorkers)));
    }
}
