//! Embedding extraction adapter.
//!
//! Maps a face crop to a fixed-length, L2-normalised vector. Preprocessing
//! (resize, centre crop, ImageNet channel normalisation) belongs to the
//! adapter: callers pass the raw crop.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Extractor capability. Deterministic for fixed weights and input.
pub trait EmbeddingExtractor: Send {
    /// Output dimensionality fixed by the wrapped model.
    fn dimension(&self) -> usize;

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError>;
}

/// FaceNet-style embedding model via ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    dimension: usize,
    model_version: String,
}

impl OnnxEmbedder {
    /// Load the embedding model; `dimension` is the contract every output is checked against.
    pub fn load(model_path: &Path, dimension: usize) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            dimension,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            session,
            dimension,
            model_version,
        })
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError> {
        let input = preprocess(face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.dimension {
            return Err(ExtractorError::DimensionMismatch {
                expected: self.dimension,
                actual: raw.len(),
            });
        }

        Ok(Embedding {
            values: l2_normalize(raw.to_vec()),
            model_version: Some(self.model_version.clone()),
        })
    }
}

pub fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|x| x / norm).collect()
    } else {
        values
    }
}

/// Resize the shortest side to 224, centre crop 224×224, normalise to NCHW.
fn preprocess(face: &RgbImage) -> Result<Array4<f32>, ExtractorError> {
    let (w, h) = face.dimensions();
    if w == 0 || h == 0 {
        return Err(ExtractorError::EmptyCrop);
    }

    let target = EMBEDDER_INPUT_SIZE;
    let (rw, rh) = if w <= h {
        (target, ((h as f32 * target as f32 / w as f32).round() as u32).max(target))
    } else {
        (((w as f32 * target as f32 / h as f32).round() as u32).max(target), target)
    };
    let resized = image::imageops::resize(face, rw, rh, FilterType::Triangle);
    let cropped =
        image::imageops::crop_imm(&resized, (rw - target) / 2, (rh - target) / 2, target, target)
            .to_image();

    let size = target as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    Ok(tensor)
}
