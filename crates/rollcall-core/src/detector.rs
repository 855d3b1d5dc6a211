//! Face detection adapter.
//!
//! [`OnnxFaceDetector`] runs SCRFD for face boxes (three strides, anchor-free
//! decode, NMS) and, when a landmark model is configured, a 68-point landmark
//! regressor on every box crop. Any [`FaceDetector`] implementation can stand
//! in for it; zero detections is a normal result.

use crate::types::{BoundingBox, FaceDetection, FaceLandmarks};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.45;
const SCRFD_NMS_THRESHOLD: f32 = 0.5;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const LANDMARK_INPUT_SIZE: u32 = 112;
const LANDMARK_POINTS: usize = 68;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detector capability: boxes with confidences and optional landmarks,
/// sorted by confidence (highest first).
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded box before landmarks are attached.
#[derive(Debug, Clone)]
struct RawBox {
    bbox: BoundingBox,
    confidence: f32,
}

fn load_session(model_path: &Path) -> Result<Session, DetectorError> {
    if !model_path.exists() {
        return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
    }
    Ok(Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?)
}

/// SCRFD box detector plus optional 68-point landmark stage.
pub struct OnnxFaceDetector {
    scrfd: Session,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    stride_indices: [(usize, usize); 3],
    landmarks: Option<LandmarkModel>,
}

impl OnnxFaceDetector {
    /// Load the SCRFD model and, if given, the landmark model.
    pub fn load(scrfd_path: &Path, landmark_path: Option<&Path>) -> Result<Self, DetectorError> {
        let scrfd = load_session(scrfd_path)?;
        let output_names: Vec<String> =
            scrfd.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %scrfd_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let landmarks = landmark_path.map(LandmarkModel::load).transpose()?;
        if landmarks.is_none() {
            tracing::warn!("no landmark model configured; liveness verdicts will be unavailable");
        }

        Ok(Self {
            stride_indices: discover_output_indices(&output_names),
            scrfd,
            landmarks,
        })
    }

    fn detect_boxes(&mut self, image: &RgbImage) -> Result<Vec<RawBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.scrfd.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            all.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        let boxes = self.detect_boxes(image)?;
        let mut detections = Vec::with_capacity(boxes.len());
        for raw in boxes {
            let landmarks = match self.landmarks.as_mut() {
                Some(model) => model.predict(image, &raw.bbox)?,
                None => None,
            };
            detections.push(FaceDetection {
                bbox: raw.bbox,
                confidence: raw.confidence,
                landmarks,
            });
        }
        tracing::debug!(faces = detections.len(), "detection complete");
        Ok(detections)
    }
}

/// 68-point landmark regressor over a square face crop.
///
/// Expects a 1×3×112×112 RGB input scaled to [0, 1] and emits 136 values,
/// x/y pairs normalised to the crop.
pub struct LandmarkModel {
    session: Session,
}

impl LandmarkModel {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        let session = load_session(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded landmark model");
        Ok(Self { session })
    }

    fn predict(
        &mut self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<Option<FaceLandmarks>, DetectorError> {
        let Some((x, y, w, h)) = bbox.clip_to(image.width(), image.height()) else {
            return Ok(None);
        };
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let resized = image::imageops::resize(
            &crop,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
            FilterType::Triangle,
        );

        let size = LANDMARK_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (px, py, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, py as usize, px as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;

        if raw.len() < LANDMARK_POINTS * 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_POINTS * 2,
                raw.len()
            )));
        }

        let points = raw[..LANDMARK_POINTS * 2]
            .chunks_exact(2)
            .map(|p| (x as f32 + p[0] * w as f32, y as f32 + p[1] * h as f32))
            .collect();
        Ok(Some(FaceLandmarks::new(points)))
    }
}

/// Letterbox an RGB image into the SCRFD NCHW input tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding is left at zero, which is SCRFD_MEAN after normalisation.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let off_x = pad_x.floor() as usize;
    let off_y = pad_y.floor() as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, off_y + y as usize, off_x + x as usize]] =
                (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map output tensors to strides by name (`score_8`, `bbox_8`, ...), falling
/// back to the standard positional layout `[scores 8/16/32, bboxes 8/16/32, ...]`.
fn discover_output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[i] = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode detections for a single stride level into source image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..grid_h * grid_w * SCRFD_ANCHORS_PER_CELL {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let x1 = (anchor_x - offsets[0] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_y - offsets[1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_x + offsets[2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_y + offsets[3] * s - letterbox.pad_y) / letterbox.scale;

        out.push(RawBox {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score,
        });
    }
    out
}

/// Non-maximum suppression; the result is sorted by confidence, highest first.
fn nms(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
