use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Group assigned when a registration source carries no group.
pub const DEFAULT_GROUP: &str = "default_group";

// iBUG 68-point layout: right eye 36..42, left eye 42..48 (subject's sides).
const IBUG_POINTS: usize = 68;
const RIGHT_EYE_START: usize = 36;
const LEFT_EYE_START: usize = 42;

/// Axis-aligned face box in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Integer crop rectangle `(x, y, w, h)` clipped to an image of the given size.
    ///
    /// Returns `None` when the clipped box is empty.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// 68-point facial landmarks (iBUG ordering) in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub points: Vec<(f32, f32)>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    /// The six contour points of the subject's left eye, if present.
    pub fn left_eye(&self) -> Option<[(f32, f32); 6]> {
        self.eye(LEFT_EYE_START)
    }

    /// The six contour points of the subject's right eye, if present.
    pub fn right_eye(&self) -> Option<[(f32, f32); 6]> {
        self.eye(RIGHT_EYE_START)
    }

    fn eye(&self, start: usize) -> Option<[(f32, f32); 6]> {
        if self.points.len() < IBUG_POINTS {
            return None;
        }
        let slice = self.points.get(start..start + 6)?;
        let mut eye = [(0.0f32, 0.0f32); 6];
        eye.copy_from_slice(slice);
        Some(eye)
    }
}

/// One detector hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<FaceLandmarks>,
}

/// A detected face prepared for embedding. In-memory only.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub landmarks: Option<FaceLandmarks>,
    pub crop: RgbImage,
    /// `None` when no landmarks were available to judge liveness.
    pub live: Option<bool>,
}

impl FaceCandidate {
    /// Crop `detection` out of `image`. `None` if the box falls outside the image.
    pub fn from_detection(image: &RgbImage, detection: &FaceDetection) -> Option<Self> {
        let (x, y, w, h) = detection.bbox.clip_to(image.width(), image.height())?;
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        Some(Self {
            bbox: detection.bbox,
            landmarks: detection.landmarks.clone(),
            crop,
            live: None,
        })
    }
}

/// Face embedding vector produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (file stem of the ONNX model).
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance `‖self - other‖₂`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` byte encoding used at the store boundary.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode [`to_le_bytes`](Self::to_le_bytes) output. `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// Case-normalised `(name, group)` pair identifying a registered person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub name: String,
    pub group: String,
}

impl IdentityKey {
    /// Trim and lowercase both parts. An empty group becomes [`DEFAULT_GROUP`].
    pub fn new(name: &str, group: &str) -> Self {
        let group = group.trim().to_lowercase();
        Self {
            name: name.trim().to_lowercase(),
            group: if group.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                group
            },
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.name, self.group)
    }
}

/// A registered person with their stored embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub group: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            name: self.name.clone(),
            group: self.group.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
}

/// An attendance mark. The identity is carried by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub name: String,
    pub group: String,
    pub timestamp: DateTime<Utc>,
    pub attended: bool,
}
