//! rollcall-core: Face identity pipeline primitives.
//!
//! SCRFD face detection with a 68-point landmark stage, eye-aspect-ratio
//! liveness, FaceNet-style embedding extraction (all models via ONNX Runtime)
//! and nearest-neighbour gallery matching.

pub mod detector;
pub mod embedder;
pub mod liveness;
pub mod matcher;
pub mod types;

pub use detector::{DetectorError, FaceDetector, OnnxFaceDetector};
pub use embedder::{EmbeddingExtractor, ExtractorError, OnnxEmbedder};
pub use matcher::{ExactScan, GalleryIndex, IvfIndex, MatchResult, MatcherKind};
pub use types::{
    AttendanceEvent, BoundingBox, Embedding, FaceCandidate, FaceDetection, FaceLandmarks, Group,
    Identity, IdentityKey, DEFAULT_GROUP,
};
