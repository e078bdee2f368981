//! classlens-core - face matching pipeline for attendance tracking.
//!
//! A cascade detector localizes faces, a CLIP ViT-B/32 encoder (via ONNX
//! Runtime) turns crops into 512-dim unit vectors, and a similarity index
//! answers nearest-enrollment queries under a single metric + threshold
//! policy.

use std::path::PathBuf;

pub mod detector;
pub mod encoder;
pub mod index;
pub mod matcher;
pub mod types;

pub use detector::{Cascade, DetectorError, DetectorParams, FaceDetector};
pub use encoder::{ClipEncoder, EncoderError, ImageEncoder};
pub use index::{IndexError, MemoryIndex, Neighbor, SimilarityIndex};
pub use matcher::{FacePipeline, MatchError};
pub use types::{DistanceMetric, Embedding, FaceBox, MatchPolicy, MatchResult};

/// System-wide default location for model artifacts (cascade JSON, CLIP ONNX).
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/classlens/models")
}
