//! End-to-end match pipeline: decode, detect, crop, embed, look up, decide.

use crate::detector::{self, DetectorError, FaceDetector};
use crate::encoder::{EncoderError, ImageEncoder};
use crate::index::{IndexError, Neighbor, SimilarityIndex};
use crate::types::{Embedding, FaceBox, MatchPolicy, MatchResult};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Decode an image from raw bytes (PNG, JPEG, and friends).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, MatchError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Deterministic pick among detected faces: largest area wins, earlier scan
/// order breaks ties.
pub fn select_primary(faces: &[FaceBox]) -> Option<&FaceBox> {
    let mut best: Option<&FaceBox> = None;
    for face in faces {
        let larger = match best {
            None => true,
            Some(b) => face.area() > b.area(),
        };
        if larger {
            best = Some(face);
        }
    }
    best
}

/// Threshold decision on a nearest-neighbor result.
pub fn decide(nearest: Option<Neighbor>, policy: &MatchPolicy) -> MatchResult {
    match nearest {
        Some(n) if policy.accepts(n.distance) => MatchResult::Matched {
            student_id: n.student_id,
            distance: n.distance,
        },
        _ => MatchResult::NoMatch,
    }
}

/// One face pipeline for both enrollment and matching.
///
/// Stages run strictly in order: detect, select, crop, embed, then (for a
/// match attempt) look up and decide. The first failing stage aborts the
/// attempt with its typed error; later stages never run. The pipeline only
/// reads; recording an accepted match is the caller's job.
pub struct FacePipeline<E> {
    detector: FaceDetector,
    encoder: E,
    policy: MatchPolicy,
}

impl<E: ImageEncoder> FacePipeline<E> {
    pub fn new(detector: FaceDetector, encoder: E, policy: MatchPolicy) -> Self {
        Self { detector, encoder, policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Detect the primary face and embed its crop.
    ///
    /// Shared front half of the pipeline: registration stores the result,
    /// a match attempt carries it to the index.
    pub fn embed_primary_face(
        &mut self,
        image: &DynamicImage,
    ) -> Result<(FaceBox, Embedding), MatchError> {
        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray)?;
        // detect() never returns an empty list.
        let face = *select_primary(&faces).ok_or(DetectorError::NoFaceDetected)?;
        tracing::debug!(
            candidates = faces.len(),
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            "selected primary face"
        );
        let crop = detector::crop_face(image, &face);
        let embedding = self.encoder.embed(&crop)?;
        Ok((face, embedding))
    }

    /// Full match attempt from encoded image bytes.
    pub fn match_bytes(
        &mut self,
        bytes: &[u8],
        index: &dyn SimilarityIndex,
    ) -> Result<MatchResult, MatchError> {
        let image = decode_image(bytes)?;
        self.match_image(&image, index)
    }

    /// Full match attempt from a decoded image.
    pub fn match_image(
        &mut self,
        image: &DynamicImage,
        index: &dyn SimilarityIndex,
    ) -> Result<MatchResult, MatchError> {
        let (_, probe) = self.embed_primary_face(image)?;
        let nearest = index.nearest(&probe)?;
        if let Some(n) = &nearest {
            tracing::debug!(
                student_id = n.student_id,
                distance = n.distance,
                threshold = self.policy.threshold,
                "nearest enrollment"
            );
        }
        Ok(decide(nearest, &self.policy))
    }
}
