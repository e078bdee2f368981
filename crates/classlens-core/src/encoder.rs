//! CLIP image encoder via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from face crops using the visual
//! half of CLIP ViT-B/32, exported to ONNX.

use crate::types::Embedding;
use image::{imageops, DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (CLIP visual preprocessing, not interchangeable) ---
const CLIP_INPUT_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
const CLIP_EMBEDDING_DIM: usize = 512;
const CLIP_MODEL_VERSION: &str = "clip-vit-b-32";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}, export the CLIP ViT-B/32 visual model to ONNX and place it in the model dir")]
    ModelNotFound(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Contract for the embedding stage.
///
/// An encoder maps an image (a face crop, or a whole frame) to a
/// fixed-dimension L2-normalized vector. The rest of the pipeline treats
/// the model as a black box; `dimension()` must match the enrollment
/// store or probes are incomparable.
pub trait ImageEncoder {
    fn dimension(&self) -> usize;
    fn model_version(&self) -> &str;
    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EncoderError>;
}

/// CLIP ViT-B/32 based encoder.
pub struct ClipEncoder {
    session: Session,
}

impl ClipEncoder {
    /// Load the CLIP visual ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded CLIP visual model"
        );

        Ok(Self { session })
    }

    /// Preprocess an image into a NCHW float tensor.
    ///
    /// Standard CLIP visual transform: resize so the short side is 224,
    /// center-crop to 224x224, scale to [0, 1], then normalize with the
    /// CLIP per-channel mean and std.
    fn preprocess(image: &DynamicImage) -> Result<Array4<f32>, EncoderError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(EncoderError::EmbeddingFailed("empty image".to_string()));
        }

        let scale = CLIP_INPUT_SIZE as f32 / width.min(height) as f32;
        let new_w = ((width as f32 * scale).round() as u32).max(CLIP_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).max(CLIP_INPUT_SIZE);

        let rgb: RgbImage = image.to_rgb8();
        let resized = imageops::resize(&rgb, new_w, new_h, imageops::FilterType::Triangle);
        let left = (new_w - CLIP_INPUT_SIZE) / 2;
        let top = (new_h - CLIP_INPUT_SIZE) / 2;
        let crop =
            imageops::crop_imm(&resized, left, top, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE).to_image();

        let size = CLIP_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
        Ok(tensor)
    }
}

impl ImageEncoder for ClipEncoder {
    fn dimension(&self) -> usize {
        CLIP_EMBEDDING_DIM
    }

    fn model_version(&self) -> &str {
        CLIP_MODEL_VERSION
    }

    fn embed(&mut self, image: &DynamicImage) -> Result<Embedding, EncoderError> {
        let input = Self::preprocess(image)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::EmbeddingFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != CLIP_EMBEDDING_DIM {
            return Err(EncoderError::EmbeddingFailed(format!(
                "expected {CLIP_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so cosine distance reduces to a dot product.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 0.0 {
            return Err(EncoderError::EmbeddingFailed("zero-norm embedding".to_string()));
        }

        Ok(Embedding {
            values: raw.iter().map(|x| x / norm).collect(),
            model_version: Some(CLIP_MODEL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let image = DynamicImage::new_rgb8(640, 480);
        let tensor = ClipEncoder::preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_preprocess_upscales_small_crops() {
        // Face crops are often smaller than the model input.
        let image = DynamicImage::new_rgb8(50, 60);
        let tensor = ClipEncoder::preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        // A white image lands at (1.0 - mean) / std, which differs per channel.
        let mut rgb = RgbImage::new(224, 224);
        for pixel in rgb.pixels_mut() {
            *pixel = image::Rgb([255, 255, 255]);
        }
        let tensor = ClipEncoder::preprocess(&DynamicImage::ImageRgb8(rgb)).unwrap();
        for c in 0..3 {
            let expected = (1.0 - CLIP_MEAN[c]) / CLIP_STD[c];
            let got = tensor[[0, c, 100, 100]];
            assert!((got - expected).abs() < 1e-4, "channel {c}: {got} vs {expected}");
        }
        // CLIP statistics are asymmetric across channels.
        assert!(tensor[[0, 0, 0, 0]] != tensor[[0, 2, 0, 0]]);
    }

    #[test]
    fn test_preprocess_center_crops_wide_images() {
        // Left half black, right half white; the 224-wide center crop must
        // straddle the boundary.
        let mut rgb = RgbImage::new(448, 224);
        for (x, _, pixel) in rgb.enumerate_pixels_mut() {
            let v = if x < 224 { 0u8 } else { 255u8 };
            *pixel = image::Rgb([v, v, v]);
        }
        let tensor = ClipEncoder::preprocess(&DynamicImage::ImageRgb8(rgb)).unwrap();
        let dark = tensor[[0, 0, 100, 0]];
        let bright = tensor[[0, 0, 100, 223]];
        assert!(dark < bright, "crop should span the dark/bright boundary");
    }

    #[test]
    fn test_preprocess_rejects_empty_image() {
        let image = DynamicImage::new_rgb8(0, 0);
        match ClipEncoder::preprocess(&image) {
            Err(EncoderError::EmbeddingFailed(_)) => {}
            other => panic!("expected EmbeddingFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_model_file() {
        match ClipEncoder::load("/nonexistent/clip.onnx") {
            Err(EncoderError::ModelNotFound(path)) => assert!(path.contains("nonexistent")),
            other => panic!("expected ModelNotFound, got {:?}", other.err()),
        }
    }
}
