//! Classical cascade face detector over integral images.
//!
//! Implements a Viola-Jones style boosted cascade: rectangle features are
//! evaluated in O(1) via summed-area tables, a detection window is slid over
//! the image at a geometric series of scales, and raw hits are merged by
//! neighbor voting. Stage data is loaded from a JSON cascade file.

use crate::types::FaceBox;
use image::{DynamicImage, GenericImageView, GrayImage};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f32 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 3;
const DEFAULT_MIN_FACE_SIZE: u32 = 80;
/// Window step per scale, as a fraction of the scaled window width.
const SCAN_STEP_RATIO: f32 = 0.05;
/// Relative position tolerance when merging raw detection windows.
const GROUP_EPS: f32 = 0.2;
/// Lower bound on window variance; flat regions would otherwise divide by ~0.
const VARIANCE_FLOOR: f32 = 1.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}, place a frontal-face cascade JSON in the model dir")]
    ModelNotFound(String),
    #[error("cascade read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
    #[error("invalid detector params: {0}")]
    InvalidParams(String),
    #[error("no face detected")]
    NoFaceDetected,
}

/// Tunable scan parameters.
///
/// `scale_factor` is the geometric growth of the detection window between
/// scales, `min_neighbors` the merged-window count a cluster needs to be
/// reported (0 disables grouping and returns raw windows), `min_face_size`
/// the smallest window side in pixels that will be scanned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_face_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
        }
    }
}

/// One weighted rectangle of a feature, in base-window coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub weight: f32,
}

/// Decision stump: a weighted rectangle sum, variance-normalized, against a
/// threshold. Contributes `pass_value` or `fail_value` to the stage sum.
#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<FeatureRect>,
    pub threshold: f32,
    pub pass_value: f32,
    pub fail_value: f32,
}

/// One boosted stage. A window whose classifier votes sum below `threshold`
/// is rejected immediately, skipping all later stages.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Cascade model: base detection window plus ordered stages.
///
/// Serialized as JSON:
/// `{"window_width":24,"window_height":24,"stages":[{"threshold":..,"classifiers":[..]}]}`
#[derive(Debug, Clone, Deserialize)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

impl Cascade {
    /// Parse and validate a cascade from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DetectorError> {
        let cascade: Cascade = serde_json::from_slice(bytes)
            .map_err(|e| DetectorError::InvalidCascade(e.to_string()))?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Load a cascade from a JSON file on disk.
    pub fn load(path: &str) -> Result<Self, DetectorError> {
        if !Path::new(path).exists() {
            return Err(DetectorError::ModelNotFound(path.to_string()));
        }
        let bytes = std::fs::read(path)?;
        let cascade = Self::from_json(&bytes)?;
        tracing::info!(
            path,
            stages = cascade.stages.len(),
            window_width = cascade.window_width,
            window_height = cascade.window_height,
            "loaded face cascade"
        );
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), DetectorError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(DetectorError::InvalidCascade(
                "base window must be non-empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(DetectorError::InvalidCascade("no stages".to_string()));
        }
        for (si, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(DetectorError::InvalidCascade(format!(
                    "stage {si} has no classifiers"
                )));
            }
            for (ci, classifier) in stage.classifiers.iter().enumerate() {
                if classifier.rects.is_empty() {
                    return Err(DetectorError::InvalidCascade(format!(
                        "stage {si} classifier {ci} has no rects"
                    )));
                }
                for rect in &classifier.rects {
                    if rect.w == 0
                        || rect.h == 0
                        || rect.x + rect.w > self.window_width
                        || rect.y + rect.h > self.window_height
                    {
                        return Err(DetectorError::InvalidCascade(format!(
                            "stage {si} classifier {ci} rect ({}, {}, {}, {}) outside {}x{} window",
                            rect.x, rect.y, rect.w, rect.h, self.window_width, self.window_height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Cascade-based face detector.
pub struct FaceDetector {
    cascade: Cascade,
    params: DetectorParams,
}

impl FaceDetector {
    /// Build a detector from an already-parsed cascade.
    pub fn new(cascade: Cascade, params: DetectorParams) -> Result<Self, DetectorError> {
        // detect()'s scale pyramid terminates only for a finite factor above
        // 1.0. NaN fails every comparison, so test the accepting range.
        if !(params.scale_factor.is_finite() && params.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be finite and > 1.0, got {}",
                params.scale_factor
            )));
        }
        if params.min_face_size == 0 {
            return Err(DetectorError::InvalidParams(
                "min face size must be at least 1".to_string(),
            ));
        }
        Ok(Self { cascade, params })
    }

    /// Load the cascade JSON from the given path.
    pub fn load(cascade_path: &str, params: DetectorParams) -> Result<Self, DetectorError> {
        let cascade = Cascade::load(cascade_path)?;
        Self::new(cascade, params)
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect faces in a grayscale image.
    ///
    /// Returns every merged face window at least `min_face_size` on a side,
    /// in scan order. The detector does not rank the result; callers pick.
    /// Zero faces is an error by contract.
    pub fn detect(&self, image: &GrayImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = image.dimensions();
        let integral = IntegralImage::build(image);

        let base_side = self.cascade.window_width.min(self.cascade.window_height) as f32;
        let mut scale = (self.params.min_face_size as f32 / base_side).max(1.0);

        let mut raw: Vec<RawRect> = Vec::new();
        loop {
            let scaled = ScaledCascade::from_cascade(&self.cascade, scale);
            if scaled.window_w > width as usize || scaled.window_h > height as usize {
                break;
            }
            let step = ((scaled.window_w as f32 * SCAN_STEP_RATIO).round() as usize).max(2);
            let mut y = 0usize;
            while y + scaled.window_h <= height as usize {
                let mut x = 0usize;
                while x + scaled.window_w <= width as usize {
                    if scaled.eval(&integral, x, y) {
                        raw.push(RawRect {
                            x,
                            y,
                            w: scaled.window_w,
                            h: scaled.window_h,
                        });
                    }
                    x += step;
                }
                y += step;
            }
            scale *= self.params.scale_factor;
        }

        let faces = group_rects(&raw, self.params.min_neighbors, GROUP_EPS);
        tracing::trace!(raw = raw.len(), merged = faces.len(), "cascade scan complete");

        if faces.is_empty() {
            return Err(DetectorError::NoFaceDetected);
        }
        Ok(faces)
    }
}

/// Crop a detected face region out of the source image, clamped to bounds.
pub fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let (iw, ih) = image.dimensions();
    let x = face.x.min(iw.saturating_sub(1));
    let y = face.y.min(ih.saturating_sub(1));
    let w = face.width.min(iw - x).max(1);
    let h = face.height.min(ih - y).max(1);
    image.crop_imm(x, y, w, h)
}

/// Summed-area tables for O(1) rectangle sums and squared sums.
///
/// Tables are (w+1) x (h+1) with a zero border so no edge cases appear in
/// the 4-corner lookup. u64 accumulators cannot overflow for any 8-bit
/// image that fits in memory.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn build(image: &GrayImage) -> Self {
        let w = image.width() as usize;
        let h = image.height() as usize;
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let data = image.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = data[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn rect_sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let tl = table[y * stride + x];
        let tr = table[y * stride + x + w];
        let bl = table[(y + h) * stride + x];
        let br = table[(y + h) * stride + x + w];
        // Grouped so intermediates never underflow.
        (br + tl) - tr - bl
    }
}

/// A cascade with all feature rects pre-scaled to one window size, so the
/// inner scan loop does no per-window arithmetic beyond table lookups.
struct ScaledCascade {
    window_w: usize,
    window_h: usize,
    stages: Vec<ScaledStage>,
}

struct ScaledStage {
    threshold: f32,
    classifiers: Vec<ScaledClassifier>,
}

struct ScaledClassifier {
    rects: Vec<ScaledRect>,
    threshold: f32,
    pass_value: f32,
    fail_value: f32,
}

struct ScaledRect {
    dx: usize,
    dy: usize,
    w: usize,
    h: usize,
    weight: f32,
    inv_area: f32,
}

impl ScaledCascade {
    fn from_cascade(cascade: &Cascade, scale: f32) -> Self {
        let window_w = (cascade.window_width as f32 * scale).round() as usize;
        let window_h = (cascade.window_height as f32 * scale).round() as usize;

        let stages = cascade
            .stages
            .iter()
            .map(|stage| ScaledStage {
                threshold: stage.threshold,
                classifiers: stage
                    .classifiers
                    .iter()
                    .map(|c| ScaledClassifier {
                        threshold: c.threshold,
                        pass_value: c.pass_value,
                        fail_value: c.fail_value,
                        rects: c
                            .rects
                            .iter()
                            .map(|r| {
                                // Rounding may push a rect 1px past the window;
                                // clamp so lookups stay inside the table.
                                let dx = ((r.x as f32 * scale).round() as usize)
                                    .min(window_w.saturating_sub(1));
                                let dy = ((r.y as f32 * scale).round() as usize)
                                    .min(window_h.saturating_sub(1));
                                let w = (((r.w as f32 * scale).round() as usize).max(1))
                                    .min(window_w - dx);
                                let h = (((r.h as f32 * scale).round() as usize).max(1))
                                    .min(window_h - dy);
                                ScaledRect {
                                    dx,
                                    dy,
                                    w,
                                    h,
                                    weight: r.weight,
                                    inv_area: 1.0 / (w * h) as f32,
                                }
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Self { window_w, window_h, stages }
    }

    /// Evaluate all stages for the window at (x, y).
    ///
    /// Features are mean intensities of their rects, weighted and summed,
    /// then divided by the window standard deviation for lighting
    /// invariance. The first failed stage rejects the window.
    fn eval(&self, integral: &IntegralImage, x: usize, y: usize) -> bool {
        let area = (self.window_w * self.window_h) as f32;
        let total = integral.rect_sum(x, y, self.window_w, self.window_h) as f32;
        let total_sq = integral.rect_sq_sum(x, y, self.window_w, self.window_h) as f32;
        let mean = total / area;
        let variance = total_sq / area - mean * mean;
        let std_dev = variance.max(VARIANCE_FLOOR).sqrt();

        for stage in &self.stages {
            let mut stage_sum = 0.0f32;
            for classifier in &stage.classifiers {
                let mut feature = 0.0f32;
                for rect in &classifier.rects {
                    let sum = integral.rect_sum(x + rect.dx, y + rect.dy, rect.w, rect.h) as f32;
                    feature += rect.weight * sum * rect.inv_area;
                }
                stage_sum += if feature / std_dev >= classifier.threshold {
                    classifier.pass_value
                } else {
                    classifier.fail_value
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct RawRect {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
}

/// Merge raw detection windows into face boxes by neighbor voting.
///
/// Windows are partitioned into equivalence classes under the transitive
/// closure of [`similar`], each class is averaged into one box, and classes
/// with fewer than `min_neighbors` members are dropped. `min_neighbors == 0`
/// returns the raw windows unmerged.
fn group_rects(raw: &[RawRect], min_neighbors: u32, eps: f32) -> Vec<FaceBox> {
    if raw.is_empty() {
        return Vec::new();
    }
    if min_neighbors == 0 {
        return raw
            .iter()
            .map(|r| FaceBox {
                x: r.x as u32,
                y: r.y as u32,
                width: r.w as u32,
                height: r.h as u32,
                neighbors: 1,
            })
            .collect();
    }

    // Union-find with path compression over pairwise similarity.
    let mut parent: Vec<usize> = (0..raw.len()).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..raw.len() {
        for j in (i + 1)..raw.len() {
            if similar(&raw[i], &raw[j], eps) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Accumulate classes in first-member order to keep output deterministic.
    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<(u64, u64, u64, u64, u32)> = Vec::new();
    for i in 0..raw.len() {
        let root = find(&mut parent, i);
        let slot = *slots.entry(root).or_insert_with(|| {
            clusters.push((0, 0, 0, 0, 0));
            clusters.len() - 1
        });
        let c = &mut clusters[slot];
        c.0 += raw[i].x as u64;
        c.1 += raw[i].y as u64;
        c.2 += raw[i].w as u64;
        c.3 += raw[i].h as u64;
        c.4 += 1;
    }

    clusters
        .iter()
        .filter(|c| c.4 >= min_neighbors)
        .map(|&(sx, sy, sw, sh, count)| {
            let n = count as f32;
            FaceBox {
                x: (sx as f32 / n).round() as u32,
                y: (sy as f32 / n).round() as u32,
                width: (sw as f32 / n).round() as u32,
                height: (sh as f32 / n).round() as u32,
                neighbors: count,
            }
        })
        .collect()
}

/// Whether two raw windows are close enough in position and size to be
/// votes for the same face.
fn similar(a: &RawRect, b: &RawRect, eps: f32) -> bool {
    let delta = eps * 0.5 * (a.w.min(b.w) + a.h.min(b.h)) as f32;
    let near = |p: usize, q: usize| (p as f32 - q as f32).abs() <= delta;
    near(a.x, b.x)
        && near(a.y, b.y)
        && near(a.x + a.w, b.x + b.w)
        && near(a.y + a.h, b.y + b.h)
}
