use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned rectangle for a detected face, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw detection windows merged into this box.
    pub neighbors: u32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Face embedding vector (512-dimensional for CLIP ViT-B/32).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "clip-vit-b-32").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// Distance metric for comparing embeddings.
///
/// Every component that measures distance takes the metric from the active
/// [`MatchPolicy`], so the primary index, the fallback scan and the in-memory
/// index can never disagree on what "nearest" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine distance: 1 - cos(a, b), in [0, 2]. Lower = more similar.
    Cosine,
    /// Euclidean (L2) distance, in [0, inf). Lower = more similar.
    L2,
}

impl DistanceMetric {
    /// Compute the distance between two vectors under this metric.
    ///
    /// Mismatched dimensions yield infinity so a malformed entry can never
    /// win a nearest-neighbor scan. Uses constant-time computation: always
    /// processes all dimensions.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            DistanceMetric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (x, y) in a.iter().zip(b.iter()) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                let denom = norm_a.sqrt() * norm_b.sqrt();
                // A zero vector has no direction; treat it as maximally
                // dissimilar rather than dividing by zero.
                if denom > 0.0 { 1.0 - dot / denom } else { 1.0 }
            }
            DistanceMetric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Default acceptance threshold paired with this metric.
    ///
    /// Thresholds are not interchangeable between metrics: 0.35 cosine
    /// distance corresponds to roughly 0.85 Euclidean distance on
    /// unit-normalized vectors (d_l2 = sqrt(2 * d_cos)).
    pub fn default_threshold(&self) -> f32 {
        match self {
            DistanceMetric::Cosine => 0.35,
            DistanceMetric::L2 => 0.85,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" | "cos" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// The single metric + threshold pair used by every matching path.
///
/// Metric and threshold travel together: constructing a policy from a metric
/// picks the paired threshold, so a cosine threshold can never be applied to
/// L2 distances or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub metric: DistanceMetric,
    pub threshold: f32,
}

impl MatchPolicy {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Policy with the default threshold for the given metric.
    pub fn for_metric(metric: DistanceMetric) -> Self {
        Self { metric, threshold: metric.default_threshold() }
    }

    /// Whether a nearest-neighbor distance is close enough to accept.
    pub fn accepts(&self, distance: f32) -> bool {
        distance <= self.threshold
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::for_metric(DistanceMetric::Cosine)
    }
}

/// Outcome of a match attempt against the enrollment set.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// No enrollment within the acceptance threshold (or none enrolled).
    NoMatch,
    /// Best enrollment within the threshold.
    Matched { student_id: i64, distance: f32 },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance_identical() {
        let a = [1.0, 0.0, 0.0];
        assert!(DistanceMetric::Cosine.distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = [0.0, 0.0];
        let b = [1.0, 0.0];
        assert_eq!(DistanceMetric::Cosine.distance(&a, &b), 1.0);
    }

    #[test]
    fn test_l2_distance() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((DistanceMetric::L2.distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch_never_wins() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        assert_eq!(DistanceMetric::Cosine.distance(&a, &b), f32::INFINITY);
        assert_eq!(DistanceMetric::L2.distance(&a, &b), f32::INFINITY);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert!("hamming".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_policy_pairs_threshold_with_metric() {
        let cosine = MatchPolicy::for_metric(DistanceMetric::Cosine);
        let l2 = MatchPolicy::for_metric(DistanceMetric::L2);
        assert_eq!(cosine.threshold, 0.35);
        assert_eq!(l2.threshold, 0.85);
    }

    #[test]
    fn test_policy_accepts_boundary_inclusive() {
        let policy = MatchPolicy::new(DistanceMetric::Cosine, 0.35);
        assert!(policy.accepts(0.35));
        assert!(policy.accepts(0.0));
        assert!(!policy.accepts(0.350001));
    }

    #[test]
    fn test_face_box_area() {
        let face = FaceBox { x: 10, y: 20, width: 100, height: 120, neighbors: 5 };
        assert_eq!(face.area(), 12_000);
    }
}
