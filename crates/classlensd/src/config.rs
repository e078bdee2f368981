use classlens_core::types::{DistanceMetric, MatchPolicy};
use classlens_core::DetectorParams;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory for the database and saved enrollment photos.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the cascade JSON and the ONNX encoder model.
    pub model_dir: PathBuf,
    /// Distance metric and acceptance threshold, always set as a pair.
    pub policy: MatchPolicy,
    /// Face detector scan parameters.
    pub detector: DetectorParams,
    /// Timeout in seconds for one register or mark operation.
    pub decision_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `CLASSLENS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("CLASSLENS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| classlens_core::default_model_dir());

        let data_dir = std::env::var("CLASSLENS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("classlens")
            });

        let db_path = std::env::var("CLASSLENS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("classlens.db"));

        let metric = std::env::var("CLASSLENS_DISTANCE_METRIC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DistanceMetric::Cosine);
        // The threshold default follows the metric; an explicit override
        // applies to the configured metric only.
        let policy = match std::env::var("CLASSLENS_MATCH_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|v| v.is_finite())
        {
            Some(threshold) => MatchPolicy::new(metric, threshold),
            None => MatchPolicy::for_metric(metric),
        };

        let detector_defaults = DetectorParams::default();

        Self {
            data_dir,
            db_path,
            model_dir,
            policy,
            detector: DetectorParams {
                scale_factor: env_f32("CLASSLENS_SCALE_FACTOR", detector_defaults.scale_factor),
                min_neighbors: env_u32("CLASSLENS_MIN_NEIGHBORS", detector_defaults.min_neighbors),
                min_face_size: env_u32("CLASSLENS_MIN_FACE_SIZE", detector_defaults.min_face_size),
            },
            decision_timeout_secs: env_u64("CLASSLENS_DECISION_TIMEOUT_SECS", 10),
        }
    }

    /// Path to the frontal-face cascade description.
    pub fn cascade_path(&self) -> String {
        self.model_dir
            .join("frontal_face_cascade.json")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the CLIP visual encoder model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join("clip_vitb32_visual.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Directory where enrollment photos are kept.
    pub fn passports_dir(&self) -> PathBuf {
        self.data_dir.join("passports")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
