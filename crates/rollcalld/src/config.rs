use crate::attendance::ThrottleKeyMode;
use rollcall_core::MatcherKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatcherSetting {
    ExactScan,
    ApproximateIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD face detector, relative to `model_dir`.
    pub detector_model: String,
    /// 68-point landmark regressor, relative to `model_dir`. Empty disables it.
    pub landmark_model: String,
    /// Embedding model, relative to `model_dir`.
    pub embedding_model: String,
    /// Output length of the embedding model.
    pub embedding_dim: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Parent directory for per-ingestion temporary workspaces.
    pub workspace_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    pub matcher: MatcherSetting,
    pub ivf_lists: usize,
    pub ivf_scan_lists: usize,
    /// Reject faces whose eye aspect ratio fails the liveness check.
    pub enforce_liveness: bool,
    pub liveness_threshold: f32,
    /// Minimum seconds between two accepted attendance marks.
    pub cooldown_secs: u64,
    pub throttle_key: ThrottleKeyMode,
    /// Inference worker threads, each holding its own model sessions.
    pub inference_workers: usize,
    /// Document ingestions allowed to run at once.
    pub max_concurrent_ingestions: usize,
    /// Timeout for each outbound registration call during ingestion.
    pub outbound_timeout_secs: u64,
    /// Timeout for a whole document ingestion.
    pub ingest_timeout_secs: u64,
    /// Remote registration endpoint; unset registers in-process.
    pub registrar_url: Option<String>,
    /// Keep face crops under `<workspace>/debug` while an ingestion runs.
    pub debug_artifacts: bool,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            landmark_model: "landmarks_68.onnx".to_string(),
            embedding_model: "facenet.onnx".to_string(),
            embedding_dim: 128,
            db_path: data_dir.join("rollcall.db"),
            workspace_dir: std::env::temp_dir().join("rollcall"),
            match_threshold: rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD,
            matcher: MatcherSetting::ExactScan,
            ivf_lists: 16,
            ivf_scan_lists: 4,
            enforce_liveness: false,
            liveness_threshold: rollcall_core::liveness::EAR_THRESHOLD,
            cooldown_secs: 3600,
            throttle_key: ThrottleKeyMode::NameAndGroup,
            inference_workers: 2,
            max_concurrent_ingestions: 1,
            outbound_timeout_secs: 10,
            ingest_timeout_secs: 120,
            registrar_url: None,
            debug_artifacts: false,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_WORKSPACE_DIR") {
            self.workspace_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_REGISTRAR_URL") {
            self.registrar_url = (!v.is_empty()).then_some(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_THROTTLE_KEY") {
            match v.as_str() {
                "name-only" => self.throttle_key = ThrottleKeyMode::NameOnly,
                "name-and-group" => self.throttle_key = ThrottleKeyMode::NameAndGroup,
                other => tracing::warn!(value = other, "ignoring unknown ROLLCALL_THROTTLE_KEY"),
            }
        }
        if let Ok(v) = std::env::var("ROLLCALL_MATCHER") {
            match v.as_str() {
                "exact-scan" => self.matcher = MatcherSetting::ExactScan,
                "approximate-index" => self.matcher = MatcherSetting::ApproximateIndex,
                other => tracing::warn!(value = other, "ignoring unknown ROLLCALL_MATCHER"),
            }
        }
        if let Ok(v) = std::env::var("ROLLCALL_BUS") {
            self.bus = if v == "system" { BusKind::System } else { BusKind::Session };
        }
        self.embedding_dim = env_usize("ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.match_threshold = env_f32("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.enforce_liveness = env_bool("ROLLCALL_ENFORCE_LIVENESS", self.enforce_liveness);
        self.cooldown_secs = env_u64("ROLLCALL_COOLDOWN_SECS", self.cooldown_secs);
        self.inference_workers = env_usize("ROLLCALL_INFERENCE_WORKERS", self.inference_workers);
        self.max_concurrent_ingestions =
            env_usize("ROLLCALL_MAX_CONCURRENT_INGESTIONS", self.max_concurrent_ingestions);
        self.outbound_timeout_secs =
            env_u64("ROLLCALL_OUTBOUND_TIMEOUT_SECS", self.outbound_timeout_secs);
        self.ingest_timeout_secs = env_u64("ROLLCALL_INGEST_TIMEOUT_SECS", self.ingest_timeout_secs);
        self.debug_artifacts = env_bool("ROLLCALL_DEBUG_ARTIFACTS", self.debug_artifacts);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        if self.inference_workers == 0 {
            return Err(ConfigError::Invalid("inference_workers must be at least 1".into()));
        }
        if self.max_concurrent_ingestions == 0 {
            return Err(ConfigError::Invalid("max_concurrent_ingestions must be at least 1".into()));
        }
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid("match_threshold must be positive".into()));
        }
        Ok(())
    }

    pub fn matcher_kind(&self) -> MatcherKind {
        match self.matcher {
            MatcherSetting::ExactScan => MatcherKind::ExactScan,
            MatcherSetting::ApproximateIndex => MatcherKind::ApproximateIndex {
                lists: self.ivf_lists,
                scan_lists: self.ivf_scan_lists,
            },
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn landmark_model_path(&self) -> Option<PathBuf> {
        (!self.landmark_model.is_empty()).then(|| self.model_dir.join(&self.landmark_model))
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn outbound_timeout(&self) -> Duration {
        Duration::from_secs(self.outbound_timeout_secs)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
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

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recognition_policy() {
        let config = Config::default();
        assert!((config.match_threshold - 1.3).abs() < 1e-6);
        assert_eq!(config.cooldown_secs, 3600);
        assert!(!config.enforce_liveness);
        assert_eq!(config.throttle_key, ThrottleKeyMode::NameAndGroup);
        assert_eq!(config.max_concurrent_ingestions, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_and_defaults() {
        let config = Config::from_toml(
            r#"
            embedding_dim = 512
            matcher = "approximate-index"
            ivf_lists = 8
            throttle_key = "name-only"
            enforce_liveness = true
            registrar_url = "http://localhost:8000/api/register/pdf"
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(
            config.matcher_kind(),
            MatcherKind::ApproximateIndex { lists: 8, scan_lists: 4 }
        );
        assert_eq!(config.throttle_key, ThrottleKeyMode::NameOnly);
        assert!(config.enforce_liveness);
        assert_eq!(config.cooldown_secs, 3600);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml("cooldown = 5").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config {
            inference_workers: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_landmark_model_can_be_disabled() {
        let config = Config {
            landmark_model: String::new(),
            ..Config::default()
        };
        assert!(config.landmark_model_path().is_none());
        assert!(config.detector_model_path().ends_with("det_10g.onnx"));
    }
}
