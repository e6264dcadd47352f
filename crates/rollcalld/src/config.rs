use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MATCH_THRESHOLD: f32 = 0.92;
const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 1920;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LABEL_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database holding embeddings and attendance.
    pub db_path: PathBuf,
    /// Root directory for annotated group photos.
    pub annotated_dir: PathBuf,
    /// Font used to write identities on annotated photos. Empty disables labels.
    pub label_font: PathBuf,
    /// Maximum L2 distance for a positive match (exclusive).
    pub match_threshold: f32,
    /// Input images are downscaled so neither side exceeds this.
    pub max_image_dimension: u32,
    /// Number of inference worker threads (each owns one model pair).
    pub workers: usize,
    /// Bound on the detection stage and on the embedding stage.
    pub stage_timeout: Duration,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

/// On-disk TOML form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    annotated_dir: Option<PathBuf>,
    label_font: Option<PathBuf>,
    match_threshold: Option<f32>,
    max_image_dimension: Option<u32>,
    workers: Option<usize>,
    stage_timeout_secs: Option<u64>,
    session_bus: Option<bool>,
}

impl Config {
    /// Load from the TOML file named by `ROLLCALL_CONFIG` (if set), then
    /// apply `ROLLCALL_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let config = Self {
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("rollcall.db")),
            annotated_dir: env("ROLLCALL_ANNOTATED_DIR")
                .map(PathBuf::from)
                .or(file.annotated_dir)
                .unwrap_or_else(|| data_dir.join("annotated")),
            label_font: env("ROLLCALL_LABEL_FONT")
                .map(PathBuf::from)
                .or(file.label_font)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LABEL_FONT)),
            match_threshold: parse_env(&env, "ROLLCALL_MATCH_THRESHOLD")?
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            max_image_dimension: parse_env(&env, "ROLLCALL_MAX_IMAGE_DIMENSION")?
                .or(file.max_image_dimension)
                .unwrap_or(DEFAULT_MAX_IMAGE_DIMENSION),
            workers: parse_env(&env, "ROLLCALL_WORKERS")?
                .or(file.workers)
                .unwrap_or(DEFAULT_WORKERS),
            stage_timeout: Duration::from_secs(
                parse_env(&env, "ROLLCALL_STAGE_TIMEOUT_SECS")?
                    .or(file.stage_timeout_secs)
                    .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
            ),
            session_bus: env("ROLLCALL_SESSION_BUS")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.session_bus)
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("must be a positive number, got {}", self.match_threshold),
            });
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid {
                key: "max_image_dimension",
                reason: "must be at least 1".into(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.stage_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "stage_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("cannot parse {raw:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_from(&[("HOME", "/home/t")])).unwrap();
        assert_eq!(config.match_threshold, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.db_path, PathBuf::from("/home/t/.local/share/rollcall/rollcall.db"));
        assert!(config.arcface_model_path().ends_with("models/w600k_r50.onnx"));
        assert!(!config.session_bus);
        assert_eq!(config.label_font, PathBuf::from(DEFAULT_LABEL_FONT));
    }

    #[test]
    fn test_label_font_can_be_disabled() {
        let config = Config::resolve(FileConfig::default(), env_from(&[("ROLLCALL_LABEL_FONT", "")])).unwrap();
        assert_eq!(config.label_font, PathBuf::new());
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            match_threshold = 0.8
            workers = 4
            db_path = "/var/lib/rollcall/file.db"
            "#,
        )
        .unwrap();
        let env = env_from(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.7"),
            ("ROLLCALL_SESSION_BUS", "1"),
        ]);
        let config = Config::resolve(file, env).unwrap();
        assert_eq!(config.match_threshold, 0.7);
        assert_eq!(config.workers, 4);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/file.db"));
        assert_eq!(config.annotated_dir, PathBuf::from("/data/rollcall/annotated"));
        assert!(config.session_bus);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            ("ROLLCALL_MATCH_THRESHOLD", "0"),
            ("ROLLCALL_MATCH_THRESHOLD", "NaN"),
            ("ROLLCALL_WORKERS", "0"),
            ("ROLLCALL_WORKERS", "many"),
            ("ROLLCALL_MAX_IMAGE_DIMENSION", "0"),
        ];
        for (key, value) in bad {
            let result = Config::resolve(FileConfig::default(), env_from(&[(key, value)]));
            assert!(matches!(result, Err(ConfigError::Invalid { .. })), "{key}={value}");
        }
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("threshold = 0.5").is_err());
    }
}
