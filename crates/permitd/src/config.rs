use crate::engine::EngineSettings;
use std::path::PathBuf;

const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// Well-known places an OpenCV install drops its Haar cascades.
const CASCADE_SEARCH_DIRS: &[&str] = &[
    "models",
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/local/share/opencv/haarcascades",
    "/opt/homebrew/share/opencv4/haarcascades",
];

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address (default: 0.0.0.0:8000).
    pub bind_addr: String,
    /// Directory holding one model file per identity.
    pub database_dir: PathBuf,
    /// Explicit Haar cascade path; searched for when unset.
    pub cascade_path: Option<PathBuf>,
    /// Minimum confidence (0–100) that yields a passcode.
    pub confidence_threshold: i32,
    /// Distance that maps to zero confidence.
    pub distance_scale: f64,
    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `PERMIT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = EngineSettings::default();
        Self {
            bind_addr: std::env::var("PERMIT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            database_dir: std::env::var("PERMIT_DATABASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("database")),
            cascade_path: std::env::var("PERMIT_CASCADE_PATH").ok().map(PathBuf::from),
            confidence_threshold: env_i32("PERMIT_CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            distance_scale: env_f64("PERMIT_DISTANCE_SCALE", defaults.distance_scale),
            max_body_bytes: env_usize("PERMIT_MAX_BODY_BYTES", 64 * 1024 * 1024),
        }
    }

    /// Resolve the cascade file: the explicit path if set, else the first hit
    /// in the search list.
    pub fn resolve_cascade_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cascade_path {
            return Some(path.clone());
        }
        CASCADE_SEARCH_DIRS
            .iter()
            .map(|dir| PathBuf::from(dir).join(CASCADE_FILE))
            .find(|p| p.is_file())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            confidence_threshold: self.confidence_threshold,
            distance_scale: self.distance_scale,
            ..EngineSettings::default()
        }
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
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
