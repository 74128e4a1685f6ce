use faceattend_core::DEFAULT_MATCH_THRESHOLD;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Attendance server base URL (default: http://127.0.0.1:3000).
    pub server_url: String,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Bound on roster fetch and confirmation calls.
    pub request_timeout_secs: u64,
    /// How long to wait for the extractor to load its models.
    pub ready_timeout_secs: u64,
    /// Extractor command line, split on whitespace.
    pub extractor_cmd: String,
    /// Where the login token is kept.
    pub credentials_path: PathBuf,
    /// JPEG quality of photos sent to the extractor (1-100).
    pub jpeg_quality: u8,
}

impl Config {
    /// Load configuration from `FACEATTEND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceattend");

        let credentials_path = std::env::var("FACEATTEND_CREDENTIALS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("credentials.json"));

        Self {
            server_url: std::env::var("FACEATTEND_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            match_threshold: env_f32("FACEATTEND_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            request_timeout_secs: env_u64("FACEATTEND_REQUEST_TIMEOUT_SECS", 30),
            ready_timeout_secs: env_u64("FACEATTEND_READY_TIMEOUT_SECS", 60),
            extractor_cmd: std::env::var("FACEATTEND_EXTRACTOR_CMD")
                .unwrap_or_else(|_| "faceattend-extractor".to_string()),
            credentials_path,
            jpeg_quality: env_u8("FACEATTEND_JPEG_QUALITY", 50).clamp(1, 100),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Extractor program and its arguments. `None` if the command is blank.
    pub fn extractor_command(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.extractor_cmd.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some((program, parts.collect()))
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

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
