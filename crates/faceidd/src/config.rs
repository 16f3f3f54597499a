use faceid_core::{CameraConstraints, CaptureSettings, DEFAULT_MATCH_THRESHOLD};
use std::path::PathBuf;
use std::time::Duration;

/// Which frame source the engine opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraBackend {
    /// V4L2 device at `camera.device`.
    V4l2,
    /// Directory of still images at `camera.device`.
    Stills,
}

/// Enrollment/login backend settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token sent with every request, if set.
    pub token: Option<String>,
    pub timeout_secs: u64,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub camera_backend: CameraBackend,
    pub camera: CameraConstraints,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Upper bound for a single model load attempt.
    pub model_load_timeout: Duration,
    pub capture: CaptureSettings,
    /// Frontal samples taken per login.
    pub login_attempts: usize,
    /// Euclidean distance cutoff for local candidate selection.
    pub match_threshold: f32,
    /// How long a camera kept after an unusable capture stays open awaiting a retry.
    pub retry_window: Duration,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from `FACEID_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEID_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| faceid_core::default_model_dir());

        let camera_backend = match std::env::var("FACEID_CAMERA_BACKEND").as_deref() {
            Ok("stills") => CameraBackend::Stills,
            _ => CameraBackend::V4l2,
        };

        let defaults = CaptureSettings::default();

        Self {
            camera_backend,
            camera: CameraConstraints {
                device: std::env::var("FACEID_CAMERA_DEVICE")
                    .unwrap_or_else(|_| "/dev/video0".to_string()),
                width: env_u32("FACEID_CAMERA_WIDTH", 640),
                height: env_u32("FACEID_CAMERA_HEIGHT", 480),
                warmup_frames: env_usize("FACEID_WARMUP_FRAMES", 4),
            },
            model_dir,
            model_load_timeout: Duration::from_secs(env_u64("FACEID_MODEL_LOAD_TIMEOUT_SECS", 30)),
            capture: CaptureSettings {
                attempts_per_pose: env_usize(
                    "FACEID_ATTEMPTS_PER_POSE",
                    defaults.attempts_per_pose,
                ),
                settle_delay: env_millis("FACEID_SETTLE_DELAY_MS", defaults.settle_delay),
                attempt_interval: env_millis(
                    "FACEID_ATTEMPT_INTERVAL_MS",
                    defaults.attempt_interval,
                ),
                min_confidence: env_f32("FACEID_MIN_CONFIDENCE", defaults.min_confidence),
            },
            login_attempts: env_usize("FACEID_LOGIN_ATTEMPTS", 3),
            match_threshold: env_f32("FACEID_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            retry_window: Duration::from_secs(env_u64("FACEID_RETRY_WINDOW_SECS", 30)),
            session_bus: std::env::var("FACEID_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
            api: ApiConfig {
                base_url: std::env::var("FACEID_API_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8080/api".to_string()),
                token: std::env::var("FACEID_API_TOKEN").ok().filter(|t| !t.is_empty()),
                timeout_secs: env_u64("FACEID_API_TIMEOUT_SECS", 10),
            },
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
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

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
