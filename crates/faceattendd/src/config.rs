use crate::scheduler::SchedulerConfig;
use faceattend_core::notifications::DEFAULT_NOTIFICATION_CAPACITY;
use faceattend_core::{ReentryPolicy, TrackerConfig};
use faceattend_hw::SecurityContext;
use reqwest::Url;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_RECOGNIZE_PATH: &str = "/attendance/recognize";
const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid API URL {0:?}")]
    InvalidApiUrl(String),
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
}

/// Daemon and CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the attendance service.
    pub api_url: Url,
    /// Path of the recognize endpoint, relative to `api_url`.
    pub recognize_path: String,
    /// Address the API gateway listens on.
    pub listen: SocketAddr,
    pub submit_timeout_secs: u64,
    pub capture_interval_ms: u64,
    pub suppression_secs: u64,
    pub idle_eviction_secs: u64,
    pub notification_ttl_secs: u64,
    /// Camera to run the capture loop on: a `/dev/video*` path, a remote
    /// address, or a saved preset name. No capture loop when unset.
    pub camera: Option<String>,
    /// Directory holding the local key-value store.
    pub data_dir: PathBuf,
    /// Largest request body the gateway will relay.
    pub max_upload_mb: usize,
    pub reentry: ReentryPolicy,
    /// Overrides the token saved by `faceattend login`.
    pub admin_token: Option<String>,
}

/// Optional TOML overlay; every key mirrors a `FACEATTEND_*` variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    recognize_path: Option<String>,
    listen: Option<String>,
    submit_timeout_secs: Option<u64>,
    capture_interval_ms: Option<u64>,
    suppression_secs: Option<u64>,
    idle_eviction_secs: Option<u64>,
    notification_ttl_secs: Option<u64>,
    camera: Option<String>,
    data_dir: Option<PathBuf>,
    max_upload_mb: Option<usize>,
    reentry: Option<String>,
    admin_token: Option<String>,
}

impl Config {
    /// Load `FACEATTEND_*` environment variables over the optional TOML file
    /// named by `FACEATTEND_CONFIG`, over built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match env("FACEATTEND_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, env)
    }

    /// Environment only, no file overlay.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(FileConfig::default(), |key| std::env::var(key).ok())
    }

    fn resolve<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_raw = env("FACEATTEND_API_URL")
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = Url::parse(api_raw.trim())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or(ConfigError::InvalidApiUrl(api_raw))?;

        let listen_raw = env("FACEATTEND_LISTEN")
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen_raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_raw))?;

        let data_dir = env("FACEATTEND_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let reentry = env("FACEATTEND_REENTRY")
            .or(file.reentry)
            .and_then(|v| ReentryPolicy::parse(&v))
            .unwrap_or_default();

        Ok(Self {
            api_url,
            recognize_path: env("FACEATTEND_RECOGNIZE_PATH")
                .or(file.recognize_path)
                .unwrap_or_else(|| DEFAULT_RECOGNIZE_PATH.to_string()),
            listen,
            submit_timeout_secs: env_u64(&env, "FACEATTEND_SUBMIT_TIMEOUT_SECS")
                .or(file.submit_timeout_secs)
                .unwrap_or(30),
            capture_interval_ms: env_u64(&env, "FACEATTEND_CAPTURE_INTERVAL_MS")
                .or(file.capture_interval_ms)
                .unwrap_or(2000),
            suppression_secs: env_u64(&env, "FACEATTEND_SUPPRESSION_SECS")
                .or(file.suppression_secs)
                .unwrap_or(5),
            idle_eviction_secs: env_u64(&env, "FACEATTEND_IDLE_EVICTION_SECS")
                .or(file.idle_eviction_secs)
                .unwrap_or(120),
            notification_ttl_secs: env_u64(&env, "FACEATTEND_NOTIFICATION_TTL_SECS")
                .or(file.notification_ttl_secs)
                .unwrap_or(4),
            camera: non_empty(env("FACEATTEND_CAMERA").or(file.camera)),
            data_dir,
            max_upload_mb: env_usize(&env, "FACEATTEND_MAX_UPLOAD_MB")
                .or(file.max_upload_mb)
                .unwrap_or(20),
            reentry,
            admin_token: non_empty(env("FACEATTEND_ADMIN_TOKEN").or(file.admin_token)),
        })
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            suppression_window: Duration::from_secs(self.suppression_secs),
            idle_eviction: Duration::from_secs(self.idle_eviction_secs),
            reentry: self.reentry,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tracker: self.tracker_config(),
            notification_ttl: self.notification_ttl(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_secs(self.notification_ttl_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Path to the local key-value store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    /// Whether local camera frames may be sent to the configured service.
    pub fn security_context(&self) -> SecurityContext {
        SecurityContext::for_endpoint(&self.api_url)
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir<F>(env: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceattend")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64<F>(env: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    env(key).and_then(|v| v.trim().parse().ok())
}

fn env_usize<F>(env: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    env(key).and_then(|v| v.trim().parse().ok())
}
