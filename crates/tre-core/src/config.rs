use crate::error::{Result, TreError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for every environment variable read by [`Config::apply_env`].
pub const ENV_PREFIX: &str = "TRE_";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// The single configuration record for a run. Built once at startup and
/// passed explicitly to every component.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracker_base_url: String,
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub auth_client_id: String,
    #[serde(default, skip_serializing)]
    pub auth_client_secret: String,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,
}

fn default_rate_limit_rps() -> f64 {
    5.0
}

fn default_page_size() -> u32 {
    50
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(paths::CHECKPOINTS_DIR)
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from(paths::AUDIT_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_base_url: String::new(),
            project_key: String::new(),
            auth_client_id: String::new(),
            auth_client_secret: String::new(),
            rate_limit_rps: default_rate_limit_rps(),
            page_size: default_page_size(),
            request_timeout_seconds: default_request_timeout_seconds(),
            retry_max_attempts: default_retry_max_attempts(),
            batch_size: default_batch_size(),
            dry_run: false,
            checkpoint_path: default_checkpoint_path(),
            audit_dir: default_audit_dir(),
        }
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tracker_base_url", &self.tracker_base_url)
            .field("project_key", &self.project_key)
            .field("auth_client_id", &self.auth_client_id)
            .field("auth_client_secret", &"<redacted>")
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("page_size", &self.page_size)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("batch_size", &self.batch_size)
            .field("dry_run", &self.dry_run)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("audit_dir", &self.audit_dir)
            .finish()
    }
}

impl Config {
    // ---------------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------------

    /// Read a YAML config file. Missing keys take their defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TreError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Overlay `TRE_*` variables obtained through `lookup`. Unset variables
    /// leave the current value alone; malformed numbers are a config error.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("TRACKER_BASE_URL") {
            self.tracker_base_url = v;
        }
        if let Some(v) = var("PROJECT_KEY") {
            self.project_key = v;
        }
        if let Some(v) = var("AUTH_CLIENT_ID") {
            self.auth_client_id = v;
        }
        if let Some(v) = var("AUTH_CLIENT_SECRET") {
            self.auth_client_secret = v;
        }
        if let Some(v) = var("RATE_LIMIT_RPS") {
            self.rate_limit_rps = parse_env("RATE_LIMIT_RPS", &v)?;
        }
        if let Some(v) = var("PAGE_SIZE") {
            self.page_size = parse_env("PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("REQUEST_TIMEOUT_SECONDS") {
            self.request_timeout_seconds = parse_env("REQUEST_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = var("RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = parse_env("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("BATCH_SIZE") {
            self.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = var("DRY_RUN") {
            self.dry_run = parse_bool("DRY_RUN", &v)?;
        }
        if let Some(v) = var("CHECKPOINT_PATH") {
            self.checkpoint_path = PathBuf::from(v);
        }
        if let Some(v) = var("AUDIT_DIR") {
            self.audit_dir = PathBuf::from(v);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------------------

    /// Check the record before any network call. Credentials and the base
    /// URL are only required when the caller is about to talk to the tracker.
    pub fn validate(&self, require_tracker: bool) -> Result<()> {
        let mut problems = Vec::new();

        if self.project_key.is_empty() {
            problems.push("project_key is required".to_string());
        } else if let Err(e) = paths::validate_project_key(&self.project_key) {
            problems.push(e.to_string());
        }

        if require_tracker {
            if self.tracker_base_url.is_empty() {
                problems.push("tracker_base_url is required".to_string());
            } else if reqwest::Url::parse(&self.tracker_base_url).is_err() {
                problems.push(format!(
                    "tracker_base_url '{}' is not a valid URL",
                    self.tracker_base_url
                ));
            }
            if self.auth_client_id.is_empty() {
                problems.push("auth_client_id is required".to_string());
            }
            if self.auth_client_secret.is_empty() {
                problems.push("auth_client_secret is required".to_string());
            }
        }

        if !(self.rate_limit_rps.is_finite() && self.rate_limit_rps > 0.0) {
            problems.push(format!("rate_limit_rps must be > 0 (got {})", self.rate_limit_rps));
        }
        if self.page_size == 0 {
            problems.push("page_size must be > 0".to_string());
        }
        if self.request_timeout_seconds == 0 {
            problems.push("request_timeout_seconds must be > 0".to_string());
        }
        if self.retry_max_attempts == 0 {
            problems.push("retry_max_attempts must be >= 1".to_string());
        }
        if self.batch_size == 0 {
            problems.push("batch_size must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TreError::Config(problems.join("; ")))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        TreError::Config(format!("{ENV_PREFIX}{name}: cannot parse '{value}'"))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(TreError::Config(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got '{value}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
