use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that points at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "ISSUE_MIRROR_CONFIG";

/// Top-level configuration loaded from `~/.issue-mirror/config.toml`.
///
/// **Security**: This struct NEVER stores the tracker username or token.
/// It only names where they live (env vars or mounted secret files); see
/// [`crate::credentials::CredentialProvider`] for resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load config from `$ISSUE_MIRROR_CONFIG` or `~/.issue-mirror/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let mut cfg = Config::default();
            cfg.expand_paths();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse, expand `~/` paths, and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.source.validate()?;
        self.rate_limit.validate()?;
        self.sync.validate()?;
        self.git.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.general.data_dir = expand_home(&self.general.data_dir);
        self.git.repo_path = expand_home(&self.git.repo_path);
        self.source.username_file = self.source.username_file.as_deref().map(expand_home);
        self.source.token_file = self.source.token_file.as_deref().map(expand_home);
    }

    /// Location of the persisted sync watermarks.
    pub fn state_path(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join("sync-state.json")
    }

    fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".issue-mirror")
            .join("config.toml")
    }
}

/// Expand a leading `~/` against the current user's home directory.
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(invalid(format!(
                "general.log_format must be `pretty` or `json`, got `{other}`"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_data_dir() -> String {
    "~/.issue-mirror".into()
}

/// Connection settings for the remote issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_project_key")]
    pub project_key: String,
    /// Env var holding the username (default: `ISSUE_MIRROR_USERNAME`).
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Env var holding the API token (default: `ISSUE_MIRROR_TOKEN`).
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Mounted secret file for the username. Takes precedence over the env var.
    #[serde(default)]
    pub username_file: Option<String>,
    /// Mounted secret file for the token. Takes precedence over the env var.
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            project_key: default_project_key(),
            username_env: default_username_env(),
            token_env: default_token_env(),
            username_file: None,
            token_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl SourceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_key.trim().is_empty() {
            return Err(invalid("source.project_key must not be empty"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(invalid(format!(
                "source.base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("source.request_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}
fn default_project_key() -> String {
    "PROJ".into()
}
fn default_username_env() -> String {
    "ISSUE_MIRROR_USERNAME".into()
}
fn default_token_env() -> String {
    "ISSUE_MIRROR_TOKEN".into()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Outbound token-bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

impl RateLimitSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_second.is_nan() || self.requests_per_second <= 0.0 {
            return Err(invalid("rate_limit.requests_per_second must be > 0"));
        }
        if self.burst == 0 {
            return Err(invalid("rate_limit.burst must be >= 1"));
        }
        Ok(())
    }
}

fn default_requests_per_second() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Page size used by bootstrap scans.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Maximum results fetched by the single project search.
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    /// Exclude Done/Closed/Resolved issues from syncs.
    #[serde(default)]
    pub active_only: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            search_limit: default_search_limit(),
            active_only: false,
        }
    }
}

impl SyncSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.page_size) {
            return Err(invalid(format!(
                "sync.page_size must be within 1..=1000, got {}",
                self.page_size
            )));
        }
        if !(1..=1000).contains(&self.search_limit) {
            return Err(invalid(format!(
                "sync.search_limit must be within 1..=1000, got {}",
                self.search_limit
            )));
        }
        Ok(())
    }
}

fn default_page_size() -> usize {
    50
}
fn default_search_limit() -> usize {
    100
}

/// Target repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_repo_path")]
    pub repo_path: String,
    /// Clone source used when `repo_path` does not exist yet.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory (relative to the repo root) holding one file per issue.
    #[serde(default = "default_issues_dir")]
    pub issues_dir: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            remote_url: None,
            remote: default_remote(),
            branch: default_branch(),
            issues_dir: default_issues_dir(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl GitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.branch.trim().is_empty() {
            return Err(invalid("git.branch must not be empty"));
        }
        if self.issues_dir.trim().is_empty() || Path::new(&self.issues_dir).is_absolute() {
            return Err(invalid("git.issues_dir must be a non-empty relative path"));
        }
        Ok(())
    }
}

fn default_repo_path() -> String {
    "~/.issue-mirror/repo".into()
}
fn default_remote() -> String {
    "origin".into()
}
fn default_branch() -> String {
    "main".into()
}
fn default_issues_dir() -> String {
    "issues".into()
}
fn default_author_name() -> String {
    "issue-mirror".into()
}
fn default_author_email() -> String {
    "issue-mirror@localhost".into()
}

/// Poll cadence, retention, and the optional trigger hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,
    /// Bind address of the trigger hook endpoint; disabled when unset.
    #[serde(default)]
    pub hook_bind: Option<String>,
    /// Env var holding the shared secret required by the trigger hook.
    #[serde(default = "default_hook_secret_env")]
    pub hook_secret_env: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_days: default_retention_days(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            hook_bind: None,
            hook_secret_env: default_hook_secret_env(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(invalid("scheduler.poll_interval_secs must be > 0"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(invalid("scheduler.cleanup_interval_secs must be > 0"));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(invalid("scheduler.wait_poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

fn default_poll_interval_secs() -> u64 {
    300
}
fn default_cleanup_interval_secs() -> u64 {
    86_400
}
fn default_retention_days() -> u32 {
    7
}
fn default_wait_poll_interval_ms() -> u64 {
    100
}
fn default_hook_secret_env() -> String {
    "ISSUE_MIRROR_HOOK_SECRET".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
