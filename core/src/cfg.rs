use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"plugtimer"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
    /// Control plane bind address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Key required by mutating control-plane routes. Unset rejects them all.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Device-control backend account.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Timing of jobs, retries and the session cache.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Backend endpoint and account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// API root, e.g. `https://iotx-eu.meross.com/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Account e-mail.
    #[serde(default)]
    pub email: Option<String>,
    /// Account password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Scheduling, retry and cache timings (seconds unless noted).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    /// Linear backoff unit.
    pub backoff_unit_secs: u64,
    /// Timeout for each backend call.
    pub call_timeout_secs: u64,
    /// Session cache time-to-live.
    pub session_ttl_secs: u64,
    /// How long finished jobs stay listed.
    pub retention_secs: u64,
    /// Period of the stuck-job/retention sweep.
    pub housekeeping_secs: u64,
}

fn default_listen() -> String { "0.0.0.0:5000".to_string() }
fn default_base_url() -> String { "https://iotx-eu.meross.com/v1".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            listen: default_listen(),
            api_key: None,
            backend: BackendConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { base_url: default_base_url(), email: None, password: None }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit_secs: 20,
            call_timeout_secs: 15,
            session_ttl_secs: 300,
            retention_secs: 300,
            housekeeping_secs: 60,
        }
    }
}

impl SchedulerConfig {
    /// Retry policy for the executor.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_unit: Duration::from_secs(self.backoff_unit_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
        }
    }

    /// Session cache TTL.
    pub fn session_ttl(&self) -> Duration { Duration::from_secs(self.session_ttl_secs) }

    /// Retention of finished jobs.
    pub fn retention(&self) -> Duration { Duration::from_secs(self.retention_secs) }

    /// Housekeeping period.
    pub fn housekeeping_interval(&self) -> Duration { Duration::from_secs(self.housekeeping_secs.max(1)) }
}

impl Config {
    /// Overlay environment variables read through `var`: `PLUGTIMER_EMAIL`,
    /// `PLUGTIMER_PASSWORD`, `PLUGTIMER_API_KEY` (each falling back to its
    /// `MEROSS_*` name), `PLUGTIMER_BASE_URL` and `PORT`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |names: &[&str]| names.iter().find_map(|n| var(n).filter(|v| !v.trim().is_empty()));
        if let Some(v) = set(&["PLUGTIMER_EMAIL", "MEROSS_EMAIL"]) { self.backend.email = Some(v); }
        if let Some(v) = set(&["PLUGTIMER_PASSWORD", "MEROSS_PASSWORD"]) { self.backend.password = Some(v); }
        if let Some(v) = set(&["PLUGTIMER_API_KEY", "MEROSS_API_KEY"]) { self.api_key = Some(v); }
        if let Some(v) = set(&["PLUGTIMER_BASE_URL"]) { self.backend.base_url = v; }
        if let Some(port) = set(&["PORT"]) {
            let host = self.listen.rsplit_once(':').map(|(h, _)| h).unwrap_or("0.0.0.0");
            self.listen = format!("{host}:{}", port.trim());
        }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    if path.exists() {
        load_from(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// [`load_or_init`], then environment overrides.
pub fn load(app: &AppId) -> Result<Config> {
    let mut cfg = load_or_init(app)?;
    cfg.apply_env(|k| std::env::var(k).ok());
    Ok(cfg)
}

/// Parse a config file.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&txt).with_context(|| format!("parse {}", path.display()))
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
