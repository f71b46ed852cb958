use crate::error::{DocumentDbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration stored as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentDbConfig {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub promotion: PromotionPolicy,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Default cluster reference; CLI flags take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Which planning checks `--force` is allowed to bypass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceScope {
    /// Only the replication lag limit.
    #[default]
    Lag,
    /// Lag limit and conflicting declared primaries.
    LagAndAmbiguousPrimary,
}

/// Operator policy for promotions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    /// Maximum replay lag of a promotion target, in milliseconds.
    #[serde(default = "default_max_lag_ms")]
    pub max_lag_ms: u64,
    /// Optional maximum WAL distance of a promotion target, in bytes.
    #[serde(default)]
    pub max_lag_bytes: Option<u64>,
    /// Delay between convergence polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for the cluster to converge, in milliseconds.
    #[serde(default = "default_convergence_timeout_ms")]
    pub convergence_timeout_ms: u64,
    #[serde(default)]
    pub force_scope: ForceScope,
}

fn default_max_lag_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_convergence_timeout_ms() -> u64 {
    300_000
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            max_lag_ms: default_max_lag_ms(),
            max_lag_bytes: None,
            poll_interval_ms: default_poll_interval_ms(),
            convergence_timeout_ms: default_convergence_timeout_ms(),
            force_scope: ForceScope::default(),
        }
    }
}

impl PromotionPolicy {
    pub fn max_lag(&self) -> Duration {
        Duration::from_millis(self.max_lag_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }
}

/// Health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Per-member probe timeout, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum number of members probed at once.
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
    /// Port of the instance status endpoint on each pod.
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    #[serde(default = "default_status_path")]
    pub status_path: String,
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_status_port() -> u16 {
    8000
}

fn default_status_path() -> String {
    "/pg/status".to_string()
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            concurrency: default_probe_concurrency(),
            status_port: default_status_port(),
            status_path: default_status_path(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff for transient read errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl DocumentDbConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DocumentDbError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| DocumentDbError::TomlDe(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Ok(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DocumentDbError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.promotion;
        if p.poll_interval_ms == 0 || p.convergence_timeout_ms == 0 {
            return Err(DocumentDbError::Config(
                "promotion intervals must be greater than zero".to_string(),
            ));
        }
        if p.poll_interval_ms >= p.convergence_timeout_ms {
            return Err(DocumentDbError::Config(format!(
                "poll_interval_ms ({}) must be below convergence_timeout_ms ({})",
                p.poll_interval_ms, p.convergence_timeout_ms
            )));
        }
        if self.probe.concurrency == 0 {
            return Err(DocumentDbError::Config(
                "probe.concurrency must be at least 1".to_string(),
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(DocumentDbError::Config(
                "probe.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DocumentDbError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the default config path: `~/.documentdb/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".documentdb").join("config.toml"))
            .ok_or_else(|| DocumentDbError::Config("Cannot determine home directory".to_string()))
    }
}
