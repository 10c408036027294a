//! TOML configuration for the agent.
//!
//! Every section has compiled-in defaults, so an empty file (or no file) is a
//! valid configuration. Durations are whole seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::{Severity, Thresholds};

pub const CONFIG_ENV: &str = "SREAGENT_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sreagent/sreagent.toml";

/// Upper bound for windows used in timestamp arithmetic (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("thresholds: warning_score ({warning}) must be > 0 and <= critical_score ({critical})")]
    ScoreOrder { warning: f64, critical: f64 },
    #[error("thresholds: min_confidence must be within [0, 1], got {0}")]
    ConfidenceRange(f64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{name} must be at most {max} seconds, got {value}")]
    TooLong { name: &'static str, value: u64, max: u64 },
    #[error("duplicate channel name '{0}'")]
    DuplicateChannel(String),
    #[error("channel '{0}' needs a url")]
    MissingUrl(String),
    #[error("collector '{name}': invalid cron schedule '{schedule}'")]
    BadSchedule { name: String, schedule: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. an explicit `--config` path (errors are fatal),
    /// 2. the `SREAGENT_CONFIG` environment variable,
    /// 3. `/etc/sreagent/sreagent.toml`,
    /// 4. compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %format!("{:#}", e),
                    "SREAGENT_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %format!("{:#}", e),
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let th = &self.thresholds;
        if !(th.warning_score > 0.0 && th.warning_score <= th.critical_score) {
            return Err(ConfigError::ScoreOrder {
                warning: th.warning_score,
                critical: th.critical_score,
            });
        }
        if !(0.0..=1.0).contains(&th.min_confidence) {
            return Err(ConfigError::ConfidenceRange(th.min_confidence));
        }
        let nonzero = [
            ("engine.window_size_secs", self.engine.window_size_secs),
            ("engine.min_samples_for_confidence", self.engine.min_samples_for_confidence),
            ("engine.workers", self.engine.workers as u64),
            ("engine.idle_sweep_secs", self.engine.idle_sweep_secs),
            ("correlation.window_secs", self.correlation.window_secs),
            ("alerts.max_alerts_per_minute", self.alerts.max_alerts_per_minute as u64),
            ("alerts.max_attempts", self.alerts.max_attempts as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        let windows = [
            ("engine.window_size_secs", self.engine.window_size_secs),
            ("correlation.window_secs", self.correlation.window_secs),
            ("alerts.dedupe_window_secs", self.alerts.dedupe_window_secs),
        ];
        for (name, value) in windows {
            if value > MAX_WINDOW_SECS {
                return Err(ConfigError::TooLong {
                    name,
                    value,
                    max: MAX_WINDOW_SECS,
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.name.as_str()) {
                return Err(ConfigError::DuplicateChannel(ch.name.clone()));
            }
            if ch.kind != ChannelKind::Log && ch.url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingUrl(ch.name.clone()));
            }
        }
        for c in &self.collectors {
            if c.schedule.parse::<cron::Schedule>().is_err() {
                return Err(ConfigError::BadSchedule {
                    name: c.name.clone(),
                    schedule: c.schedule.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Seconds to a chrono duration, clamped so unvalidated configs cannot
/// overflow.
fn window_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP API.
    pub bind: String,
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("data/sreagent.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rolling baseline span.
    pub window_size_secs: u64,
    /// Samples needed before a stream's confidence reaches 1.0.
    pub min_samples_for_confidence: u64,
    /// Ingestion shards; each owns the baselines hashed to it.
    pub workers: usize,
    /// How often each shard sweeps idle baselines.
    pub idle_sweep_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 3600,
            min_samples_for_confidence: 10,
            workers: 4,
            idle_sweep_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn window_size(&self) -> chrono::Duration {
        window_secs(self.window_size_secs)
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { window_secs: 600 }
    }
}

impl CorrelationConfig {
    pub fn window(&self) -> chrono::Duration {
        window_secs(self.window_secs)
    }
}

// ---------------------------------------------------------------------------
// Alert routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub dedupe_window_secs: u64,
    pub max_alerts_per_minute: u32,
    pub max_attempts: u32,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    /// Per-request timeout for webhook channels.
    pub send_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: 900,
            max_alerts_per_minute: 10,
            max_attempts: 5,
            retry_base_secs: 2,
            retry_max_secs: 60,
            send_timeout_secs: 10,
        }
    }
}

impl AlertConfig {
    pub fn dedupe_window(&self) -> chrono::Duration {
        window_secs(self.dedupe_window_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_secs)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Teams,
    Webhook,
    Log,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Slack => write!(f, "slack"),
            ChannelKind::Teams => write!(f, "teams"),
            ChannelKind::Webhook => write!(f, "webhook"),
            ChannelKind::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub url: Option<String>,
    /// Least severe entity this channel wants to hear about.
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

fn default_min_severity() -> Severity {
    Severity::Warning
}

// ---------------------------------------------------------------------------
// Collectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CollectorSource {
    Prometheus {
        url: String,
        queries: Vec<QueryConfig>,
    },
    Replay {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub name: String,
    pub expr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    /// Six-field cron expression (seconds first).
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub source: CollectorSource,
}

fn default_schedule() -> String {
    "0 * * * * *".to_string()
}

fn default_fetch_timeout() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.engine.window_size_secs, 3600);
        assert_eq!(cfg.engine.min_samples_for_confidence, 10);
        assert_eq!(cfg.thresholds, Thresholds::default());
        assert_eq!(cfg.correlation.window_secs, 600);
        assert_eq!(cfg.alerts.dedupe_window_secs, 900);
        assert_eq!(cfg.alerts.max_alerts_per_minute, 10);
        assert_eq!(cfg.alerts.max_attempts, 5);
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let cfg = Config::parse(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [thresholds]
            warning_score = 2.5
            critical_score = 4.0

            [alerts]
            max_attempts = 3

            [[channels]]
            name = "ops-slack"
            kind = "slack"
            url = "https://hooks.slack.com/services/T000/B000/XXX"
            min_severity = "critical"

            [[channels]]
            name = "journal"
            kind = "log"

            [[collectors]]
            name = "node"
            kind = "prometheus"
            schedule = "*/30 * * * * *"
            url = "http://prometheus:9090"
            queries = [{ name = "cpu", expr = "avg by (instance) (rate(node_cpu_seconds_total{mode!='idle'}[1m])) * 100" }]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.thresholds.warning_score, 2.5);
        assert_eq!(cfg.thresholds.min_confidence, 0.8);
        assert_eq!(cfg.alerts.max_attempts, 3);
        assert_eq!(cfg.alerts.max_alerts_per_minute, 10);
        assert_eq!(cfg.channels.len(), 2);
        assert_eq!(cfg.channels[0].min_severity, Severity::Critical);
        assert_eq!(cfg.channels[1].min_severity, Severity::Warning);
        match &cfg.collectors[0].source {
            CollectorSource::Prometheus { queries, .. } => assert_eq!(queries[0].name, "cpu"),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = Config::parse("[thresholds]\nwarning_score = 6.0\ncritical_score = 5.0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("warning_score"));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.alerts.max_attempts = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("alerts.max_attempts")));
    }

    #[test]
    fn test_rejects_oversized_windows() {
        let err = Config::parse("[engine]\nwindow_size_secs = 9223372036854775807\n").unwrap_err();
        assert!(format!("{:#}", err).contains("engine.window_size_secs must be at most"));

        let mut cfg = Config::default();
        cfg.alerts.dedupe_window_secs = MAX_WINDOW_SECS + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TooLong {
                name: "alerts.dedupe_window_secs",
                value: MAX_WINDOW_SECS + 1,
                max: MAX_WINDOW_SECS,
            })
        );

        // Accessors clamp rather than panic on a config that skipped validation.
        cfg.engine.window_size_secs = u64::MAX;
        cfg.correlation.window_secs = u64::MAX;
        let cap = chrono::Duration::seconds(MAX_WINDOW_SECS as i64);
        assert_eq!(cfg.engine.window_size(), cap);
        assert_eq!(cfg.correlation.window(), cap);
        assert_eq!(cfg.alerts.dedupe_window(), cap);
    }

    #[test]
    fn test_rejects_webhook_without_url() {
        let err = Config::parse("[[channels]]\nname = \"hook\"\nkind = \"webhook\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("needs a url"));
    }

    #[test]
    fn test_rejects_bad_cron() {
        let err = Config::parse(
            "[[collectors]]\nname = \"c\"\nkind = \"replay\"\npath = \"x.jsonl\"\nschedule = \"every minute\"\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("invalid cron"));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sreagent.toml");
        std::fs::write(&path, "[correlation]\nwindow_secs = 120\n")?;
        let cfg = Config::resolve(Some(path.as_path()))?;
        assert_eq!(cfg.correlation.window(), chrono::Duration::minutes(2));
        Ok(())
    }
}
