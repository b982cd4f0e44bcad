use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "labeld.toml";

/// Upper bound for every engine timing setting, ten years.
const MAX_SETTING_SECS: u64 = 3650 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub provider: ProviderConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Timing of the scheduling and synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum spacing between two scheduled passes for one mailbox.
    pub debounce_secs: u64,
    /// Overlap subtracted from the watermark to absorb search-index lag.
    pub overlap_secs: u64,
    /// Oldest mail a default pass will look at.
    pub backlog_days: u64,
    pub lease_ttl_secs: u64,
    pub pass_deadline_secs: u64,
    /// A mailbox with no pass for this long gets a catch-up pass.
    pub stale_after_hours: u64,
    /// Subscriptions expiring within this distance of now are renewed.
    pub renew_window_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub client_secret_path: PathBuf,
    pub pubsub_topic: String,
    pub rate_limit_interval_ms: u64,
    pub rate_limit_burst: u32,
    pub contact_label: String,
    pub starred_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret accepted by every endpoint in place of its own check.
    pub operator_key: Option<String>,
    /// When false, cron and task-queue identity checks are skipped.
    pub enforce_caller_checks: bool,
    pub cron_header: String,
    pub queue_header: String,
    pub queue_name: String,
    /// Expected audience of push bearer tokens, if any.
    pub push_audience: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a task name keeps deduplicating after it was enqueued.
    pub retention_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:labeld.db?mode=rwc".to_string(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            provider: ProviderConfig::default(),
            auth: AuthConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 60,
            overlap_secs: 5,
            backlog_days: 7,
            lease_ttl_secs: 120,
            pass_deadline_secs: 60,
            stale_after_hours: 24,
            renew_window_hours: 24,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_secret_path: PathBuf::from("credentials.json"),
            pubsub_topic: String::new(),
            rate_limit_interval_ms: 250,
            rate_limit_burst: 1,
            contact_label: "Contacts".to_string(),
            starred_label: "Contacts/Starred".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            operator_key: None,
            enforce_caller_checks: true,
            cron_header: "X-Appengine-Cron".to_string(),
            queue_header: "X-AppEngine-QueueName".to_string(),
            queue_name: "update".to_string(),
            push_audience: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_attempts: 5,
            retry_backoff_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> chrono::Duration {
        bounded(self.debounce_secs, 1)
    }

    pub fn overlap(&self) -> chrono::Duration {
        bounded(self.overlap_secs, 1)
    }

    pub fn backlog(&self) -> chrono::Duration {
        bounded(self.backlog_days, 86_400)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        bounded(self.lease_ttl_secs, 1)
    }

    pub fn pass_deadline(&self) -> Duration {
        Duration::from_secs(self.pass_deadline_secs.min(MAX_SETTING_SECS))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        bounded(self.stale_after_hours, 3600)
    }

    pub fn renew_window(&self) -> chrono::Duration {
        bounded(self.renew_window_hours, 3600)
    }

    /// Rejects timings that do not fit in a date offset.
    pub fn validate(&self) -> Result<()> {
        let settings = [
            ("debounce_secs", self.debounce_secs, 1),
            ("overlap_secs", self.overlap_secs, 1),
            ("backlog_days", self.backlog_days, 86_400),
            ("lease_ttl_secs", self.lease_ttl_secs, 1),
            ("pass_deadline_secs", self.pass_deadline_secs, 1),
            ("stale_after_hours", self.stale_after_hours, 3600),
            ("renew_window_hours", self.renew_window_hours, 3600),
        ];
        for (name, value, unit) in settings {
            if value.checked_mul(unit).is_none_or(|secs| secs > MAX_SETTING_SECS) {
                bail!("engine.{} = {} is out of range", name, value);
            }
        }
        Ok(())
    }
}

/// `value * unit_secs` seconds, saturating at the setting cap.
fn bounded(value: u64, unit_secs: u64) -> chrono::Duration {
    let secs = value.saturating_mul(unit_secs).min(MAX_SETTING_SECS);
    chrono::Duration::seconds(secs as i64)
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

impl Config {
    /// Loads the config file at `path`, falling back to defaults when it
    /// does not exist, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid configuration")?;
        config.engine.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT {:?}", port))?;
        }
        if let Some(key) = var("LABELD_OPERATOR_KEY") {
            self.auth.operator_key = Some(key.trim().to_string());
        }
        if let Some(url) = var("LABELD_DATABASE_URL") {
            self.database_url = url;
        }
        Ok(())
    }
}
