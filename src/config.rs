//! Configuration for the kitchen display engine, read from `.kds/kds.toml`.
//!
//! Layering: defaults → `kds.toml` → environment (`KDS_PORT`, `KDS_DB_PATH`)
//! → CLI flags. Every key is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3170
//! db_path = ".kds/kds.db"
//! dev_mode = false
//!
//! [retention]
//! completed_minutes = 120
//! cancelled_minutes = 5
//!
//! [feed]
//! default_limit = 100
//!
//! [store]
//! max_attempts = 3
//! busy_timeout_ms = 250
//!
//! [poller]
//! interval_ms = 3000
//! max_backoff_ms = 30000
//! failure_threshold = 3
//! page_size = 100
//! station = "kitchen"
//! base_url = "http://127.0.0.1:3170"
//! role = "kitchen"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kds_common::{RetentionPolicy, Role, Station};

use crate::kitchen::api::MAX_FEED_LIMIT;
use crate::kitchen::db::{DEFAULT_FEED_LIMIT, StoreOptions};
use crate::kitchen::poller::PollerSettings;

pub const CONFIG_DIR: &str = ".kds";
pub const CONFIG_FILE: &str = "kds.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Binds on all interfaces and allows any CORS origin.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

fn default_port() -> u16 {
    3170
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("kds.db")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionSection {
    #[serde(default = "default_completed_minutes")]
    pub completed_minutes: i64,
    #[serde(default = "default_cancelled_minutes")]
    pub cancelled_minutes: i64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            completed_minutes: default_completed_minutes(),
            cancelled_minutes: default_cancelled_minutes(),
        }
    }
}

impl RetentionSection {
    pub fn policy(&self) -> Result<RetentionPolicy> {
        RetentionPolicy::from_minutes(self.completed_minutes, self.cancelled_minutes)
            .context("Invalid [retention] section")
    }
}

fn default_completed_minutes() -> i64 {
    120
}

fn default_cancelled_minutes() -> i64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSection {
    #[serde(default = "default_feed_limit")]
    pub default_limit: u32,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            default_limit: default_feed_limit(),
        }
    }
}

fn default_feed_limit() -> u32 {
    DEFAULT_FEED_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Total attempts for a write transaction that finds the database busy.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreSection {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            max_attempts: self.max_attempts,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_busy_timeout_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Tickets per feed request. Full pages are followed within the same tick.
    #[serde(default = "default_feed_limit")]
    pub page_size: u32,
    #[serde(default)]
    pub station: Option<Station>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub role: Option<Role>,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            failure_threshold: default_failure_threshold(),
            page_size: default_feed_limit(),
            station: None,
            base_url: default_base_url(),
            role: None,
        }
    }
}

impl PollerSection {
    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            interval: Duration::from_millis(self.interval_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            failure_threshold: self.failure_threshold,
            page_size: self.page_size,
        }
    }
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_base_url() -> String {
    format!("http://127.0.0.1:{}", default_port())
}

/// The complete kds.toml configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KdsConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub poller: PollerSection,
}

impl KdsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse kds.toml")?;
        config.retention.policy()?;
        Ok(config)
    }

    /// Load `kds.toml` from `config_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize kds.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `KDS_PORT` / `KDS_DB_PATH` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides from any lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("KDS_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid KDS_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("KDS_DB_PATH") {
            if !path.trim().is_empty() {
                self.server.db_path = PathBuf::from(path.trim());
            }
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the OS will pick a random port".to_string());
        }
        if self.retention.completed_minutes == 0 {
            warnings.push(format!(
                "retention.completed_minutes = {}: completed tickets leave the feed immediately",
                self.retention.completed_minutes
            ));
        }
        if self.retention.cancelled_minutes == 0 {
            warnings.push(format!(
                "retention.cancelled_minutes = {}: cancelled tickets leave the feed immediately",
                self.retention.cancelled_minutes
            ));
        }
        if self.feed.default_limit == 0 || self.feed.default_limit > MAX_FEED_LIMIT {
            warnings.push(format!(
                "feed.default_limit = {}: requests are clamped to 1..={}",
                self.feed.default_limit, MAX_FEED_LIMIT
            ));
        }
        if self.store.max_attempts == 0 {
            warnings.push("store.max_attempts = 0: treated as 1 (no retries)".to_string());
        }
        if self.poller.interval_ms == 0 {
            warnings.push("poller.interval_ms = 0: displays will poll in a tight loop".to_string());
        }
        if self.poller.max_backoff_ms < self.poller.interval_ms {
            warnings.push(format!(
                "poller.max_backoff_ms ({}) is below poller.interval_ms ({})",
                self.poller.max_backoff_ms, self.poller.interval_ms
            ));
        }
        if self.poller.failure_threshold == 0 {
            warnings.push(
                "poller.failure_threshold = 0: connection lost is reported on the first failure"
                    .to_string(),
            );
        }
        if self.poller.page_size == 0 || self.poller.page_size > MAX_FEED_LIMIT {
            warnings.push(format!(
                "poller.page_size = {}: the server clamps pages to 1..={}",
                self.poller.page_size, MAX_FEED_LIMIT
            ));
        }
        if !self.poller.base_url.starts_with("http://") && !self.poller.base_url.starts_with("https://") {
            warnings.push(format!(
                "poller.base_url '{}' should start with http:// or https://",
                self.poller.base_url
            ));
        }

        warnings
    }
}
