//! Service configuration
//!
//! TOML file plus `FILESTORE_*` environment overrides. Every section has
//! workable defaults so a bare `FilestoreConfig::default()` runs against a
//! local sqlite file with inline events.

use crate::infrastructure::events::EventsMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilestoreConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub events: EventsConfig,
    pub rollups: RollupsConfig,
    pub reconciliation: ReconciliationConfig,
    pub journal: JournalConfig,
    pub snapshots: SnapshotsConfig,
}

impl Default for FilestoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4300,
            log_level: "info".to_string(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            events: EventsConfig::default(),
            rollups: RollupsConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            journal: JournalConfig::default(),
            snapshots: SnapshotsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://filestore.db?mode=rwc".to_string(),
            max_connections: 10,
            idle_timeout_ms: 8_000,
            connect_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "filestore:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub mode: EventsMode,
    pub channel: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            mode: EventsMode::Inline,
            channel: "events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupsConfig {
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    /// Mutations deeper than this defer to a background recompute
    pub recalc_depth_threshold: i32,
    /// Parents with more children than this defer to a background recompute
    pub recalc_child_count_threshold: i64,
    pub max_cascade_depth: i32,
    pub queue_concurrency: usize,
}

impl Default for RollupsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 30,
            cache_max_entries: 1024,
            recalc_depth_threshold: 6,
            recalc_child_count_threshold: 256,
            max_cascade_depth: 32,
            queue_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub queue_concurrency: usize,
    pub audit_interval_ms: u64,
    pub audit_batch_size: u64,
    pub max_attempts: i32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            queue_concurrency: 2,
            audit_interval_ms: 300_000,
            audit_batch_size: 100,
            max_attempts: 5,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub retention_days: i64,
    pub prune_batch_size: u64,
    pub prune_interval_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            prune_batch_size: 500,
            prune_interval_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub enabled: bool,
}

impl FilestoreConfig {
    /// Load from a TOML file (defaults when absent), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading config from {:?}", path);
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config at {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config at {}", path.display()))?
            }
            Some(path) => {
                warn!("No config found at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FILESTORE_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FILESTORE_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring non-numeric FILESTORE_PORT '{}'", port),
            }
        }
        if let Ok(level) = std::env::var("FILESTORE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(url) = std::env::var("FILESTORE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("FILESTORE_REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(mode) = std::env::var("FILESTORE_EVENTS_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "inline" => self.events.mode = EventsMode::Inline,
                "redis" => self.events.mode = EventsMode::Redis,
                other => warn!("Ignoring unknown FILESTORE_EVENTS_MODE '{}'", other),
            }
        }
        if let Ok(channel) = std::env::var("FILESTORE_EVENTS_CHANNEL") {
            self.events.channel = channel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = FilestoreConfig::default();
        assert_eq!(config.events.mode, EventsMode::Inline);
        assert!(config.database.url.starts_with("sqlite://"));
        assert_eq!(config.reconciliation.max_attempts, 5);
    }

    #[test]
    fn partial_toml_fills_with_defaults() {
        let parsed: FilestoreConfig = toml::from_str(
            r#"
            port = 9000

            [rollups]
            cache_ttl_seconds = 5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.rollups.cache_ttl_seconds, 5);
        assert_eq!(parsed.rollups.cache_max_entries, 1024);
        assert_eq!(parsed.host, "127.0.0.1");
    }
}
