use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    /// Connector worker endpoints keyed by source type
    /// (`drive`, `messaging`, `wiki`, `crm`).
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Global ceiling on concurrently running sync runs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_syncs: i64,
    /// Per-source-type ceiling on concurrently running sync runs.
    #[serde(default = "default_max_per_type")]
    pub max_concurrent_per_type: i64,
    /// A running run with no heartbeat for this long is reclaimed as failed.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: i64,
    /// Seconds between stale-sync sweeps.
    #[serde(default = "default_sweep_interval")]
    pub stale_sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrent_syncs: default_max_concurrent(),
            max_concurrent_per_type: default_max_per_type(),
            stale_timeout_secs: default_stale_timeout(),
            stale_sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}
fn default_max_concurrent() -> i64 {
    5
}
fn default_max_per_type() -> i64 {
    2
}
fn default_stale_timeout() -> i64 {
    900
}
fn default_sweep_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Max events claimed per dispatcher pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Delivery attempts before a connector event is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Base of the exponential backoff curve, in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: i64,
    /// Backoff ceiling, in seconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: i64,
    /// Fallback poll interval for the dispatcher, in seconds.
    #[serde(default = "default_event_poll")]
    pub poll_interval_secs: u64,
    /// How long a claimed item may sit in `processing` before a sweep
    /// returns it to `pending` (crashed worker recovery).
    #[serde(default = "default_processing_lease")]
    pub processing_lease_secs: i64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            poll_interval_secs: default_event_poll(),
            processing_lease_secs: default_processing_lease(),
        }
    }
}

fn default_batch_size() -> i64 {
    25
}
fn default_max_retries() -> i64 {
    5
}
fn default_backoff_base() -> i64 {
    2
}
fn default_backoff_cap() -> i64 {
    300
}
fn default_event_poll() -> u64 {
    5
}
fn default_processing_lease() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_retries")]
    pub max_retries: i64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Size of the embedding worker pool.
    #[serde(default = "default_embed_workers")]
    pub workers: usize,
    /// Fallback poll interval for the worker pool, in seconds.
    #[serde(default = "default_embed_poll")]
    pub poll_interval_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: default_embed_retries(),
            timeout_secs: default_timeout_secs(),
            workers: default_embed_workers(),
            poll_interval_secs: default_embed_poll(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_retries() -> i64 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embed_workers() -> usize {
    2
}
fn default_embed_poll() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    /// Indexing pipeline endpoint. When unset, delivered events are
    /// acknowledged locally (useful for development).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhooksConfig {
    /// Seconds between renewal sweeps.
    #[serde(default = "default_renewal_check")]
    pub renewal_check_interval_secs: u64,
    /// Channels expiring within this window are renewed.
    #[serde(default = "default_renewal_window")]
    pub renewal_window_secs: i64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            renewal_check_interval_secs: default_renewal_check(),
            renewal_window_secs: default_renewal_window(),
        }
    }
}

fn default_renewal_check() -> u64 {
    300
}
fn default_renewal_window() -> i64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    /// Base URL of the connector worker for this source type.
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Config {
    /// Worker endpoint for a source type, or an error naming the missing
    /// `[connectors.<type>]` section.
    pub fn worker_for(&self, source_type: &str) -> Result<&ConnectorConfig> {
        self.connectors.get(source_type).ok_or_else(|| {
            anyhow::anyhow!(
                "no connector worker configured for source type '{}' (add [connectors.{}] to the config)",
                source_type,
                source_type
            )
        })
    }

    /// Minimal config for tests: temp-ish paths and defaults everywhere.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/syncd.sqlite"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:7410".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            events: EventsConfig::default(),
            embedding: EmbeddingConfig::default(),
            pipeline: PipelineConfig::default(),
            webhooks: WebhooksConfig::default(),
            connectors: HashMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.scheduler.max_concurrent_syncs < 1 {
        anyhow::bail!("scheduler.max_concurrent_syncs must be >= 1");
    }
    if config.scheduler.max_concurrent_per_type < 1 {
        anyhow::bail!("scheduler.max_concurrent_per_type must be >= 1");
    }
    if config.scheduler.stale_timeout_secs < 1 {
        anyhow::bail!("scheduler.stale_timeout_secs must be >= 1");
    }
    if config.events.max_retries < 1 {
        anyhow::bail!("events.max_retries must be >= 1");
    }
    if config.events.batch_size < 1 {
        anyhow::bail!("events.batch_size must be >= 1");
    }
    if config.events.backoff_base_secs < 1 || config.events.backoff_cap_secs < config.events.backoff_base_secs {
        anyhow::bail!("events backoff must satisfy 1 <= backoff_base_secs <= backoff_cap_secs");
    }
    if config.webhooks.renewal_window_secs < 1 {
        anyhow::bail!("webhooks.renewal_window_secs must be >= 1");
    }

    for (source_type, connector) in &config.connectors {
        if crate::models::SourceType::parse(source_type).is_none() {
            anyhow::bail!(
                "Unknown source type in [connectors.{}]. Must be drive, messaging, wiki, or crm.",
                source_type
            );
        }
        if connector.url.is_empty() {
            anyhow::bail!("connectors.{}.url must not be empty", source_type);
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncd.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_fill_in() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "/tmp/syncd.sqlite"

[server]
bind = "127.0.0.1:7410"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.scheduler.max_concurrent_syncs, 5);
        assert_eq!(cfg.scheduler.max_concurrent_per_type, 2);
        assert_eq!(cfg.events.max_retries, 5);
        assert_eq!(cfg.embedding.provider, "disabled");
        assert!(cfg.connectors.is_empty());
    }

    #[test]
    fn rejects_zero_ceiling() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "/tmp/syncd.sqlite"

[server]
bind = "127.0.0.1:7410"

[scheduler]
max_concurrent_syncs = 0
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_syncs"));
    }

    #[test]
    fn rejects_unknown_source_type() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "/tmp/syncd.sqlite"

[server]
bind = "127.0.0.1:7410"

[connectors.ftp]
url = "http://localhost:9000"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown source type"));
    }

    #[test]
    fn rejects_embedding_without_dims() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "/tmp/syncd.sqlite"

[server]
bind = "127.0.0.1:7410"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn worker_lookup() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "/tmp/syncd.sqlite"

[server]
bind = "127.0.0.1:7410"

[connectors.drive]
url = "http://localhost:9101"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.worker_for("drive").unwrap().url, "http://localhost:9101");
        assert!(cfg.worker_for("wiki").is_err());
    }
}
