//! Source registry: durable store of source definitions, schedules, and
//! encrypted per-source credentials.
//!
//! The orchestrator consumes this registry; it never interprets the
//! connector configuration or the credential blob beyond passing them to
//! the worker through the sync-config endpoint.

use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::{new_id, now_ts, SourceRow, SourceType};

/// Opens the opaque encrypted credential blob into connector-usable JSON.
///
/// Encryption internals live outside this crate; the default
/// [`PassthroughCipher`] handles blobs that are base64-wrapped JSON, which
/// is the transport shape the external credential service produces.
pub trait CredentialCipher: Send + Sync {
    fn open(&self, blob: &str) -> Result<serde_json::Value>;
    fn seal(&self, credentials: &serde_json::Value) -> Result<String>;
}

/// Base64 transport codec for the external credential service's blobs.
pub struct PassthroughCipher;

impl CredentialCipher for PassthroughCipher {
    fn open(&self, blob: &str) -> Result<serde_json::Value> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .context("credential blob is not valid base64")?;
        serde_json::from_slice(&bytes).context("credential blob is not valid JSON")
    }

    fn seal(&self, credentials: &serde_json::Value) -> Result<String> {
        let bytes = serde_json::to_vec(credentials)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

/// Register a new source. The first sync becomes due immediately.
pub async fn add_source(
    pool: &SqlitePool,
    source_type: SourceType,
    name: &str,
    config_json: &str,
    credentials_encrypted: Option<&str>,
    sync_interval_seconds: i64,
) -> Result<SourceRow> {
    // Validate the config is JSON before storing it
    let _: serde_json::Value =
        serde_json::from_str(config_json).context("source config must be valid JSON")?;

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO sources (id, source_type, name, config_json, credentials_encrypted,
                             is_active, sync_interval_seconds, next_sync_at, created_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(source_type.as_str())
    .bind(name)
    .bind(config_json)
    .bind(credentials_encrypted)
    .bind(sync_interval_seconds)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_source(pool, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("source {} vanished after insert", id))
}

pub async fn get_source(pool: &SqlitePool, id: &str) -> Result<Option<SourceRow>> {
    let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<SourceRow>> {
    let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Activate or deactivate a source. Deactivated sources are excluded from
/// scheduling but retain their run history.
pub async fn set_active(pool: &SqlitePool, id: &str, active: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE sources SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Overwrite the connector's opaque checkpoint.
pub async fn save_connector_state(
    pool: &SqlitePool,
    source_id: &str,
    state: &serde_json::Value,
) -> Result<bool> {
    let result = sqlx::query("UPDATE sources SET connector_state = ? WHERE id = ?")
        .bind(serde_json::to_string(state)?)
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Everything a connector worker needs to perform a sync: non-secret
/// config, opened credentials, and the last saved checkpoint.
#[derive(Debug, Serialize)]
pub struct SyncConfig {
    pub source_id: String,
    pub source_type: String,
    pub config: serde_json::Value,
    pub credentials: Option<serde_json::Value>,
    pub connector_state: Option<serde_json::Value>,
}

pub async fn sync_config(
    pool: &SqlitePool,
    cipher: &dyn CredentialCipher,
    source_id: &str,
) -> Result<Option<SyncConfig>> {
    let Some(source) = get_source(pool, source_id).await? else {
        return Ok(None);
    };

    let credentials = match &source.credentials_encrypted {
        Some(blob) => Some(cipher.open(blob)?),
        None => None,
    };
    let connector_state = match &source.connector_state {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };

    Ok(Some(SyncConfig {
        source_id: source.id,
        source_type: source.source_type,
        config: serde_json::from_str(&source.config_json)?,
        credentials,
        connector_state,
    }))
}
