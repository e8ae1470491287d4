//! Webhook channel lifecycle.
//!
//! Providers push change notifications through short-lived channels that
//! must be re-registered before they expire. The renewal sweep asks the
//! source's connector worker to re-register and replaces the stored row
//! in a transaction; the row is never updated in place, so a notification
//! either resolves to a fully valid channel or to nothing. A channel that
//! cannot be renewed lapses and the source degrades to polling-only.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::models::{new_id, now_ts, WebhookChannelRow};
use crate::protocol::{ActionRequest, WorkerClient};
use crate::sources::{self, CredentialCipher};

/// Record a channel registration, replacing any previous channel for the
/// same (source, resource) pair. Delete-and-recreate inside one
/// transaction so a half-renewed channel is never observable.
pub async fn register_channel(
    pool: &SqlitePool,
    source_id: &str,
    channel_id: &str,
    resource_id: &str,
    expires_at: i64,
) -> Result<WebhookChannelRow> {
    let id = new_id();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM webhook_channels WHERE source_id = ? AND resource_id = ?")
        .bind(source_id)
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO webhook_channels (id, source_id, channel_id, resource_id, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(source_id)
    .bind(channel_id)
    .bind(resource_id)
    .bind(expires_at)
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let row = sqlx::query_as::<_, WebhookChannelRow>("SELECT * FROM webhook_channels WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// Resolve an incoming notification's channel id to its live channel.
/// Expired channels resolve to nothing.
pub async fn resolve_channel(
    pool: &SqlitePool,
    channel_id: &str,
) -> Result<Option<WebhookChannelRow>> {
    let row = sqlx::query_as::<_, WebhookChannelRow>(
        "SELECT * FROM webhook_channels WHERE channel_id = ? AND expires_at > ?",
    )
    .bind(channel_id)
    .bind(now_ts())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Channels expiring within the renewal window (including already lapsed
/// ones, which still get a renewal attempt).
pub async fn channels_expiring(
    pool: &SqlitePool,
    window_secs: i64,
) -> Result<Vec<WebhookChannelRow>> {
    let rows = sqlx::query_as::<_, WebhookChannelRow>(
        "SELECT * FROM webhook_channels WHERE expires_at <= ? ORDER BY expires_at ASC",
    )
    .bind(now_ts() + window_secs)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete_channel(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM webhook_channels WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Ask the source's worker to re-register one channel and replace the row.
async fn renew_channel(
    pool: &SqlitePool,
    config: &Config,
    cipher: &dyn CredentialCipher,
    channel: &WebhookChannelRow,
) -> Result<()> {
    let source = sources::get_source(pool, &channel.source_id)
        .await?
        .with_context(|| format!("channel {} references unknown source", channel.id))?;
    let credentials = match &source.credentials_encrypted {
        Some(blob) => Some(cipher.open(blob)?),
        None => None,
    };

    let worker = WorkerClient::for_connector(config.worker_for(&source.source_type)?)?;
    let reply = worker
        .action(&ActionRequest {
            action: "renew_channel".to_string(),
            params: serde_json::json!({
                "channel_id": channel.channel_id,
                "resource_id": channel.resource_id,
                "source_config": serde_json::from_str::<serde_json::Value>(&source.config_json)?,
            }),
            credentials,
        })
        .await?;

    let new_channel_id = reply
        .get("channel_id")
        .and_then(|v| v.as_str())
        .context("renew_channel reply missing channel_id")?;
    let new_expires_at = reply
        .get("expires_at")
        .and_then(|v| v.as_i64())
        .context("renew_channel reply missing expires_at")?;
    if new_expires_at <= now_ts() {
        bail!("renew_channel returned an already-expired channel");
    }

    register_channel(
        pool,
        &channel.source_id,
        new_channel_id,
        &channel.resource_id,
        new_expires_at,
    )
    .await?;
    Ok(())
}

/// One renewal pass. Failures are logged and retried on the next sweep;
/// the count of successfully renewed channels is returned.
pub async fn renew_sweep(
    pool: &SqlitePool,
    config: &Config,
    cipher: &dyn CredentialCipher,
) -> Result<u64> {
    let expiring = channels_expiring(pool, config.webhooks.renewal_window_secs).await?;
    let mut renewed = 0u64;
    for channel in &expiring {
        match renew_channel(pool, config, cipher, channel).await {
            Ok(()) => renewed += 1,
            Err(e) => {
                eprintln!(
                    "webhook channel {} (source {}) renewal failed: {}",
                    channel.channel_id, channel.source_id, e
                );
            }
        }
    }
    Ok(renewed)
}

pub async fn run_renewal_loop(
    pool: SqlitePool,
    config: Arc<Config>,
    cipher: Arc<dyn CredentialCipher>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.webhooks.renewal_check_interval_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = renew_sweep(&pool, &config, cipher.as_ref()).await {
            eprintln!("webhook renewal sweep failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use crate::testutil::{seed_source, test_pool};

    #[tokio::test]
    async fn reregister_replaces_channel_for_resource() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;

        let old = register_channel(&pool, &source.id, "chan-1", "res-1", now_ts() + 100)
            .await
            .unwrap();
        let new = register_channel(&pool, &source.id, "chan-2", "res-1", now_ts() + 1000)
            .await
            .unwrap();
        assert_ne!(old.id, new.id);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_channels WHERE source_id = ? AND resource_id = 'res-1'",
        )
        .bind(&source.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);

        // Old channel id no longer resolves
        assert!(resolve_channel(&pool, "chan-1").await.unwrap().is_none());
        let live = resolve_channel(&pool, "chan-2").await.unwrap().unwrap();
        assert_eq!(live.source_id, source.id);
    }

    #[tokio::test]
    async fn expired_channel_does_not_resolve() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Wiki).await;
        register_channel(&pool, &source.id, "chan-old", "res-1", now_ts() - 10)
            .await
            .unwrap();
        assert!(resolve_channel(&pool, "chan-old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiring_window_selects_only_near_expiry() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        register_channel(&pool, &source.id, "soon", "res-a", now_ts() + 60)
            .await
            .unwrap();
        register_channel(&pool, &source.id, "later", "res-b", now_ts() + 10_000)
            .await
            .unwrap();

        let expiring = channels_expiring(&pool, 300).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].channel_id, "soon");
    }

    #[tokio::test]
    async fn unreachable_worker_leaves_channel_for_next_sweep() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        register_channel(&pool, &source.id, "chan-1", "res-1", now_ts() + 60)
            .await
            .unwrap();

        let mut config = Config::minimal();
        config.connectors.insert(
            "drive".to_string(),
            crate::config::ConnectorConfig {
                url: "http://127.0.0.1:1".to_string(),
                timeout_secs: 1,
            },
        );

        let renewed = renew_sweep(&pool, &config, &crate::sources::PassthroughCipher)
            .await
            .unwrap();
        assert_eq!(renewed, 0);

        // Row untouched, eligible again next sweep
        let row = resolve_channel(&pool, "chan-1").await.unwrap().unwrap();
        assert_eq!(row.resource_id, "res-1");
    }
}
