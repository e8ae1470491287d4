//! Durable event queue: at-least-once delivery of connector events to the
//! indexing pipeline.
//!
//! The dispatcher claims the oldest due pending events with conditional
//! `pending → processing` updates, hands each to the pipeline, and either
//! completes it or returns it to `pending` with exponential backoff. Once
//! an event exhausts its retry budget it moves to `dead_letter` and is
//! never retried again. Ordering is best-effort oldest-first; the
//! downstream pipeline absorbs out-of-order retries through idempotent
//! upserts keyed by (source_id, external document id).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EventsConfig, PipelineConfig};
use crate::models::{new_id, now_ts, ConnectorEventRow, EventPayload};

/// Seam to the downstream indexing pipeline (external collaborator).
#[async_trait]
pub trait IndexingPipeline: Send + Sync {
    async fn deliver(&self, event: &ConnectorEventRow) -> Result<()>;
}

/// Forwards events to an HTTP indexing pipeline endpoint.
pub struct HttpPipeline {
    http: reqwest::Client,
    url: String,
}

impl HttpPipeline {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build pipeline HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl IndexingPipeline for HttpPipeline {
    async fn deliver(&self, event: &ConnectorEventRow) -> Result<()> {
        let payload: serde_json::Value = serde_json::from_str(&event.payload)?;
        let body = serde_json::json!({
            "id": event.id,
            "sync_run_id": event.sync_run_id,
            "source_id": event.source_id,
            "event_type": event.event_type,
            "payload": payload,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("pipeline unreachable")?;
        if !resp.status().is_success() {
            anyhow::bail!("pipeline rejected event: HTTP {}", resp.status());
        }
        Ok(())
    }
}

/// Acknowledges events locally when no pipeline endpoint is configured.
pub struct LocalAckPipeline;

#[async_trait]
impl IndexingPipeline for LocalAckPipeline {
    async fn deliver(&self, _event: &ConnectorEventRow) -> Result<()> {
        Ok(())
    }
}

/// Build the pipeline from config: HTTP when a URL is set, local
/// acknowledgment otherwise.
pub fn pipeline_from_config(config: &PipelineConfig) -> Result<Arc<dyn IndexingPipeline>> {
    match &config.url {
        Some(url) => Ok(Arc::new(HttpPipeline::new(url, config.timeout_secs)?)),
        None => Ok(Arc::new(LocalAckPipeline)),
    }
}

/// Enqueue a connector event for delivery. Returns the event id.
pub async fn enqueue_event(
    pool: &SqlitePool,
    sync_run_id: &str,
    source_id: &str,
    payload: &EventPayload,
    max_retries: i64,
) -> Result<String> {
    let id = new_id();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO connector_events (id, sync_run_id, source_id, event_type, payload,
                                      status, retry_count, max_retries, next_attempt_at, created_at)
        VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(sync_run_id)
    .bind(source_id)
    .bind(payload.event_type())
    .bind(serde_json::to_string(payload)?)
    .bind(max_retries)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

/// Exponential backoff with deterministic jitter: `base * 2^retry`, capped,
/// scaled by a factor in [0.5, 1.5) derived from the item id so replicas
/// compute the same schedule without a shared random source.
pub fn backoff_secs(retry_count: i64, config: &EventsConfig, item_id: &str) -> i64 {
    let exp = retry_count.clamp(0, 30) as u32;
    let raw = config
        .backoff_base_secs
        .saturating_mul(1i64 << exp.min(20))
        .min(config.backoff_cap_secs);
    let hash = item_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let jitter = 0.5 + (hash % 1000) as f64 / 1000.0;
    ((raw as f64 * jitter) as i64).max(1)
}

/// Outcome counts for one dispatcher pass.
#[derive(Debug, Default, PartialEq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// One dispatcher pass: claim a bounded batch of due pending events,
/// oldest first, and deliver each. Item failures never block other items.
pub async fn dispatch_batch(
    pool: &SqlitePool,
    pipeline: &dyn IndexingPipeline,
    config: &EventsConfig,
) -> Result<DispatchStats> {
    let now = now_ts();
    let candidates = sqlx::query_as::<_, ConnectorEventRow>(
        r#"
        SELECT * FROM connector_events
        WHERE status = 'pending' AND next_attempt_at <= ?
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(config.batch_size)
    .fetch_all(pool)
    .await?;

    let mut stats = DispatchStats::default();

    for event in candidates {
        // Claim by conditional update; a replica may have taken it already.
        // The lease deadline lands in next_attempt_at so a crashed
        // dispatcher's claim expires and reclaim_stuck() can re-pend it.
        let claimed = sqlx::query(
            "UPDATE connector_events SET status = 'processing', next_attempt_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now_ts() + config.processing_lease_secs)
        .bind(&event.id)
        .execute(pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            continue;
        }

        match pipeline.deliver(&event).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE connector_events SET status = 'completed', error_message = NULL WHERE id = ?",
                )
                .bind(&event.id)
                .execute(pool)
                .await?;
                stats.delivered += 1;
            }
            Err(e) => {
                let new_count = event.retry_count + 1;
                if new_count >= event.max_retries {
                    sqlx::query(
                        "UPDATE connector_events SET status = 'dead_letter', retry_count = ?, error_message = ? WHERE id = ?",
                    )
                    .bind(new_count)
                    .bind(e.to_string())
                    .bind(&event.id)
                    .execute(pool)
                    .await?;
                    eprintln!(
                        "event {} dead-lettered after {} attempts: {}",
                        event.id, new_count, e
                    );
                    stats.dead_lettered += 1;
                } else {
                    let delay = backoff_secs(new_count, config, &event.id);
                    sqlx::query(
                        "UPDATE connector_events SET status = 'pending', retry_count = ?, next_attempt_at = ?, error_message = ? WHERE id = ?",
                    )
                    .bind(new_count)
                    .bind(now_ts() + delay)
                    .bind(e.to_string())
                    .bind(&event.id)
                    .execute(pool)
                    .await?;
                    stats.retried += 1;
                }
            }
        }
    }

    Ok(stats)
}

/// Return `processing` events whose lease expired to `pending`.
///
/// A dispatcher that crashes between the claim and the terminal write
/// leaves its events stuck in `processing`; this sweep makes them
/// re-pollable once the lease recorded at claim time has passed.
pub async fn reclaim_stuck(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE connector_events SET status = 'pending' \
         WHERE status = 'processing' AND next_attempt_at <= ?",
    )
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Dispatcher task: woken on enqueue, with a fallback poll so missed
/// notifications never cause starvation.
pub async fn run_dispatcher_loop(
    pool: SqlitePool,
    pipeline: Arc<dyn IndexingPipeline>,
    config: EventsConfig,
    notify: Arc<tokio::sync::Notify>,
) {
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
        if let Err(e) = reclaim_stuck(&pool).await {
            eprintln!("stuck event reclamation failed: {}", e);
        }
        loop {
            match dispatch_batch(&pool, pipeline.as_ref(), &config).await {
                Ok(stats) if stats.delivered + stats.retried + stats.dead_lettered > 0 => continue,
                Ok(_) => break,
                Err(e) => {
                    eprintln!("event dispatch pass failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Operator requeue: move dead-lettered events back to pending with a
/// fresh retry budget.
pub async fn requeue_dead_letter(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE connector_events SET status = 'pending', retry_count = 0, next_attempt_at = ?, error_message = NULL \
         WHERE status = 'dead_letter'",
    )
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Event counts by delivery status, for the status command.
pub async fn event_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM connector_events GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_event(pool: &SqlitePool, id: &str) -> Result<Option<ConnectorEventRow>> {
    let row = sqlx::query_as::<_, ConnectorEventRow>("SELECT * FROM connector_events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::testutil::test_pool;

    /// Pipeline that fails the first `fail_times` deliveries of each event.
    struct FlakyPipeline {
        calls: AtomicU64,
        fail_times: u64,
    }

    #[async_trait]
    impl IndexingPipeline for FlakyPipeline {
        async fn deliver(&self, _event: &ConnectorEventRow) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                anyhow::bail!("pipeline transient failure")
            }
            Ok(())
        }
    }

    fn deleted(doc: &str) -> EventPayload {
        EventPayload::DocumentDeleted {
            document_id: doc.to_string(),
        }
    }

    fn fast_config() -> EventsConfig {
        EventsConfig {
            batch_size: 10,
            max_retries: 3,
            backoff_base_secs: 1,
            backoff_cap_secs: 4,
            poll_interval_secs: 1,
            processing_lease_secs: 60,
        }
    }

    async fn make_due(pool: &SqlitePool, id: &str) {
        sqlx::query("UPDATE connector_events SET next_attempt_at = ? WHERE id = ?")
            .bind(now_ts() - 1)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_delivery_completes_event() {
        let (_dir, pool) = test_pool().await;
        let id = enqueue_event(&pool, "run-1", "src-1", &deleted("d1"), 3)
            .await
            .unwrap();

        let stats = dispatch_batch(&pool, &LocalAckPipeline, &fast_config())
            .await
            .unwrap();
        assert_eq!(stats.delivered, 1);

        let event = get_event(&pool, &id).await.unwrap().unwrap();
        assert_eq!(event.status, "completed");
        // Round-trip preserves identity fields exactly
        assert_eq!(event.sync_run_id, "run-1");
        assert_eq!(event.parse_payload().unwrap().document_id(), "d1");
    }

    #[tokio::test]
    async fn retry_count_increases_until_dead_letter() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();
        let id = enqueue_event(&pool, "run-1", "src-1", &deleted("d1"), config.max_retries)
            .await
            .unwrap();
        let pipeline = FlakyPipeline {
            calls: AtomicU64::new(0),
            fail_times: u64::MAX,
        };

        let mut seen = Vec::new();
        for _ in 0..config.max_retries {
            make_due(&pool, &id).await;
            dispatch_batch(&pool, &pipeline, &config).await.unwrap();
            let event = get_event(&pool, &id).await.unwrap().unwrap();
            seen.push(event.retry_count);
        }

        // Strictly increasing retry counts, ending in dead_letter
        assert_eq!(seen, vec![1, 2, 3]);
        let event = get_event(&pool, &id).await.unwrap().unwrap();
        assert_eq!(event.status, "dead_letter");
        assert_eq!(event.retry_count, event.max_retries);

        // Dead-lettered events are never picked up again
        make_due(&pool, &id).await;
        let stats = dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        assert_eq!(stats, DispatchStats::default());
        let event = get_event(&pool, &id).await.unwrap().unwrap();
        assert_eq!(event.status, "dead_letter");
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();
        let id = enqueue_event(&pool, "run-1", "src-1", &deleted("d1"), config.max_retries)
            .await
            .unwrap();
        let pipeline = FlakyPipeline {
            calls: AtomicU64::new(0),
            fail_times: 1,
        };

        dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        assert_eq!(get_event(&pool, &id).await.unwrap().unwrap().status, "pending");

        make_due(&pool, &id).await;
        let stats = dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(get_event(&pool, &id).await.unwrap().unwrap().status, "completed");
    }

    #[tokio::test]
    async fn failing_item_does_not_block_others() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();

        /// Fails only document "bad".
        struct SelectivePipeline;
        #[async_trait]
        impl IndexingPipeline for SelectivePipeline {
            async fn deliver(&self, event: &ConnectorEventRow) -> Result<()> {
                if event.payload.contains("bad") {
                    anyhow::bail!("no");
                }
                Ok(())
            }
        }

        let bad = enqueue_event(&pool, "r", "s", &deleted("bad"), 3).await.unwrap();
        let good = enqueue_event(&pool, "r", "s", &deleted("good"), 3).await.unwrap();

        let stats = dispatch_batch(&pool, &SelectivePipeline, &config).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(get_event(&pool, &good).await.unwrap().unwrap().status, "completed");
        assert_eq!(get_event(&pool, &bad).await.unwrap().unwrap().status, "pending");
    }

    #[tokio::test]
    async fn backoff_is_not_yet_due() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();
        let id = enqueue_event(&pool, "r", "s", &deleted("d"), 3).await.unwrap();
        let pipeline = FlakyPipeline {
            calls: AtomicU64::new(0),
            fail_times: u64::MAX,
        };

        dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        let event = get_event(&pool, &id).await.unwrap().unwrap();
        assert!(event.next_attempt_at > now_ts());

        // Not due yet: second pass is a no-op
        let stats = dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        assert_eq!(stats, DispatchStats::default());
    }

    #[tokio::test]
    async fn expired_processing_claim_is_reclaimed_and_delivered() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();
        let id = enqueue_event(&pool, "run-1", "src-1", &deleted("d1"), 3)
            .await
            .unwrap();

        // Simulate a dispatcher that claimed the event and then crashed:
        // the row is stuck in processing with an expired lease.
        sqlx::query(
            "UPDATE connector_events SET status = 'processing', next_attempt_at = ? WHERE id = ?",
        )
        .bind(now_ts() - 1)
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();

        // Dispatch alone never touches processing rows
        for _ in 0..3 {
            let stats = dispatch_batch(&pool, &LocalAckPipeline, &config).await.unwrap();
            assert_eq!(stats, DispatchStats::default());
        }

        assert_eq!(reclaim_stuck(&pool).await.unwrap(), 1);
        let stats = dispatch_batch(&pool, &LocalAckPipeline, &config).await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(get_event(&pool, &id).await.unwrap().unwrap().status, "completed");
    }

    #[tokio::test]
    async fn live_processing_claim_is_not_reclaimed() {
        let (_dir, pool) = test_pool().await;
        let id = enqueue_event(&pool, "run-1", "src-1", &deleted("d1"), 3)
            .await
            .unwrap();
        sqlx::query(
            "UPDATE connector_events SET status = 'processing', next_attempt_at = ? WHERE id = ?",
        )
        .bind(now_ts() + 60)
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(reclaim_stuck(&pool).await.unwrap(), 0);
        assert_eq!(get_event(&pool, &id).await.unwrap().unwrap().status, "processing");
    }

    #[tokio::test]
    async fn requeue_dead_letter_resets_budget() {
        let (_dir, pool) = test_pool().await;
        let config = fast_config();
        let id = enqueue_event(&pool, "r", "s", &deleted("d"), 1).await.unwrap();
        let pipeline = FlakyPipeline {
            calls: AtomicU64::new(0),
            fail_times: u64::MAX,
        };
        dispatch_batch(&pool, &pipeline, &config).await.unwrap();
        assert_eq!(get_event(&pool, &id).await.unwrap().unwrap().status, "dead_letter");

        assert_eq!(requeue_dead_letter(&pool).await.unwrap(), 1);
        let event = get_event(&pool, &id).await.unwrap().unwrap();
        assert_eq!(event.status, "pending");
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = EventsConfig {
            backoff_base_secs: 2,
            backoff_cap_secs: 300,
            ..fast_config()
        };
        let b1 = backoff_secs(1, &config, "event-a");
        let b3 = backoff_secs(3, &config, "event-a");
        let b20 = backoff_secs(20, &config, "event-a");
        assert!(b1 < b3);
        // Capped (with jitter at most 1.5x the cap)
        assert!(b20 <= 450);
        // Deterministic per item
        assert_eq!(backoff_secs(3, &config, "event-a"), b3);
    }
}
