//! Embedding job queue.
//!
//! Document upserts enqueue one job per external document id; the worker
//! pool embeds the job's content and writes the vector into the
//! `embeddings` table. Jobs share the event queue's backoff curve but an
//! exhausted job ends as `failed` rather than dead-lettered: the document
//! stays indexed, it just has no vector until an operator retries.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::embedding::{self, vec_to_blob, EmbeddingProvider};
use crate::events::backoff_secs;
use crate::models::{now_ts, EmbeddingJobRow};

/// Enqueue (or re-arm) an embedding job for a document.
///
/// The document id is the primary key, so a document updated twice in
/// quick succession keeps a single job carrying the latest content.
pub async fn enqueue_job(
    pool: &SqlitePool,
    source_id: &str,
    document_id: &str,
    content: &str,
    max_retries: i64,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO embedding_jobs (document_id, source_id, content,
                                    status, retry_count, max_retries, next_attempt_at, updated_at)
        VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            source_id = excluded.source_id,
            content = excluded.content,
            status = 'pending',
            retry_count = 0,
            next_attempt_at = excluded.next_attempt_at,
            error_message = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(document_id)
    .bind(source_id)
    .bind(content)
    .bind(max_retries)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove the job and stored vector for a deleted document.
pub async fn drop_document(pool: &SqlitePool, document_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM embedding_jobs WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Claim the oldest due pending job, if any. The claim carries a lease in
/// `next_attempt_at` so a crashed worker's job can be reclaimed.
async fn claim_next(pool: &SqlitePool, lease_secs: i64) -> Result<Option<EmbeddingJobRow>> {
    let candidate = sqlx::query_as::<_, EmbeddingJobRow>(
        r#"
        SELECT * FROM embedding_jobs
        WHERE status = 'pending' AND next_attempt_at <= ?
        ORDER BY updated_at ASC, document_id ASC
        LIMIT 1
        "#,
    )
    .bind(now_ts())
    .fetch_optional(pool)
    .await?;
    let Some(job) = candidate else {
        return Ok(None);
    };
    let claimed = sqlx::query(
        "UPDATE embedding_jobs SET status = 'processing', next_attempt_at = ? \
         WHERE document_id = ? AND status = 'pending'",
    )
    .bind(now_ts() + lease_secs)
    .bind(&job.document_id)
    .execute(pool)
    .await?
    .rows_affected();
    if claimed == 0 {
        // Another worker got there first; the caller loops again.
        return Ok(None);
    }
    Ok(Some(job))
}

async fn embed_job(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    config: &Config,
    job: &EmbeddingJobRow,
) -> Result<()> {
    let vectors =
        embedding::embed_texts(provider, &config.embedding, &[job.content.clone()]).await?;
    let Some(vector) = vectors.into_iter().next() else {
        bail!("provider returned no vector");
    };
    sqlx::query(
        r#"
        INSERT INTO embeddings (document_id, model, dims, vector, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            vector = excluded.vector,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&job.document_id)
    .bind(provider.model_name())
    .bind(provider.dims() as i64)
    .bind(vec_to_blob(&vector))
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

/// Process a single claimed job to a completed, retryable, or failed
/// state. Returns true when a job was processed.
pub async fn process_one(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    config: &Config,
) -> Result<bool> {
    let Some(job) = claim_next(pool, config.events.processing_lease_secs).await? else {
        return Ok(false);
    };
    match embed_job(pool, provider, config, &job).await {
        Ok(()) => {
            sqlx::query(
                "UPDATE embedding_jobs SET status = 'completed', error_message = NULL, updated_at = ? WHERE document_id = ?",
            )
            .bind(now_ts())
            .bind(&job.document_id)
            .execute(pool)
            .await?;
        }
        Err(e) => {
            let new_count = job.retry_count + 1;
            if new_count >= job.max_retries {
                sqlx::query(
                    "UPDATE embedding_jobs SET status = 'failed', retry_count = ?, error_message = ?, updated_at = ? WHERE document_id = ?",
                )
                .bind(new_count)
                .bind(e.to_string())
                .bind(now_ts())
                .bind(&job.document_id)
                .execute(pool)
                .await?;
                eprintln!(
                    "embedding for document {} failed permanently: {}",
                    job.document_id, e
                );
            } else {
                let delay = backoff_secs(new_count, &config.events, &job.document_id);
                sqlx::query(
                    "UPDATE embedding_jobs SET status = 'pending', retry_count = ?, next_attempt_at = ?, error_message = ? WHERE document_id = ?",
                )
                .bind(new_count)
                .bind(now_ts() + delay)
                .bind(e.to_string())
                .bind(&job.document_id)
                .execute(pool)
                .await?;
            }
        }
    }
    Ok(true)
}

/// Return `processing` jobs whose lease expired to `pending`, making
/// work orphaned by a crashed worker re-pollable.
pub async fn reclaim_stuck(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE embedding_jobs SET status = 'pending', updated_at = ? \
         WHERE status = 'processing' AND next_attempt_at <= ?",
    )
    .bind(now_ts())
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Worker task: drains due jobs after a wake-up or fallback poll tick.
async fn run_worker(
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    config: Arc<Config>,
    notify: Arc<tokio::sync::Notify>,
) {
    let poll = Duration::from_secs(config.embedding.poll_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
        if let Err(e) = reclaim_stuck(&pool).await {
            eprintln!("stuck embedding job reclamation failed: {}", e);
        }
        loop {
            match process_one(&pool, provider.as_ref(), &config).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("embedding worker error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Spawn the embedding worker pool. No-op when the provider is disabled.
pub fn spawn_workers(
    pool: &SqlitePool,
    config: &Arc<Config>,
    notify: &Arc<tokio::sync::Notify>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        return Ok(());
    }
    let provider: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    for _ in 0..config.embedding.workers.max(1) {
        tokio::spawn(run_worker(
            pool.clone(),
            provider.clone(),
            config.clone(),
            notify.clone(),
        ));
    }
    Ok(())
}

/// Retry all permanently failed jobs with a fresh budget.
pub async fn retry_failed(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE embedding_jobs SET status = 'pending', retry_count = 0, next_attempt_at = ?, error_message = NULL \
         WHERE status = 'failed'",
    )
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Job counts by status, for the status command.
pub async fn job_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM embedding_jobs GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
