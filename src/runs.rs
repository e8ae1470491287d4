//! Sync-run state machine.
//!
//! A run is `running` from admission until a terminal transition
//! (`completed`, `failed`, `cancelled`). Every terminal write is a
//! conditional UPDATE guarded on `status = 'running'`, so transitions are
//! monotonic and safe under concurrent callers; the partial unique index
//! created in `migrate` guarantees at most one running run per source.
//!
//! Liveness: every worker callback advances `last_activity_at`. The
//! stale-sync sweep is the sole recovery path for crashed or partitioned
//! workers — there is no separate liveness channel.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::SchedulerConfig;
use crate::models::{new_id, now_ts, SourceRow, SyncRunRow, SyncType, TriggerType};

/// Error text used for admission conflicts; the HTTP layer maps it to 409.
pub const SYNC_IN_PROGRESS: &str = "sync already in progress";

/// Admit a source and create its running sync run.
///
/// Enforces the global and per-type concurrency ceilings, then relies on
/// the store's partial unique index to reject a concurrent second run for
/// the same source (defense in depth against manual-trigger races).
pub async fn start_run(
    pool: &SqlitePool,
    scheduler: &SchedulerConfig,
    source: &SourceRow,
    trigger: TriggerType,
    sync_type: SyncType,
) -> Result<SyncRunRow> {
    if !source.is_active {
        bail!("source {} is not active", source.id);
    }

    let global = count_running(pool).await?;
    if global >= scheduler.max_concurrent_syncs {
        bail!(
            "concurrency limit reached: {} sync runs already running (max {})",
            global,
            scheduler.max_concurrent_syncs
        );
    }
    let per_type = count_running_for_type(pool, &source.source_type).await?;
    if per_type >= scheduler.max_concurrent_per_type {
        bail!(
            "concurrency limit reached for source type '{}': {} running (max {})",
            source.source_type,
            per_type,
            scheduler.max_concurrent_per_type
        );
    }

    let id = new_id();
    let now = now_ts();
    let result = sqlx::query(
        r#"
        INSERT INTO sync_runs (id, source_id, sync_type, trigger_type, status,
                               queued_at, started_at, completed_at, last_activity_at)
        VALUES (?, ?, ?, ?, 'running', ?, ?, NULL, ?)
        "#,
    )
    .bind(&id)
    .bind(&source.id)
    .bind(sync_type.as_str())
    .bind(trigger.as_str())
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    match result {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            bail!("{} for source {}", SYNC_IN_PROGRESS, source.id);
        }
        Err(e) => return Err(e.into()),
    }

    get_run(pool, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("sync run {} vanished after insert", id))
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<SyncRunRow>> {
    let row = sqlx::query_as::<_, SyncRunRow>("SELECT * FROM sync_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn running_run_for_source(
    pool: &SqlitePool,
    source_id: &str,
) -> Result<Option<SyncRunRow>> {
    let row = sqlx::query_as::<_, SyncRunRow>(
        "SELECT * FROM sync_runs WHERE source_id = ? AND status = 'running'",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_recent_runs(
    pool: &SqlitePool,
    source_id: &str,
    limit: i64,
) -> Result<Vec<SyncRunRow>> {
    let rows = sqlx::query_as::<_, SyncRunRow>(
        "SELECT * FROM sync_runs WHERE source_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
    )
    .bind(source_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_running(pool: &SqlitePool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs WHERE status = 'running'")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn count_running_for_type(pool: &SqlitePool, source_type: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM sync_runs r
        JOIN sources s ON s.id = r.source_id
        WHERE r.status = 'running' AND s.source_type = ?
        "#,
    )
    .bind(source_type)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Heartbeat: advance `last_activity_at` if the run is still running.
/// Returns false for unknown or already-terminal runs.
pub async fn touch(pool: &SqlitePool, run_id: &str) -> Result<bool> {
    let result =
        sqlx::query("UPDATE sync_runs SET last_activity_at = ? WHERE id = ? AND status = 'running'")
            .bind(now_ts())
            .bind(run_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Advance the scanned counter and heartbeat in one write.
pub async fn increment_scanned(pool: &SqlitePool, run_id: &str, count: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET documents_scanned = documents_scanned + ?, last_activity_at = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(count)
    .bind(now_ts())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Bump file counters when an event is emitted; every emit heartbeats.
pub async fn record_emit(pool: &SqlitePool, run_id: &str, is_upsert: bool) -> Result<bool> {
    let updated_delta: i64 = if is_upsert { 1 } else { 0 };
    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET files_processed = files_processed + 1,
            files_updated = files_updated + ?,
            last_activity_at = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(updated_delta)
    .bind(now_ts())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Terminal: worker finished successfully. Persists final counters,
/// optionally overwrites the source checkpoint, and advances the source's
/// next due time so interval drift does not compound.
pub async fn complete_run(
    pool: &SqlitePool,
    run_id: &str,
    documents_scanned: i64,
    documents_updated: i64,
    new_state: Option<&serde_json::Value>,
) -> Result<()> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET status = 'completed', completed_at = ?, last_activity_at = ?,
            documents_scanned = ?, files_updated = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(documents_scanned)
    .bind(documents_updated)
    .bind(run_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        bail!("sync run {} is not running", run_id);
    }

    if let Some(state) = new_state {
        sqlx::query(
            "UPDATE sources SET connector_state = ? \
             WHERE id = (SELECT source_id FROM sync_runs WHERE id = ?)",
        )
        .bind(serde_json::to_string(state)?)
        .bind(run_id)
        .execute(pool)
        .await?;
    }

    reschedule_source_of(pool, run_id, now).await
}

/// Terminal: worker reported failure. Partial progress (already-emitted
/// events, saved checkpoints) is preserved; the source stays on its
/// normal cadence.
pub async fn fail_run(pool: &SqlitePool, run_id: &str, error: &str) -> Result<()> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET status = 'failed', completed_at = ?, last_activity_at = ?, error_message = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        bail!("sync run {} is not running", run_id);
    }

    reschedule_source_of(pool, run_id, now).await
}

/// Terminal: operator- or caller-initiated cancellation, recorded once the
/// conditional write wins. The cooperative cancel signal to the worker is
/// sent by the caller; the stale sweep backstops a worker that never
/// responds.
pub async fn cancel_run(pool: &SqlitePool, run_id: &str) -> Result<()> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET status = 'cancelled', completed_at = ?, last_activity_at = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(run_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        bail!("sync run {} is not running", run_id);
    }

    reschedule_source_of(pool, run_id, now).await
}

async fn reschedule_source_of(pool: &SqlitePool, run_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE sources SET next_sync_at = ? + sync_interval_seconds \
         WHERE id = (SELECT source_id FROM sync_runs WHERE id = ?)",
    )
    .bind(now)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stale-sync sweep: force-fail running rows whose heartbeat is older than
/// the timeout, unblocking their sources for rescheduling. Idempotent
/// under concurrent sweeps — both conditional UPDATEs are no-ops the
/// second time. Returns the number of runs reclaimed.
pub async fn reclaim_stale(pool: &SqlitePool, stale_timeout_secs: i64) -> Result<u64> {
    let now = now_ts();
    let cutoff = now - stale_timeout_secs;

    sqlx::query(
        r#"
        UPDATE sources SET next_sync_at = ? + sync_interval_seconds
        WHERE id IN (
            SELECT source_id FROM sync_runs
            WHERE status = 'running' AND last_activity_at < ?
        )
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;

    let result = sqlx::query(
        r#"
        UPDATE sync_runs
        SET status = 'failed', completed_at = ?,
            error_message = 'sync went stale: no heartbeat received within timeout'
        WHERE status = 'running' AND last_activity_at < ?
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Counts of runs by status, for the status command.
pub async fn run_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM sync_runs GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::models::SourceType;
    use crate::sources;
    use crate::testutil::{seed_source, test_pool};

    fn sched() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[tokio::test]
    async fn second_run_for_same_source_conflicts() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;

        start_run(&pool, &sched(), &source, TriggerType::Manual, SyncType::Full)
            .await
            .unwrap();
        let err = start_run(&pool, &sched(), &source, TriggerType::Manual, SyncType::Full)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(SYNC_IN_PROGRESS));
    }

    #[tokio::test]
    async fn concurrent_admissions_admit_exactly_one() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Wiki).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                start_run(
                    &pool,
                    &SchedulerConfig::default(),
                    &source,
                    TriggerType::Manual,
                    SyncType::Full,
                )
                .await
                .is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(count_running(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_persists_counters_and_checkpoint() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        let run = start_run(&pool, &sched(), &source, TriggerType::Scheduled, SyncType::Full)
            .await
            .unwrap();

        complete_run(
            &pool,
            &run.id,
            50,
            10,
            Some(&serde_json::json!({"cursor": "c1"})),
        )
        .await
        .unwrap();

        let run = get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.documents_scanned, 50);
        assert_eq!(run.files_updated, 10);
        assert!(run.completed_at.is_some());

        let source = sources::get_source(&pool, &source.id).await.unwrap().unwrap();
        assert_eq!(
            source.connector_state.as_deref(),
            Some(r#"{"cursor":"c1"}"#)
        );
        // next_sync_at advanced to roughly now + interval
        assert!(source.next_sync_at.unwrap() > now_ts() + source.sync_interval_seconds - 10);
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Crm).await;
        let run = start_run(&pool, &sched(), &source, TriggerType::Manual, SyncType::Full)
            .await
            .unwrap();

        fail_run(&pool, &run.id, "boom").await.unwrap();
        assert!(complete_run(&pool, &run.id, 1, 1, None).await.is_err());
        assert!(cancel_run(&pool, &run.id).await.is_err());
        assert!(!touch(&pool, &run.id).await.unwrap());

        let run = get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        assert_eq!(run.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_run_reclaimed_exactly_once() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Messaging).await;
        let run = start_run(&pool, &sched(), &source, TriggerType::Scheduled, SyncType::Full)
            .await
            .unwrap();

        // Age the heartbeat past the timeout
        sqlx::query("UPDATE sync_runs SET last_activity_at = ? WHERE id = ?")
            .bind(now_ts() - 10_000)
            .bind(&run.id)
            .execute(&pool)
            .await
            .unwrap();

        let first = reclaim_stale(&pool, 900).await.unwrap();
        let second = reclaim_stale(&pool, 900).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let run = get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        assert!(run.error_message.unwrap().contains("stale"));

        // Source unblocked for rescheduling
        let source = sources::get_source(&pool, &source.id).await.unwrap().unwrap();
        assert!(source.next_sync_at.is_some());
        assert!(running_run_for_source(&pool, &source.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_run_survives_sweep() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        let run = start_run(&pool, &sched(), &source, TriggerType::Scheduled, SyncType::Full)
            .await
            .unwrap();

        assert_eq!(reclaim_stale(&pool, 900).await.unwrap(), 0);
        assert!(touch(&pool, &run.id).await.unwrap());
        assert_eq!(get_run(&pool, &run.id).await.unwrap().unwrap().status, "running");
    }

    #[tokio::test]
    async fn emit_and_scanned_advance_heartbeat() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        let run = start_run(&pool, &sched(), &source, TriggerType::Scheduled, SyncType::Full)
            .await
            .unwrap();

        assert!(increment_scanned(&pool, &run.id, 7).await.unwrap());
        assert!(record_emit(&pool, &run.id, true).await.unwrap());
        assert!(record_emit(&pool, &run.id, false).await.unwrap());

        let run = get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(run.documents_scanned, 7);
        assert_eq!(run.files_processed, 2);
        assert_eq!(run.files_updated, 1);
    }

    #[tokio::test]
    async fn inactive_source_is_rejected() {
        let (_dir, pool) = test_pool().await;
        let source = seed_source(&pool, SourceType::Drive).await;
        sources::set_active(&pool, &source.id, false).await.unwrap();
        let source = sources::get_source(&pool, &source.id).await.unwrap().unwrap();

        let err = start_run(&pool, &sched(), &source, TriggerType::Manual, SyncType::Full)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not active"));
    }
}
