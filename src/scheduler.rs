//! Scheduler: decides which sources are due and admits them under the
//! global and per-type concurrency ceilings.
//!
//! Each tick selects active sources whose `next_sync_at` has passed and
//! that have no running run, oldest due first, and starts a scheduled run
//! for as many as the ceilings allow. `next_sync_at` is advanced only at
//! run completion (see `runs`), so a slow sync does not compound interval
//! drift.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::models::{now_ts, SourceRow, SyncRunRow, SyncType, TriggerType};
use crate::protocol::{SyncRequest, WorkerClient};
use crate::runs;

/// Active sources due for sync with no running run, in `next_sync_at`
/// order.
pub async fn due_sources(pool: &SqlitePool, now: i64) -> Result<Vec<SourceRow>> {
    let rows = sqlx::query_as::<_, SourceRow>(
        r#"
        SELECT s.* FROM sources s
        WHERE s.is_active = 1
          AND s.next_sync_at IS NOT NULL
          AND s.next_sync_at <= ?
          AND NOT EXISTS (
              SELECT 1 FROM sync_runs r
              WHERE r.source_id = s.id AND r.status = 'running'
          )
        ORDER BY s.next_sync_at ASC
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// A scheduled or manual run resumes from the checkpoint when one exists;
/// a source that has never synced gets a full run.
pub fn sync_type_for(source: &SourceRow, force_full: bool) -> SyncType {
    if force_full || source.connector_state.is_none() {
        SyncType::Full
    } else {
        SyncType::Incremental
    }
}

/// One scheduler pass. Returns the ids of admitted runs.
///
/// Ceilings are tracked locally across the candidate loop so a single tick
/// never over-admits; the store-level single-running-run index and the
/// admission checks in `runs::start_run` keep concurrent ticks (or
/// replicas) correct.
pub async fn tick(pool: &SqlitePool, config: &Arc<Config>) -> Result<Vec<String>> {
    let now = now_ts();
    let candidates = due_sources(pool, now).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut global = runs::count_running(pool).await?;
    let mut per_type: HashMap<String, i64> = HashMap::new();
    let mut admitted = Vec::new();

    for source in candidates {
        if global >= config.scheduler.max_concurrent_syncs {
            break;
        }
        let type_count = match per_type.get(&source.source_type) {
            Some(n) => *n,
            None => {
                let n = runs::count_running_for_type(pool, &source.source_type).await?;
                per_type.insert(source.source_type.clone(), n);
                n
            }
        };
        if type_count >= config.scheduler.max_concurrent_per_type {
            continue;
        }

        let sync_type = sync_type_for(&source, false);
        let run = match runs::start_run(pool, &config.scheduler, &source, TriggerType::Scheduled, sync_type)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                // Lost an admission race to a manual trigger or a replica;
                // the source will be reconsidered next tick.
                eprintln!("scheduler: skipping source {}: {}", source.id, e);
                continue;
            }
        };

        global += 1;
        per_type.insert(source.source_type.clone(), type_count + 1);
        admitted.push(run.id.clone());

        spawn_dispatch(pool.clone(), config.clone(), source, run);
    }

    Ok(admitted)
}

/// Fire-and-forget worker dispatch for an admitted run. A dispatch failure
/// (worker unreachable, refused to start) fails the run immediately.
pub fn spawn_dispatch(pool: SqlitePool, config: Arc<Config>, source: SourceRow, run: SyncRunRow) {
    tokio::spawn(async move {
        if let Err(e) = dispatch_run(&pool, &config, &source, &run).await {
            eprintln!("dispatch failed for run {}: {}", run.id, e);
            if let Err(e2) = runs::fail_run(&pool, &run.id, &format!("dispatch failed: {}", e)).await {
                eprintln!("could not record dispatch failure for run {}: {}", run.id, e2);
            }
        }
    });
}

/// Send the `POST /sync` call to the source's connector worker.
pub async fn dispatch_run(
    pool: &SqlitePool,
    config: &Config,
    source: &SourceRow,
    run: &SyncRunRow,
) -> Result<()> {
    let connector = config.worker_for(&source.source_type)?;
    let client = WorkerClient::for_connector(connector)?;
    client
        .start_sync(&SyncRequest {
            sync_run_id: run.id.clone(),
            source_id: source.id.clone(),
            sync_mode: run.sync_type.clone(),
        })
        .await?;
    // The worker owns the run from here; callbacks keep it alive.
    runs::touch(pool, &run.id).await?;
    Ok(())
}

/// Periodic scheduler task.
pub async fn run_scheduler_loop(pool: SqlitePool, config: Arc<Config>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.scheduler.poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match tick(&pool, &config).await {
            Ok(admitted) if !admitted.is_empty() => {
                println!("scheduler: admitted {} sync runs", admitted.len());
            }
            Ok(_) => {}
            Err(e) => eprintln!("scheduler tick failed: {}", e),
        }
    }
}

/// Periodic stale-sync sweep task.
pub async fn run_stale_sweep_loop(pool: SqlitePool, config: Arc<Config>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.scheduler.stale_sweep_interval_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match runs::reclaim_stale(&pool, config.scheduler.stale_timeout_secs).await {
            Ok(0) => {}
            Ok(n) => eprintln!("stale sweep: reclaimed {} sync runs with no heartbeat", n),
            Err(e) => eprintln!("stale sweep failed: {}", e),
        }
    }
}
