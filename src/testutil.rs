//! Shared helpers for unit tests: temp-file SQLite pools with the schema
//! applied.

use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::config::Config;

/// Fresh temp database with the full schema. The `TempDir` must be kept
/// alive for the duration of the test.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::minimal();
    cfg.db.path = dir.path().join("test.sqlite");
    let pool = crate::db::connect(&cfg).await.unwrap();
    crate::migrate::apply_schema(&pool).await.unwrap();
    (dir, pool)
}

/// Insert a minimal active source due for sync now, returning its row.
pub async fn seed_source(pool: &SqlitePool, source_type: crate::models::SourceType) -> crate::models::SourceRow {
    crate::sources::add_source(pool, source_type, "test source", "{}", None, 3600)
        .await
        .unwrap()
}
