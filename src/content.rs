//! Out-of-band content blob store.
//!
//! Workers push large document bodies through `store_content` and emit
//! events that carry only the returned content reference, keeping event
//! rows small. Content ids are the SHA-256 of the body, so repeated stores
//! of the same body are idempotent.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::now_ts;

pub fn content_id_for(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Persist a content blob and return its reference.
pub async fn store_content(
    pool: &SqlitePool,
    sync_run_id: &str,
    source_id: &str,
    body: &str,
) -> Result<String> {
    let id = content_id_for(body);
    sqlx::query(
        "INSERT OR IGNORE INTO contents (id, sync_run_id, source_id, body, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(sync_run_id)
    .bind(source_id)
    .bind(body)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get_content(pool: &SqlitePool, content_id: &str) -> Result<Option<String>> {
    let body: Option<String> = sqlx::query_scalar("SELECT body FROM contents WHERE id = ?")
        .bind(content_id)
        .fetch_optional(pool)
        .await?;
    Ok(body)
}
