//! Core data models for the sync orchestration engine.
//!
//! These types mirror the durable tables: sources, sync runs, connector
//! events, embedding jobs, and webhook channels. Status vocabularies are
//! closed enums; the connector event payload is a tagged sum type that is
//! (de)serialized to JSON only at the storage and wire boundaries.

use serde::{Deserialize, Serialize};

/// Kind of external system a source connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Drive,
    Messaging,
    Wiki,
    Crm,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Drive => "drive",
            SourceType::Messaging => "messaging",
            SourceType::Wiki => "wiki",
            SourceType::Crm => "crm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drive" => Some(SourceType::Drive),
            "messaging" => Some(SourceType::Messaging),
            "wiki" => Some(SourceType::Wiki),
            "crm" => Some(SourceType::Crm),
            _ => None,
        }
    }
}

/// Whether a run re-scans everything or resumes from the saved checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
        }
    }
}

/// Sync-run lifecycle state. `running` is the only non-terminal state;
/// the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Delivery state of a queued connector event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::DeadLetter => "dead_letter",
        }
    }
}

/// A configured external connection, scheduled for periodic sync.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRow {
    pub id: String,
    pub source_type: String,
    pub name: String,
    /// Arbitrary connector configuration (JSON text, non-secret).
    pub config_json: String,
    /// Opaque encrypted credential blob; opened only for the sync-config
    /// endpoint, never interpreted here.
    pub credentials_encrypted: Option<String>,
    pub is_active: bool,
    pub sync_interval_seconds: i64,
    pub next_sync_at: Option<i64>,
    /// Opaque checkpoint owned entirely by the connector (cursor, page
    /// token). JSON text, passed through verbatim.
    pub connector_state: Option<String>,
    pub created_at: i64,
}

/// One synchronization attempt for one source.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncRunRow {
    pub id: String,
    pub source_id: String,
    pub sync_type: String,
    pub trigger_type: String,
    pub status: String,
    pub queued_at: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    /// Heartbeat timestamp. Must advance while running or the run becomes
    /// eligible for stale reclamation.
    pub last_activity_at: i64,
    pub documents_scanned: i64,
    pub files_processed: i64,
    pub files_updated: i64,
    pub error_message: Option<String>,
}

/// One discovered-document fact awaiting delivery to the indexing pipeline.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConnectorEventRow {
    pub id: String,
    pub sync_run_id: String,
    pub source_id: String,
    pub event_type: String,
    /// Serialized [`EventPayload`].
    pub payload: String,
    pub status: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_attempt_at: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl ConnectorEventRow {
    pub fn parse_payload(&self) -> anyhow::Result<EventPayload> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// A unit of content awaiting vectorization, keyed by document id.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmbeddingJobRow {
    pub document_id: String,
    pub source_id: String,
    pub content: String,
    pub status: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_attempt_at: i64,
    pub error_message: Option<String>,
    pub updated_at: i64,
}

/// A provider push subscription for one (source, resource) pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookChannelRow {
    pub id: String,
    pub source_id: String,
    /// Provider-assigned channel identifier, used to resolve notifications.
    pub channel_id: String,
    /// Provider-side resource being watched.
    pub resource_id: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Discovered-document event payload.
///
/// The shape differs by event type: deletions carry only the document id,
/// while creates and updates carry metadata, permissions, and an optional
/// out-of-band content reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DocumentCreated {
        document_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        permissions: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_id: Option<String>,
    },
    DocumentUpdated {
        document_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        permissions: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_id: Option<String>,
    },
    DocumentDeleted { document_id: String },
}

impl EventPayload {
    /// The stored `event_type` discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::DocumentCreated { .. } => "document_created",
            EventPayload::DocumentUpdated { .. } => "document_updated",
            EventPayload::DocumentDeleted { .. } => "document_deleted",
        }
    }

    /// External document id this event is about.
    pub fn document_id(&self) -> &str {
        match self {
            EventPayload::DocumentCreated { document_id, .. }
            | EventPayload::DocumentUpdated { document_id, .. }
            | EventPayload::DocumentDeleted { document_id } => document_id,
        }
    }

    /// Content-blob reference, if the event carries one.
    pub fn content_id(&self) -> Option<&str> {
        match self {
            EventPayload::DocumentCreated { content_id, .. }
            | EventPayload::DocumentUpdated { content_id, .. } => content_id.as_deref(),
            EventPayload::DocumentDeleted { .. } => None,
        }
    }

    /// True for creates and updates, which represent a document write.
    pub fn is_upsert(&self) -> bool {
        !matches!(self, EventPayload::DocumentDeleted { .. })
    }
}

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// New sortable unique id (UUIDv7: time-ordered).
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
