//! Connector protocol: the HTTP contract between the orchestrator and an
//! independently deployable connector worker.
//!
//! Orchestrator → worker calls (this module): `GET /health`,
//! `GET /manifest`, `POST /sync`, `POST /cancel`, `POST /action`. A worker
//! answers `/sync` immediately with `started` and performs the sync
//! asynchronously, reporting progress and completion through the SDK
//! callback surface (`server` module).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConnectorConfig;

/// `GET /manifest` response: what the worker is and what it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    /// Supported sync modes, e.g. `["full", "incremental"]`.
    #[serde(default)]
    pub sync_modes: Vec<String>,
    /// Declared one-off actions callable via `POST /action`.
    #[serde(default)]
    pub actions: Vec<String>,
}

/// `POST /sync` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sync_run_id: String,
    pub source_id: String,
    pub sync_mode: String,
}

/// `POST /sync` response body. Anything but `started` fails the run.
#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /cancel` request body. Cancellation is cooperative: the worker
/// polls its cancellation flag, terminates promptly, and reports through
/// the `fail` callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub sync_run_id: String,
}

/// `POST /action` request body: synchronous one-off operations outside
/// the sync lifecycle (write-back actions, channel renewal).
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub action: String,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

/// HTTP client for one connector worker endpoint.
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
}

impl WorkerClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn for_connector(connector: &ConnectorConfig) -> Result<Self> {
        Self::new(&connector.url, connector.timeout_secs)
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("worker at {} is unreachable", self.base_url))?;
        if !resp.status().is_success() {
            bail!("worker health check failed with HTTP {}", resp.status());
        }
        Ok(())
    }

    pub async fn manifest(&self) -> Result<Manifest> {
        let resp = self
            .http
            .get(format!("{}/manifest", self.base_url))
            .send()
            .await
            .with_context(|| format!("worker at {} is unreachable", self.base_url))?;
        if !resp.status().is_success() {
            bail!("worker manifest request failed with HTTP {}", resp.status());
        }
        Ok(resp.json().await.context("invalid manifest response")?)
    }

    /// Ask the worker to begin a sync. The worker must reply `started`;
    /// completion arrives later through the callback channel.
    pub async fn start_sync(&self, request: &SyncRequest) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/sync", self.base_url))
            .json(request)
            .send()
            .await
            .with_context(|| format!("worker at {} is unreachable", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("worker rejected sync dispatch: HTTP {} {}", status, body.trim());
        }

        let ack: SyncResponse = resp.json().await.context("invalid sync response")?;
        if ack.status != "started" {
            bail!(
                "worker did not start sync: status '{}'{}",
                ack.status,
                ack.error
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Best-effort cooperative cancellation signal.
    pub async fn cancel(&self, sync_run_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/cancel", self.base_url))
            .json(&CancelRequest {
                sync_run_id: sync_run_id.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("worker at {} is unreachable", self.base_url))?;
        if !resp.status().is_success() {
            bail!("worker cancel failed with HTTP {}", resp.status());
        }
        Ok(())
    }

    /// Synchronous one-off action, outside the sync state machine.
    pub async fn action(&self, request: &ActionRequest) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(format!("{}/action", self.base_url))
            .json(request)
            .send()
            .await
            .with_context(|| format!("worker at {} is unreachable", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "worker action '{}' failed: HTTP {} {}",
                request.action,
                status,
                body.trim()
            );
        }
        Ok(resp.json().await.context("invalid action response")?)
    }
}
