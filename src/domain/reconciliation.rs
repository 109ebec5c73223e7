//! Reconciliation jobs - queued drift detection/correction work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Why a reconciliation job was enqueued
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReconciliationReason {
    Drift,
    Audit,
    Manual,
}

/// Queue status of a reconciliation job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReconciliationJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl ReconciliationJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

/// Durable unit of reconciliation work.
///
/// `job_key` deduplicates submissions: a second enqueue for the same key
/// while a non-terminal job exists is coalesced into the existing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationJob {
    pub id: Uuid,
    pub job_key: String,
    pub backend_mount_id: Uuid,
    pub node_id: Option<Uuid>,
    pub path: String,
    pub reason: ReconciliationReason,
    pub status: ReconciliationJobStatus,
    pub detect_children: bool,
    pub requested_hash: bool,
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

/// Inbound request to reconcile one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRequest {
    pub backend_mount_id: Uuid,
    pub path: String,
    #[serde(default)]
    pub node_id: Option<Uuid>,
    pub reason: ReconciliationReason,
    #[serde(default)]
    pub detect_children: bool,
    #[serde(default)]
    pub requested_hash: bool,
}

impl ReconciliationRequest {
    /// Dedup key: one non-terminal job per `(mount, path)` at a time, which
    /// also guarantees no two workers touch the same path concurrently.
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.backend_mount_id, self.path)
    }
}
