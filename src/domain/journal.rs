//! Journal - append-only record of accepted commands

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a journal entry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JournalStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JournalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Immutable audit record for one accepted command.
///
/// `(command, idempotency_key)` is unique when the key is present; that pair
/// is the idempotency anchor for command replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: Uuid,
    pub command: String,
    pub status: JournalStatus,
    pub principal: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub primary_node_id: Option<Uuid>,
    pub secondary_node_id: Option<Uuid>,
    pub affected_node_ids: Vec<Uuid>,
    pub parameters: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}
