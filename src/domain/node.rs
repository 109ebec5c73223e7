//! Node - the file/directory catalog entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Kind of catalog entry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Lifecycle state of a node
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeState {
    Active,
    Inconsistent,
    Missing,
    Deleted,
}

impl NodeState {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Consistency state derived on writes when the caller supplies no override
    pub fn derived_consistency(&self) -> ConsistencyState {
        match self {
            Self::Active => ConsistencyState::Active,
            Self::Inconsistent => ConsistencyState::Inconsistent,
            Self::Missing | Self::Deleted => ConsistencyState::Missing,
        }
    }
}

/// Reconciliation-facing view of a node: whether the catalog row matches the
/// bytes the backend actually holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConsistencyState {
    Active,
    Inconsistent,
    Missing,
}

/// A file or directory within a backend mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: Uuid,
    pub backend_mount_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub name: String,
    pub depth: i32,
    pub kind: NodeKind,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub content_hash: Option<String>,
    pub is_symlink: bool,
    pub state: NodeState,
    pub consistency_state: ConsistencyState,
    pub version: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub consistency_checked_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub last_drift_detected_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }
}
