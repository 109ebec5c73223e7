//! Command variants accepted by the orchestrator

use crate::domain::node::Node;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A client command against the namespace.
///
/// Tagged on `type`; payload field names match the wire shapes the external
/// adapters use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    CreateDirectory {
        backend_mount_id: Uuid,
        path: String,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    UploadFile {
        backend_mount_id: Uuid,
        path: String,
        staging_path: PathBuf,
        size_bytes: i64,
        #[serde(default)]
        checksum: Option<String>,
        #[serde(default)]
        content_hash: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        original_name: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    WriteFile {
        node_id: Uuid,
        staging_path: PathBuf,
        size_bytes: i64,
        #[serde(default)]
        checksum: Option<String>,
        #[serde(default)]
        content_hash: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    CopyNode {
        backend_mount_id: Uuid,
        path: String,
        target_path: String,
        #[serde(default)]
        target_backend_mount_id: Option<Uuid>,
        #[serde(default)]
        overwrite: bool,
    },
    MoveNode {
        backend_mount_id: Uuid,
        path: String,
        target_path: String,
        #[serde(default)]
        target_backend_mount_id: Option<Uuid>,
        #[serde(default)]
        overwrite: bool,
    },
    DeleteNode {
        backend_mount_id: Uuid,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    UpdateNodeMetadata {
        backend_mount_id: Uuid,
        node_id: Uuid,
        #[serde(default)]
        set: Option<serde_json::Map<String, serde_json::Value>>,
        #[serde(default)]
        unset: Option<Vec<String>>,
    },
}

impl Command {
    /// Stable identifier for journaling and idempotency keys
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateDirectory { .. } => "directory.create",
            Self::UploadFile { .. } => "file.upload",
            Self::WriteFile { .. } => "file.write",
            Self::CopyNode { .. } => "node.copy",
            Self::MoveNode { .. } => "node.move",
            Self::DeleteNode { .. } => "node.delete",
            Self::UpdateNodeMetadata { .. } => "node.update-metadata",
        }
    }

    /// The mount the command addresses directly, if any.
    ///
    /// `WriteFile` resolves its mount through the node row instead.
    pub fn backend_mount_id(&self) -> Option<Uuid> {
        match self {
            Self::CreateDirectory { backend_mount_id, .. }
            | Self::UploadFile { backend_mount_id, .. }
            | Self::CopyNode { backend_mount_id, .. }
            | Self::MoveNode { backend_mount_id, .. }
            | Self::DeleteNode { backend_mount_id, .. }
            | Self::UpdateNodeMetadata { backend_mount_id, .. } => Some(*backend_mount_id),
            Self::WriteFile { .. } => None,
        }
    }
}

/// Result of a completed (or replayed) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    /// Journal entry recording the command. `None` only for the journal-free
    /// idempotent no-op (deleting an already-deleted node without a key).
    pub journal_entry_id: Option<Uuid>,
    pub idempotent: bool,
    pub node: Option<Node>,
    pub result: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_tag_on_type() {
        let cmd = Command::CreateDirectory {
            backend_mount_id: Uuid::nil(),
            path: "datasets".into(),
            metadata: None,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], "createDirectory");
        assert_eq!(value["backendMountId"], Uuid::nil().to_string());
        assert_eq!(cmd.kind(), "directory.create");
    }

    #[test]
    fn delete_defaults_to_non_recursive() {
        let cmd: Command = serde_json::from_value(serde_json::json!({
            "type": "deleteNode",
            "backendMountId": Uuid::nil(),
            "path": "a/b",
        }))
        .unwrap();
        match cmd {
            Command::DeleteNode { recursive, .. } => assert!(!recursive),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
