//! Event bus and taxonomy for lifecycle notifications

use crate::domain::node::{Node, NodeKind, NodeState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod filter;
pub mod publisher;
pub mod sse;

pub use filter::EventFilter;
pub use publisher::{EventPublisher, EventsMode, PublisherStatus};
pub use sse::{SseDispatcher, SseFrame, SseSettings};

/// Command context attached to every payload derived from a command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContext {
    pub journal_id: Option<Uuid>,
    pub command: Option<String>,
    pub idempotency_key: Option<String>,
    pub principal: Option<String>,
}

/// Node-shaped event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEventPayload {
    pub backend_mount_id: Uuid,
    pub node_id: Option<Uuid>,
    pub path: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub parent_id: Option<Uuid>,
    pub version: i64,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub content_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub observed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub context: CommandContext,
}

impl NodeEventPayload {
    pub fn from_node(node: &Node, context: CommandContext) -> Self {
        Self {
            backend_mount_id: node.backend_mount_id,
            node_id: Some(node.id),
            path: node.path.clone(),
            kind: node.kind,
            state: node.state,
            parent_id: node.parent_id,
            version: node.version,
            size_bytes: node.size_bytes,
            checksum: node.checksum.clone(),
            content_hash: node.content_hash.clone(),
            metadata: node.metadata.clone(),
            observed_at: Utc::now(),
            context,
        }
    }
}

/// Payload of `command.completed`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompletedPayload {
    pub journal_id: Uuid,
    pub command: String,
    pub status: String,
    pub backend_mount_id: Option<Uuid>,
    pub node_id: Option<Uuid>,
    pub path: Option<String>,
    pub idempotency_key: Option<String>,
    pub principal: Option<String>,
    pub result: serde_json::Value,
    pub observed_at: DateTime<Utc>,
}

/// Payload of `reconciliation.job.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationJobPayload {
    pub job_id: Uuid,
    pub job_key: String,
    pub backend_mount_id: Uuid,
    pub node_id: Option<Uuid>,
    pub path: String,
    pub reason: String,
    pub status: String,
    pub attempt: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

/// All events the core publishes.
///
/// The serialized form is `{"type": "<domain>.<subject>.<verb>", "data": …}`,
/// identical in-process and on the wire; the cross-process transport only
/// adds an `origin` wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FilestoreEvent {
    #[serde(rename = "command.completed")]
    CommandCompleted(CommandCompletedPayload),
    #[serde(rename = "node.created")]
    NodeCreated(NodeEventPayload),
    #[serde(rename = "node.updated")]
    NodeUpdated(NodeEventPayload),
    #[serde(rename = "node.deleted")]
    NodeDeleted(NodeEventPayload),
    #[serde(rename = "node.uploaded")]
    NodeUploaded(NodeEventPayload),
    #[serde(rename = "node.copied")]
    NodeCopied(NodeEventPayload),
    #[serde(rename = "node.moved")]
    NodeMoved(NodeEventPayload),
    #[serde(rename = "node.downloaded")]
    NodeDownloaded(NodeEventPayload),
    #[serde(rename = "node.missing")]
    NodeMissing(NodeEventPayload),
    #[serde(rename = "node.reconciled")]
    NodeReconciled(NodeEventPayload),
    #[serde(rename = "drift.detected")]
    DriftDetected(NodeEventPayload),
    #[serde(rename = "reconciliation.job.queued")]
    ReconciliationJobQueued(ReconciliationJobPayload),
    #[serde(rename = "reconciliation.job.started")]
    ReconciliationJobStarted(ReconciliationJobPayload),
    #[serde(rename = "reconciliation.job.completed")]
    ReconciliationJobCompleted(ReconciliationJobPayload),
    #[serde(rename = "reconciliation.job.failed")]
    ReconciliationJobFailed(ReconciliationJobPayload),
    #[serde(rename = "reconciliation.job.cancelled")]
    ReconciliationJobCancelled(ReconciliationJobPayload),
}

impl FilestoreEvent {
    /// Dotted event type string, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CommandCompleted(_) => "command.completed",
            Self::NodeCreated(_) => "node.created",
            Self::NodeUpdated(_) => "node.updated",
            Self::NodeDeleted(_) => "node.deleted",
            Self::NodeUploaded(_) => "node.uploaded",
            Self::NodeCopied(_) => "node.copied",
            Self::NodeMoved(_) => "node.moved",
            Self::NodeDownloaded(_) => "node.downloaded",
            Self::NodeMissing(_) => "node.missing",
            Self::NodeReconciled(_) => "node.reconciled",
            Self::DriftDetected(_) => "drift.detected",
            Self::ReconciliationJobQueued(_) => "reconciliation.job.queued",
            Self::ReconciliationJobStarted(_) => "reconciliation.job.started",
            Self::ReconciliationJobCompleted(_) => "reconciliation.job.completed",
            Self::ReconciliationJobFailed(_) => "reconciliation.job.failed",
            Self::ReconciliationJobCancelled(_) => "reconciliation.job.cancelled",
        }
    }

    /// Mount the event refers to, when it refers to one
    pub fn backend_mount_id(&self) -> Option<Uuid> {
        match self {
            Self::CommandCompleted(payload) => payload.backend_mount_id,
            Self::NodeCreated(payload)
            | Self::NodeUpdated(payload)
            | Self::NodeDeleted(payload)
            | Self::NodeUploaded(payload)
            | Self::NodeCopied(payload)
            | Self::NodeMoved(payload)
            | Self::NodeDownloaded(payload)
            | Self::NodeMissing(payload)
            | Self::NodeReconciled(payload)
            | Self::DriftDetected(payload) => Some(payload.backend_mount_id),
            Self::ReconciliationJobQueued(payload)
            | Self::ReconciliationJobStarted(payload)
            | Self::ReconciliationJobCompleted(payload)
            | Self::ReconciliationJobFailed(payload)
            | Self::ReconciliationJobCancelled(payload) => Some(payload.backend_mount_id),
        }
    }

    /// Path the event refers to, when it refers to one
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::CommandCompleted(payload) => payload.path.as_deref(),
            Self::NodeCreated(payload)
            | Self::NodeUpdated(payload)
            | Self::NodeDeleted(payload)
            | Self::NodeUploaded(payload)
            | Self::NodeCopied(payload)
            | Self::NodeMoved(payload)
            | Self::NodeDownloaded(payload)
            | Self::NodeMissing(payload)
            | Self::NodeReconciled(payload)
            | Self::DriftDetected(payload) => Some(&payload.path),
            Self::ReconciliationJobQueued(payload)
            | Self::ReconciliationJobStarted(payload)
            | Self::ReconciliationJobCompleted(payload)
            | Self::ReconciliationJobFailed(payload)
            | Self::ReconciliationJobCancelled(payload) => Some(&payload.path),
        }
    }
}

/// Event bus for broadcasting events to in-process subscribers
pub struct EventBus {
    sender: broadcast::Sender<FilestoreEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: FilestoreEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<FilestoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(path: &str) -> NodeEventPayload {
        NodeEventPayload {
            backend_mount_id: Uuid::new_v4(),
            node_id: Some(Uuid::new_v4()),
            path: path.to_string(),
            kind: NodeKind::Directory,
            state: NodeState::Active,
            parent_id: None,
            version: 1,
            size_bytes: 0,
            checksum: None,
            content_hash: None,
            metadata: serde_json::json!({}),
            observed_at: Utc::now(),
            context: CommandContext::default(),
        }
    }

    #[test]
    fn serialized_type_tag_matches_event_type() {
        let event = FilestoreEvent::NodeCreated(sample_payload("datasets/a"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
        assert_eq!(value["data"]["path"], "datasets/a");
        assert!(value["data"]["observedAt"].is_string());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(FilestoreEvent::NodeCreated(sample_payload("x")));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "node.created");
    }
}
