//! Command orchestrator
//!
//! The per-command pipeline: validate, idempotency pre-check, transaction
//! with a running journal entry, preconditions, executor side effect,
//! metadata mutation, rollup deltas, journal finalization, commit, events.

use crate::catalog::{journal, mounts, nodes, snapshots};
use crate::config::SnapshotsConfig;
use crate::domain::command::{Command, CommandOutcome};
use crate::domain::journal::JournalStatus;
use crate::domain::mount::BackendMount;
use crate::domain::node::Node;
use crate::domain::rollup::RollupDelta;
use crate::executors::{ExecutorContext, ExecutorOperation, ExecutorRegistry, StorageExecutor};
use crate::infrastructure::events::{
    CommandCompletedPayload, CommandContext, EventPublisher, FilestoreEvent, NodeEventPayload,
};
use crate::rollups::RollupManager;
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::path;
use chrono::Utc;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

mod copy_node;
mod create_directory;
mod delete_node;
mod move_node;
mod update_metadata;
mod upload_file;
mod write_file;

#[cfg(test)]
mod tests;

/// A command invocation with its caller context
#[derive(Debug, Clone)]
pub struct RunCommandRequest {
    pub command: Command,
    pub principal: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    /// Budget for backend i/o; exceeding it rolls the command back
    pub deadline: Option<Duration>,
}

impl RunCommandRequest {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            principal: None,
            idempotency_key: None,
            correlation_id: None,
            deadline: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Lifecycle verbs a handler may emit, in its chosen (deterministic) order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Updated,
    Uploaded,
    Copied,
    Moved,
    Deleted,
}

/// What a handler produced inside the transaction
#[derive(Debug, Default)]
pub(crate) struct StepOutput {
    pub primary: Option<Node>,
    pub secondary: Option<Node>,
    pub affected: Vec<Uuid>,
    pub lifecycle: Vec<(Lifecycle, Node)>,
    pub result: serde_json::Value,
    /// Rollups left `pending`; recomputes are scheduled after commit
    pub pending_rollups: Vec<Uuid>,
}

/// Shared state handed to the per-variant handlers
pub(crate) struct StepContext<'a> {
    pub txn: &'a DatabaseTransaction,
    pub executors: &'a ExecutorRegistry,
    pub rollups: &'a RollupManager,
    pub snapshots_enabled: bool,
    pub deadline: Option<Duration>,
}

impl StepContext<'_> {
    /// Run a backend side effect under the caller's deadline.
    pub async fn run_executor(
        &self,
        executor: &Arc<dyn StorageExecutor>,
        operation: &ExecutorOperation,
        ctx: &ExecutorContext,
    ) -> FilestoreResult<()> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, executor.execute(operation, ctx))
                .await
                .map_err(|_| FilestoreError::internal("backend deadline exceeded"))?,
            None => executor.execute(operation, ctx).await,
        }
    }

    pub async fn snapshot(&self, node: &Node) -> FilestoreResult<()> {
        if self.snapshots_enabled {
            snapshots::capture_snapshot(self.txn, node).await?;
        }
        Ok(())
    }

    /// Resolve a writable mount or fail.
    pub async fn writable_mount(&self, mount_id: Uuid) -> FilestoreResult<BackendMount> {
        let mount = mounts::require_mount(self.txn, mount_id).await?;
        if !mount.is_writable() {
            return Err(FilestoreError::invalid_request(format!(
                "backend mount '{}' is read-only",
                mount.mount_key
            )));
        }
        Ok(mount)
    }

    /// Walk the ancestor chain of `target_path`, creating missing
    /// directories on the backend and in the catalog. Returns the immediate
    /// parent (None at mount root).
    pub async fn ensure_parent_directories(
        &self,
        executor: &Arc<dyn StorageExecutor>,
        exec_ctx: &ExecutorContext,
        mount: &BackendMount,
        target_path: &str,
        output: &mut StepOutput,
    ) -> FilestoreResult<Option<Node>> {
        let mut parent: Option<Node> = None;
        for ancestor_path in path::ancestor_paths(target_path) {
            if let Some(existing) =
                nodes::get_node_by_path(self.txn, mount.id, &ancestor_path, true).await?
            {
                if existing.is_file() {
                    return Err(FilestoreError::not_a_directory(format!(
                        "'{ancestor_path}' is a file"
                    )));
                }
                parent = Some(existing);
                continue;
            }

            self.run_executor(
                executor,
                &ExecutorOperation::CreateDirectory {
                    path: ancestor_path.clone(),
                },
                exec_ctx,
            )
            .await?;
            let node = nodes::insert_node(
                self.txn,
                nodes::NewNode::directory(
                    mount.id,
                    parent.as_ref().map(|p| p.id),
                    &ancestor_path,
                ),
            )
            .await?;
            self.snapshot(&node).await?;
            if let Some(parent_node) = &parent {
                let pending = self
                    .rollups
                    .apply_for_mutation(
                        self.txn,
                        parent_node,
                        RollupDelta {
                            size_bytes: 0,
                            file_count: 0,
                            directory_count: 1,
                            child_count: 1,
                        },
                        false,
                    )
                    .await?;
                output.pending_rollups.extend(pending);
            }
            output.affected.push(node.id);
            output.lifecycle.push((Lifecycle::Created, node.clone()));
            parent = Some(node);
        }
        Ok(parent)
    }
}

/// Core state machine tying the catalog, executors, rollups, and events
/// together.
pub struct CommandOrchestrator {
    db: DatabaseConnection,
    executors: Arc<ExecutorRegistry>,
    rollups: Arc<RollupManager>,
    publisher: Arc<EventPublisher>,
    snapshots: SnapshotsConfig,
}

impl CommandOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        executors: Arc<ExecutorRegistry>,
        rollups: Arc<RollupManager>,
        publisher: Arc<EventPublisher>,
        snapshots: SnapshotsConfig,
    ) -> Self {
        Self {
            db,
            executors,
            rollups,
            publisher,
            snapshots,
        }
    }

    /// Run one command through the full pipeline.
    pub async fn run_command(&self, request: RunCommandRequest) -> FilestoreResult<CommandOutcome> {
        let command = normalize_command(request.command.clone())?;
        let kind = command.kind();
        let parameters = serde_json::to_value(&command)?;

        // Idempotency pre-check against the journal
        let mut rearm_entry_id = None;
        if let Some(key) = &request.idempotency_key {
            if let Some(entry) =
                journal::find_by_idempotency_key(&self.db, kind, key).await?
            {
                match entry.status {
                    JournalStatus::Succeeded => {
                        if entry.parameters != parameters {
                            return Err(idempotency_parameter_conflict(kind, key));
                        }
                        info!("Replaying '{kind}' from journal entry {}", entry.id);
                        let node = match entry.primary_node_id {
                            Some(node_id) => {
                                nodes::get_node_by_id(&self.db, node_id, false).await?
                            }
                            None => None,
                        };
                        return Ok(CommandOutcome {
                            journal_entry_id: Some(entry.id),
                            idempotent: true,
                            node,
                            result: entry.result.unwrap_or_else(|| serde_json::json!({})),
                        });
                    }
                    JournalStatus::Failed | JournalStatus::Canceled => {
                        if entry.parameters != parameters {
                            return Err(idempotency_parameter_conflict(kind, key));
                        }
                        rearm_entry_id = Some(entry.id);
                    }
                    JournalStatus::Queued | JournalStatus::Running => {
                        return Err(FilestoreError::idempotency_conflict(format!(
                            "command '{kind}' with this idempotency key is still in flight"
                        )));
                    }
                }
            }
        }

        // Deleting an already-deleted node without a key leaves no trace
        if request.idempotency_key.is_none() {
            if let Command::DeleteNode {
                backend_mount_id,
                path,
                ..
            } = &command
            {
                if nodes::get_node_by_path(&self.db, *backend_mount_id, path, false)
                    .await?
                    .is_none()
                {
                    if let Some(prior) =
                        nodes::get_node_by_path_any(&self.db, *backend_mount_id, path).await?
                    {
                        if prior.is_deleted() {
                            return Ok(CommandOutcome {
                                journal_entry_id: None,
                                idempotent: true,
                                node: Some(prior),
                                result: serde_json::json!({ "deleted": false }),
                            });
                        }
                    }
                }
            }
        }

        let txn = self.db.begin().await?;
        let entry = match rearm_entry_id {
            Some(id) => journal::rearm_entry(&txn, id).await?,
            None => {
                journal::insert_entry(
                    &txn,
                    journal::NewJournalEntry {
                        command: kind.to_string(),
                        principal: request.principal.clone(),
                        idempotency_key: request.idempotency_key.clone(),
                        correlation_id: request.correlation_id.clone(),
                        parameters: parameters.clone(),
                    },
                )
                .await?
            }
        };

        let step = StepContext {
            txn: &txn,
            executors: &self.executors,
            rollups: &self.rollups,
            snapshots_enabled: self.snapshots.enabled,
            deadline: request.deadline,
        };

        let started = std::time::Instant::now();
        let handled = self.dispatch(&step, &command).await;
        let output = match handled {
            Ok(output) => output,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!("Rollback after '{kind}' failure also failed: {rollback_err}");
                }
                // Follow-on statement outside the aborted transaction
                if let Err(journal_err) =
                    journal::mark_failed(&self.db, entry.id, err.to_json()).await
                {
                    error!("Recording '{kind}' failure in journal failed: {journal_err}");
                }
                warn!("Command '{kind}' failed: {err}");
                return Err(err);
            }
        };

        let primary_id = output.primary.as_ref().map(|node| node.id);
        let secondary_id = output.secondary.as_ref().map(|node| node.id);
        journal::mark_succeeded(
            &txn,
            entry.id,
            output.result.clone(),
            primary_id,
            secondary_id,
            &output.affected,
        )
        .await?;

        // The commit is the only success signal
        txn.commit().await?;
        info!(
            "Command '{kind}' succeeded in {}ms (journal {})",
            started.elapsed().as_millis(),
            entry.id
        );

        for node_id in &output.pending_rollups {
            self.rollups.schedule_recalculate(*node_id);
        }

        self.publish_events(&entry.id, kind, &request, &output).await;

        Ok(CommandOutcome {
            journal_entry_id: Some(entry.id),
            idempotent: false,
            node: output.primary,
            result: output.result,
        })
    }

    async fn dispatch(
        &self,
        step: &StepContext<'_>,
        command: &Command,
    ) -> FilestoreResult<StepOutput> {
        match command.clone() {
            Command::CreateDirectory {
                backend_mount_id,
                path,
                metadata,
            } => create_directory::execute(step, backend_mount_id, &path, metadata).await,
            Command::UploadFile {
                backend_mount_id,
                path,
                staging_path,
                size_bytes,
                checksum,
                content_hash,
                mime_type,
                original_name,
                metadata,
            } => {
                upload_file::execute(
                    step,
                    backend_mount_id,
                    &path,
                    &staging_path,
                    size_bytes,
                    checksum,
                    content_hash,
                    mime_type,
                    original_name,
                    metadata,
                )
                .await
            }
            Command::WriteFile {
                node_id,
                staging_path,
                size_bytes,
                checksum,
                content_hash,
                mime_type,
                metadata,
            } => {
                write_file::execute(
                    step,
                    node_id,
                    &staging_path,
                    size_bytes,
                    checksum,
                    content_hash,
                    mime_type,
                    metadata,
                )
                .await
            }
            Command::CopyNode {
                backend_mount_id,
                path,
                target_path,
                target_backend_mount_id,
                overwrite,
            } => {
                copy_node::execute(
                    step,
                    backend_mount_id,
                    &path,
                    &target_path,
                    target_backend_mount_id,
                    overwrite,
                )
                .await
            }
            Command::MoveNode {
                backend_mount_id,
                path,
                target_path,
                target_backend_mount_id,
                overwrite,
            } => {
                move_node::execute(
                    step,
                    backend_mount_id,
                    &path,
                    &target_path,
                    target_backend_mount_id,
                    overwrite,
                )
                .await
            }
            Command::DeleteNode {
                backend_mount_id,
                path,
                recursive,
            } => delete_node::execute(step, backend_mount_id, &path, recursive).await,
            Command::UpdateNodeMetadata {
                backend_mount_id,
                node_id,
                set,
                unset,
            } => update_metadata::execute(step, backend_mount_id, node_id, set, unset).await,
        }
    }

    /// Emit `command.completed` then the derived lifecycle events, in the
    /// handler's deterministic order.
    async fn publish_events(
        &self,
        journal_id: &Uuid,
        kind: &str,
        request: &RunCommandRequest,
        output: &StepOutput,
    ) {
        let context = CommandContext {
            journal_id: Some(*journal_id),
            command: Some(kind.to_string()),
            idempotency_key: request.idempotency_key.clone(),
            principal: request.principal.clone(),
        };

        let primary = output.primary.as_ref();
        self.publisher
            .publish(FilestoreEvent::CommandCompleted(CommandCompletedPayload {
                journal_id: *journal_id,
                command: kind.to_string(),
                status: JournalStatus::Succeeded.to_string(),
                backend_mount_id: primary.map(|node| node.backend_mount_id),
                node_id: primary.map(|node| node.id),
                path: primary.map(|node| node.path.clone()),
                idempotency_key: request.idempotency_key.clone(),
                principal: request.principal.clone(),
                result: output.result.clone(),
                observed_at: Utc::now(),
            }))
            .await;

        for (lifecycle, node) in &output.lifecycle {
            let payload = NodeEventPayload::from_node(node, context.clone());
            let event = match lifecycle {
                Lifecycle::Created => FilestoreEvent::NodeCreated(payload),
                Lifecycle::Updated => FilestoreEvent::NodeUpdated(payload),
                Lifecycle::Uploaded => FilestoreEvent::NodeUploaded(payload),
                Lifecycle::Copied => FilestoreEvent::NodeCopied(payload),
                Lifecycle::Moved => FilestoreEvent::NodeMoved(payload),
                Lifecycle::Deleted => FilestoreEvent::NodeDeleted(payload),
            };
            self.publisher.publish(event).await;
        }
    }
}

fn idempotency_parameter_conflict(kind: &str, key: &str) -> FilestoreError {
    FilestoreError::idempotency_conflict(format!(
        "command '{kind}' was journaled under key '{key}' with different parameters"
    ))
}

/// Normalize every path-valued input exactly once, up front.
fn normalize_command(command: Command) -> FilestoreResult<Command> {
    Ok(match command {
        Command::CreateDirectory {
            backend_mount_id,
            path,
            metadata,
        } => Command::CreateDirectory {
            backend_mount_id,
            path: path::normalize_path(&path)?,
            metadata,
        },
        Command::UploadFile {
            backend_mount_id,
            path,
            staging_path,
            size_bytes,
            checksum,
            content_hash,
            mime_type,
            original_name,
            metadata,
        } => Command::UploadFile {
            backend_mount_id,
            path: path::normalize_path(&path)?,
            staging_path,
            size_bytes,
            checksum,
            content_hash,
            mime_type,
            original_name,
            metadata,
        },
        Command::CopyNode {
            backend_mount_id,
            path,
            target_path,
            target_backend_mount_id,
            overwrite,
        } => Command::CopyNode {
            backend_mount_id,
            path: path::normalize_path(&path)?,
            target_path: path::normalize_path(&target_path)?,
            target_backend_mount_id,
            overwrite,
        },
        Command::MoveNode {
            backend_mount_id,
            path,
            target_path,
            target_backend_mount_id,
            overwrite,
        } => Command::MoveNode {
            backend_mount_id,
            path: path::normalize_path(&path)?,
            target_path: path::normalize_path(&target_path)?,
            target_backend_mount_id,
            overwrite,
        },
        Command::DeleteNode {
            backend_mount_id,
            path,
            recursive,
        } => Command::DeleteNode {
            backend_mount_id,
            path: path::normalize_path(&path)?,
            recursive,
        },
        other @ (Command::WriteFile { .. } | Command::UpdateNodeMetadata { .. }) => other,
    })
}
