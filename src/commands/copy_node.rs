//! copyNode handler - duplicate a file or a directory subtree
//!
//! Same-mount file copies are server-side; cross-mount copies stream the
//! source bytes into a staging file and store them on the target. Directory
//! copies traverse the source subtree once, keeping an old-id to new-id map
//! to rewire parents on the new side.

use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::{mounts, nodes, rollups};
use crate::domain::node::{Node, NodeKind};
use crate::domain::rollup::RollupDelta;
use crate::executors::{ExecutorContext, ExecutorOperation, StorageExecutor};
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::path;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Move one file's bytes between locations, possibly across mounts.
pub(super) async fn transfer_file(
    step: &StepContext<'_>,
    source_executor: &Arc<dyn StorageExecutor>,
    source_ctx: &ExecutorContext,
    target_executor: &Arc<dyn StorageExecutor>,
    target_ctx: &ExecutorContext,
    source_path: &str,
    target_path: &str,
) -> FilestoreResult<()> {
    if source_ctx.mount.id == target_ctx.mount.id {
        return step
            .run_executor(
                source_executor,
                &ExecutorOperation::CopyFile {
                    source_path: source_path.to_string(),
                    target_path: target_path.to_string(),
                },
                source_ctx,
            )
            .await;
    }

    // Stage locally so the target executor sees a plain file
    let staging = std::env::temp_dir().join(format!("filestore-transfer-{}", Uuid::new_v4()));
    let mut read = source_executor
        .create_read_stream(source_path, source_ctx, None)
        .await?;
    let mut file = tokio::fs::File::create(&staging).await?;
    while let Some(chunk) = read.stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    drop(file);

    let stored = step
        .run_executor(
            target_executor,
            &ExecutorOperation::StoreFile {
                path: target_path.to_string(),
                staging_path: staging.clone(),
            },
            target_ctx,
        )
        .await;
    if stored.is_err() {
        let _ = tokio::fs::remove_file(&staging).await;
    }
    stored
}

/// Cross-mount verification: the target must report the expected size.
/// On mismatch the partial target is deleted before the error surfaces.
pub(super) async fn verify_transfer(
    target_executor: &Arc<dyn StorageExecutor>,
    target_ctx: &ExecutorContext,
    target_path: &str,
    expected_size: i64,
) -> FilestoreResult<()> {
    let head = target_executor.head(target_path, target_ctx).await?;
    let matches = head
        .as_ref()
        .map(|info| info.size_bytes == expected_size)
        .unwrap_or(false);
    if !matches {
        let _ = target_executor
            .execute(
                &ExecutorOperation::Delete {
                    path: target_path.to_string(),
                    kind: NodeKind::File,
                    recursive: false,
                },
                target_ctx,
            )
            .await;
        return Err(FilestoreError::internal(format!(
            "transfer verification failed for '{target_path}'"
        )));
    }
    Ok(())
}

/// Reject copies/moves of a directory into its own subtree.
pub(super) fn guard_target_location(
    source: &Node,
    same_mount: bool,
    target_path: &str,
) -> FilestoreResult<()> {
    if same_mount && source.path == target_path {
        return Err(FilestoreError::invalid_request(
            "source and target paths are identical",
        ));
    }
    if same_mount && source.is_directory() && path::is_within(&source.path, target_path) {
        return Err(FilestoreError::invalid_request(format!(
            "target '{target_path}' is inside the source subtree"
        )));
    }
    Ok(())
}

/// Overwrite policy shared by copy and move: only file-over-file, and only
/// with the overwrite flag.
pub(super) fn check_overwrite(
    existing: &Option<Node>,
    source: &Node,
    overwrite: bool,
    target_path: &str,
) -> FilestoreResult<()> {
    if let Some(existing) = existing {
        if !overwrite || existing.is_directory() || source.is_directory() {
            return Err(FilestoreError::node_exists(format!(
                "node already exists at '{target_path}'"
            )));
        }
    }
    Ok(())
}

pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    source_path: &str,
    target_path: &str,
    target_backend_mount_id: Option<Uuid>,
    overwrite: bool,
) -> FilestoreResult<StepOutput> {
    let source_mount = mounts::require_mount(step.txn, backend_mount_id).await?;
    let target_mount = step
        .writable_mount(target_backend_mount_id.unwrap_or(backend_mount_id))
        .await?;
    let same_mount = source_mount.id == target_mount.id;

    let source_executor = step.executors.for_mount(&source_mount)?;
    let target_executor = step.executors.for_mount(&target_mount)?;
    let source_ctx = ExecutorContext {
        mount: source_mount.clone(),
    };
    let target_ctx = ExecutorContext {
        mount: target_mount.clone(),
    };
    let mut output = StepOutput::default();

    let source = nodes::get_node_by_path(step.txn, source_mount.id, source_path, true)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("no node at '{source_path}'")))?;

    guard_target_location(&source, same_mount, target_path)?;
    let existing_target =
        nodes::get_node_by_path(step.txn, target_mount.id, target_path, true).await?;
    check_overwrite(&existing_target, &source, overwrite, target_path)?;

    let parent = step
        .ensure_parent_directories(
            &target_executor,
            &target_ctx,
            &target_mount,
            target_path,
            &mut output,
        )
        .await?;

    if source.is_file() {
        transfer_file(
            step,
            &source_executor,
            &source_ctx,
            &target_executor,
            &target_ctx,
            &source.path,
            target_path,
        )
        .await?;
        if !same_mount {
            verify_transfer(&target_executor, &target_ctx, target_path, source.size_bytes).await?;
        }

        let node = match existing_target {
            Some(old) => {
                let node = nodes::update_node_content(
                    step.txn,
                    old.id,
                    source.size_bytes,
                    source.checksum.clone(),
                    source.content_hash.clone(),
                    Some(source.metadata.clone()),
                )
                .await?;
                if let Some(parent_node) = &parent {
                    let pending = step
                        .rollups
                        .apply_for_mutation(
                            step.txn,
                            parent_node,
                            RollupDelta {
                                size_bytes: source.size_bytes - old.size_bytes,
                                file_count: 0,
                                directory_count: 0,
                                child_count: 0,
                            },
                            false,
                        )
                        .await?;
                    output.pending_rollups.extend(pending);
                }
                output.lifecycle.push((Lifecycle::Updated, node.clone()));
                node
            }
            None => {
                let mut new = nodes::NewNode::directory(
                    target_mount.id,
                    parent.as_ref().map(|p| p.id),
                    target_path,
                );
                new.kind = NodeKind::File;
                new.size_bytes = source.size_bytes;
                new.checksum = source.checksum.clone();
                new.content_hash = source.content_hash.clone();
                new.is_symlink = source.is_symlink;
                new.metadata = source.metadata.clone();
                let node = nodes::insert_node(step.txn, new).await?;
                if let Some(parent_node) = &parent {
                    let pending = step
                        .rollups
                        .apply_for_mutation(
                            step.txn,
                            parent_node,
                            RollupDelta {
                                size_bytes: source.size_bytes,
                                file_count: 1,
                                directory_count: 0,
                                child_count: 1,
                            },
                            false,
                        )
                        .await?;
                    output.pending_rollups.extend(pending);
                }
                output.lifecycle.push((Lifecycle::Created, node.clone()));
                node
            }
        };
        step.snapshot(&node).await?;

        output.result = serde_json::json!({
            "sourcePath": source.path,
            "targetPath": target_path,
            "copiedNodes": 1,
        });
        output.affected.push(node.id);
        output.lifecycle.push((Lifecycle::Copied, node.clone()));
        output.primary = Some(node);
        output.secondary = Some(source);
        return Ok(output);
    }

    // Directory copy: one traversal, shallowest first
    let subtree =
        nodes::list_subtree_by_path(step.txn, source_mount.id, &source.path, None).await?;
    let mut id_map: HashMap<Uuid, Uuid> = HashMap::new();
    let mut created_dirs: Vec<Uuid> = Vec::new();
    let mut new_root: Option<Node> = None;
    let mut total_size: i64 = 0;
    let mut total_dirs: i64 = 0;

    for entry in &subtree {
        let new_path = if entry.path == source.path {
            target_path.to_string()
        } else {
            path::join_path(target_path, &entry.path[source.path.len() + 1..])
        };
        let new_parent_id = if entry.path == source.path {
            parent.as_ref().map(|p| p.id)
        } else {
            entry.parent_id.and_then(|old| id_map.get(&old).copied())
        };

        match entry.kind {
            NodeKind::Directory => {
                step.run_executor(
                    &target_executor,
                    &ExecutorOperation::CreateDirectory {
                        path: new_path.clone(),
                    },
                    &target_ctx,
                )
                .await?;
                let mut new = nodes::NewNode::directory(target_mount.id, new_parent_id, &new_path);
                new.metadata = entry.metadata.clone();
                let node = nodes::insert_node(step.txn, new).await?;
                id_map.insert(entry.id, node.id);
                created_dirs.push(node.id);
                total_dirs += 1;
                output.affected.push(node.id);
                if entry.path == source.path {
                    new_root = Some(node);
                }
            }
            NodeKind::File => {
                transfer_file(
                    step,
                    &source_executor,
                    &source_ctx,
                    &target_executor,
                    &target_ctx,
                    &entry.path,
                    &new_path,
                )
                .await?;
                if !same_mount {
                    verify_transfer(&target_executor, &target_ctx, &new_path, entry.size_bytes)
                        .await?;
                }
                let mut new =
                    nodes::NewNode::directory(target_mount.id, new_parent_id, &new_path);
                new.kind = NodeKind::File;
                new.size_bytes = entry.size_bytes;
                new.checksum = entry.checksum.clone();
                new.content_hash = entry.content_hash.clone();
                new.is_symlink = entry.is_symlink;
                new.metadata = entry.metadata.clone();
                let node = nodes::insert_node(step.txn, new).await?;
                total_size += entry.size_bytes;
                output.affected.push(node.id);
            }
        }
    }

    let new_root = new_root
        .ok_or_else(|| FilestoreError::internal("directory copy produced no root node"))?;

    // Fresh rollup rows for the copied directories: small trees settle
    // inside the transaction (deepest first), large ones defer to the pool
    let defer = subtree.len() as i64 > step.rollups.defer_item_threshold();
    if defer {
        output.pending_rollups.extend(created_dirs.iter().rev());
    } else {
        for dir_id in created_dirs.iter().rev() {
            rollups::recalculate(step.txn, *dir_id).await?;
        }
    }

    if let Some(parent_node) = &parent {
        let pending = step
            .rollups
            .apply_for_mutation(
                step.txn,
                parent_node,
                RollupDelta {
                    size_bytes: total_size,
                    file_count: 0,
                    directory_count: total_dirs,
                    child_count: 1,
                },
                defer,
            )
            .await?;
        output.pending_rollups.extend(pending);
    }

    step.snapshot(&new_root).await?;
    output.result = serde_json::json!({
        "sourcePath": source.path,
        "targetPath": target_path,
        "copiedNodes": subtree.len(),
    });
    output.lifecycle.push((Lifecycle::Created, new_root.clone()));
    output.lifecycle.push((Lifecycle::Copied, new_root.clone()));
    output.primary = Some(new_root);
    output.secondary = Some(source);
    Ok(output)
}
