//! moveNode handler - relocate a node or subtree, possibly across mounts
//!
//! Same-mount moves rename on the backend and rewrite descendant rows in a
//! single bulk statement. Cross-mount moves are copy, verify, then delete on
//! the source; a failed verification deletes the partial target.

use super::copy_node::{check_overwrite, guard_target_location, transfer_file, verify_transfer};
use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::{nodes, rollups};
use crate::domain::node::{Node, NodeKind, NodeState};
use crate::domain::rollup::{RollupDelta, RollupState};
use crate::executors::{ExecutorContext, ExecutorOperation};
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::path;
use uuid::Uuid;

pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    source_path: &str,
    target_path: &str,
    target_backend_mount_id: Option<Uuid>,
    overwrite: bool,
) -> FilestoreResult<StepOutput> {
    // Both sides mutate, so both mounts must be writable
    let source_mount = step.writable_mount(backend_mount_id).await?;
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

    // An overwritten target must leave the live path slot before the moved
    // node can take it
    if let Some(old_target) = existing_target {
        let deleted = nodes::update_node_state(
            step.txn,
            old_target.id,
            NodeState::Deleted,
            nodes::StateTransition::default(),
        )
        .await?;
        step.rollups.invalidate_node(step.txn, deleted.id).await?;
        if let Some(parent_node) = &parent {
            let pending = step
                .rollups
                .apply_for_mutation(
                    step.txn,
                    parent_node,
                    RollupDelta {
                        size_bytes: -old_target.size_bytes,
                        file_count: -1,
                        directory_count: 0,
                        child_count: -1,
                    },
                    false,
                )
                .await?;
            output.pending_rollups.extend(pending);
        }
        output.affected.push(deleted.id);
        output.lifecycle.push((Lifecycle::Deleted, deleted));
    }

    // Removal totals for the source parent, captured before the move
    let (removal_delta, defer) = removal_delta_for(step, &source).await?;

    if same_mount {
        step.run_executor(
            &source_executor,
            &ExecutorOperation::Rename {
                from_path: source.path.clone(),
                to_path: target_path.to_string(),
                kind: source.kind,
            },
            &source_ctx,
        )
        .await?;
    } else {
        copy_bytes_across(step, &source, &source_ctx, &target_ctx, target_path).await?;
        // Source bytes go last; the copy is already verified
        step.run_executor(
            &source_executor,
            &ExecutorOperation::Delete {
                path: source.path.clone(),
                kind: source.kind,
                recursive: true,
            },
            &source_ctx,
        )
        .await?;
    }

    // Relocate the root row, then rewrite every live descendant in one
    // statement
    if source.is_directory() {
        nodes::relocate_subtree(
            step.txn,
            source_mount.id,
            &source.path,
            target_mount.id,
            target_path,
        )
        .await?;
    }
    let moved = nodes::update_node_location(
        step.txn,
        source.id,
        target_mount.id,
        parent.as_ref().map(|p| p.id),
        target_path,
    )
    .await?;
    step.snapshot(&moved).await?;

    // Source parent loses the subtree, target parent gains it
    if let Some(source_parent_id) = source.parent_id {
        if let Some(source_parent) =
            nodes::get_node_by_id(step.txn, source_parent_id, true).await?
        {
            let pending = step
                .rollups
                .apply_for_mutation(step.txn, &source_parent, removal_delta.inverted(), defer)
                .await?;
            output.pending_rollups.extend(pending);
        }
    }
    if let Some(parent_node) = &parent {
        let pending = step
            .rollups
            .apply_for_mutation(step.txn, parent_node, removal_delta, defer)
            .await?;
        output.pending_rollups.extend(pending);
    }

    output.result = serde_json::json!({
        "sourcePath": source.path,
        "targetPath": target_path,
        "crossMount": !same_mount,
    });
    output.affected.push(moved.id);
    output.lifecycle.push((Lifecycle::Updated, moved.clone()));
    output.lifecycle.push((Lifecycle::Moved, moved.clone()));
    output.primary = Some(moved);
    Ok(output)
}

/// What the target parent gains (and the source parent loses, inverted).
async fn removal_delta_for(
    step: &StepContext<'_>,
    source: &Node,
) -> FilestoreResult<(RollupDelta, bool)> {
    match source.kind {
        NodeKind::File => Ok((
            RollupDelta {
                size_bytes: source.size_bytes,
                file_count: 1,
                directory_count: 0,
                child_count: 1,
            },
            false,
        )),
        NodeKind::Directory => {
            let summary = rollups::ensure_rollup(step.txn, source.id).await?;
            let defer = summary.state != RollupState::UpToDate;
            Ok((
                RollupDelta {
                    size_bytes: summary.size_bytes,
                    file_count: 0,
                    directory_count: 1 + summary.directory_count,
                    child_count: 1,
                },
                defer,
            ))
        }
    }
}

/// Copy the source bytes onto the target mount and verify them, file by
/// file for directories.
async fn copy_bytes_across(
    step: &StepContext<'_>,
    source: &Node,
    source_ctx: &ExecutorContext,
    target_ctx: &ExecutorContext,
    target_path: &str,
) -> FilestoreResult<()> {
    let source_executor = step.executors.for_mount(&source_ctx.mount)?;
    let target_executor = step.executors.for_mount(&target_ctx.mount)?;

    if source.is_file() {
        transfer_file(
            step,
            &source_executor,
            source_ctx,
            &target_executor,
            target_ctx,
            &source.path,
            target_path,
        )
        .await?;
        return verify_transfer(&target_executor, target_ctx, target_path, source.size_bytes)
            .await;
    }

    let subtree =
        nodes::list_subtree_by_path(step.txn, source_ctx.mount.id, &source.path, None).await?;
    for entry in &subtree {
        let new_path = if entry.path == source.path {
            target_path.to_string()
        } else {
            path::join_path(target_path, &entry.path[source.path.len() + 1..])
        };
        match entry.kind {
            NodeKind::Directory => {
                step.run_executor(
                    &target_executor,
                    &ExecutorOperation::CreateDirectory { path: new_path },
                    target_ctx,
                )
                .await?;
            }
            NodeKind::File => {
                transfer_file(
                    step,
                    &source_executor,
                    source_ctx,
                    &target_executor,
                    target_ctx,
                    &entry.path,
                    &new_path,
                )
                .await?;
                verify_transfer(&target_executor, target_ctx, &new_path, entry.size_bytes)
                    .await?;
            }
        }
    }
    Ok(())
}
