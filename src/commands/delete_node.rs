//! deleteNode handler - soft-delete with optional recursion

use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::{nodes, rollups};
use crate::domain::node::NodeKind;
use crate::domain::rollup::{RollupDelta, RollupState};
use crate::executors::{ExecutorContext, ExecutorOperation};
use crate::shared::error::{FilestoreError, FilestoreResult};
use uuid::Uuid;

pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    path: &str,
    recursive: bool,
) -> FilestoreResult<StepOutput> {
    let mount = step.writable_mount(backend_mount_id).await?;
    let executor = step.executors.for_mount(&mount)?;
    let exec_ctx = ExecutorContext {
        mount: mount.clone(),
    };
    let mut output = StepOutput::default();

    let Some(node) = nodes::get_node_by_path(step.txn, mount.id, path, true).await? else {
        // Re-deleting a deleted node is an idempotent success; anything else
        // is genuinely absent
        if let Some(prior) = nodes::get_node_by_path_any(step.txn, mount.id, path).await? {
            if prior.is_deleted() {
                output.result = serde_json::json!({ "deleted": false, "path": path });
                output.primary = Some(prior);
                return Ok(output);
            }
        }
        return Err(FilestoreError::node_not_found(format!(
            "no node at '{path}'"
        )));
    };

    if node.is_directory() && !recursive {
        nodes::ensure_no_active_children(step.txn, node.id).await?;
    }

    step.run_executor(
        &executor,
        &ExecutorOperation::Delete {
            path: node.path.clone(),
            kind: node.kind,
            recursive,
        },
        &exec_ctx,
    )
    .await?;

    // Parent loses this child; descendants stay as-is, unreachable behind
    // the deleted root until a reconciliation sweep prunes them
    let removal_delta = match node.kind {
        NodeKind::File => Some((
            RollupDelta {
                size_bytes: -node.size_bytes,
                file_count: -1,
                directory_count: 0,
                child_count: -1,
            },
            false,
        )),
        NodeKind::Directory => {
            let summary = rollups::ensure_rollup(step.txn, node.id).await?;
            // A stale summary would subtract the wrong totals; defer instead
            let defer = summary.state != RollupState::UpToDate;
            Some((
                RollupDelta {
                    size_bytes: -summary.size_bytes,
                    file_count: 0,
                    directory_count: -(1 + summary.directory_count),
                    child_count: -1,
                },
                defer,
            ))
        }
    };

    let deleted = nodes::update_node_state(
        step.txn,
        node.id,
        crate::domain::node::NodeState::Deleted,
        nodes::StateTransition::default(),
    )
    .await?;
    step.snapshot(&deleted).await?;
    step.rollups.invalidate_node(step.txn, deleted.id).await?;

    if let Some((delta, defer)) = removal_delta {
        if let Some(parent_id) = deleted.parent_id {
            if let Some(parent) = nodes::get_node_by_id(step.txn, parent_id, true).await? {
                let pending = step
                    .rollups
                    .apply_for_mutation(step.txn, &parent, delta, defer)
                    .await?;
                output.pending_rollups.extend(pending);
            }
        }
    }

    output.result = serde_json::json!({
        "deleted": true,
        "path": path,
        "recursive": recursive,
    });
    output.affected.push(deleted.id);
    output.lifecycle.push((Lifecycle::Deleted, deleted.clone()));
    output.primary = Some(deleted);
    Ok(output)
}
