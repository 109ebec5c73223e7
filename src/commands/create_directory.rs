//! createDirectory handler

use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::nodes;
use crate::domain::rollup::RollupDelta;
use crate::executors::{ExecutorContext, ExecutorOperation};
use crate::shared::error::{FilestoreError, FilestoreResult};
use uuid::Uuid;

pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    path: &str,
    metadata: Option<serde_json::Value>,
) -> FilestoreResult<StepOutput> {
    let mount = step.writable_mount(backend_mount_id).await?;
    let executor = step.executors.for_mount(&mount)?;
    let exec_ctx = ExecutorContext {
        mount: mount.clone(),
    };
    let mut output = StepOutput::default();

    if let Some(existing) = nodes::get_node_by_path(step.txn, mount.id, path, true).await? {
        if existing.is_file() {
            return Err(FilestoreError::node_exists(format!(
                "a file already exists at '{path}'"
            )));
        }
        // Already-active directory: no-op success
        output.result = serde_json::json!({ "created": false, "path": path });
        output.affected.push(existing.id);
        output.lifecycle.push((Lifecycle::Updated, existing.clone()));
        output.primary = Some(existing);
        return Ok(output);
    }

    let parent = step
        .ensure_parent_directories(&executor, &exec_ctx, &mount, path, &mut output)
        .await?;

    step.run_executor(
        &executor,
        &ExecutorOperation::CreateDirectory {
            path: path.to_string(),
        },
        &exec_ctx,
    )
    .await?;

    let mut new = nodes::NewNode::directory(mount.id, parent.as_ref().map(|p| p.id), path);
    if let Some(metadata) = metadata {
        new.metadata = metadata;
    }
    let node = nodes::insert_node(step.txn, new).await?;
    step.snapshot(&node).await?;

    if let Some(parent_node) = &parent {
        let pending = step
            .rollups
            .apply_for_mutation(
                step.txn,
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

    output.result = serde_json::json!({ "created": true, "path": path });
    output.affected.push(node.id);
    output.lifecycle.push((Lifecycle::Created, node.clone()));
    output.primary = Some(node);
    Ok(output)
}
