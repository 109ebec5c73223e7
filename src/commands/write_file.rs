//! writeFile handler - overwrite an existing file addressed by node id

use super::upload_file::{merge_file_metadata, verify_staging};
use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::{mounts, nodes};
use crate::domain::rollup::RollupDelta;
use crate::executors::{ExecutorContext, ExecutorOperation};
use crate::shared::error::{FilestoreError, FilestoreResult};
use std::path::Path;
use uuid::Uuid;

#[allow(clippy::too_many_arguments)]
pub(super) async fn execute(
    step: &StepContext<'_>,
    node_id: Uuid,
    staging_path: &Path,
    size_bytes: i64,
    checksum: Option<String>,
    content_hash: Option<String>,
    mime_type: Option<String>,
    metadata: Option<serde_json::Value>,
) -> FilestoreResult<StepOutput> {
    let node = nodes::get_node_by_id(step.txn, node_id, true)
        .await?
        .filter(|node| !node.is_deleted())
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {node_id} not found")))?;
    if node.is_directory() {
        return Err(FilestoreError::not_a_file(format!(
            "'{}' is a directory",
            node.path
        )));
    }

    let mount = mounts::require_mount(step.txn, node.backend_mount_id).await?;
    if !mount.is_writable() {
        return Err(FilestoreError::invalid_request(format!(
            "backend mount '{}' is read-only",
            mount.mount_key
        )));
    }
    let executor = step.executors.for_mount(&mount)?;
    let exec_ctx = ExecutorContext {
        mount: mount.clone(),
    };

    let (checksum, content_hash) =
        verify_staging(staging_path, size_bytes, checksum, content_hash).await?;

    step.run_executor(
        &executor,
        &ExecutorOperation::StoreFile {
            path: node.path.clone(),
            staging_path: staging_path.to_path_buf(),
        },
        &exec_ctx,
    )
    .await?;

    let merged = merge_file_metadata(node.metadata.clone(), metadata, mime_type, None);
    let updated = nodes::update_node_content(
        step.txn,
        node.id,
        size_bytes,
        Some(checksum),
        Some(content_hash),
        Some(merged),
    )
    .await?;
    step.snapshot(&updated).await?;

    let mut output = StepOutput::default();
    if let Some(parent_id) = updated.parent_id {
        if let Some(parent) = nodes::get_node_by_id(step.txn, parent_id, true).await? {
            let pending = step
                .rollups
                .apply_for_mutation(
                    step.txn,
                    &parent,
                    RollupDelta {
                        size_bytes: size_bytes - node.size_bytes,
                        file_count: 0,
                        directory_count: 0,
                        child_count: 0,
                    },
                    false,
                )
                .await?;
            output.pending_rollups.extend(pending);
        }
    }

    output.result = serde_json::json!({
        "path": updated.path,
        "sizeBytes": size_bytes,
        "version": updated.version,
    });
    output.affected.push(updated.id);
    output.lifecycle.push((Lifecycle::Updated, updated.clone()));
    output.lifecycle.push((Lifecycle::Uploaded, updated.clone()));
    output.primary = Some(updated);
    Ok(output)
}
