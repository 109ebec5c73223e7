//! uploadFile handler

use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::nodes;
use crate::domain::node::NodeKind;
use crate::domain::rollup::RollupDelta;
use crate::executors::{ExecutorContext, ExecutorOperation};
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::hashing;
use std::path::Path;
use uuid::Uuid;

/// Verify staged bytes against the declared size and checksum, returning the
/// `(checksum, content_hash)` pair to record.
pub(super) async fn verify_staging(
    staging_path: &Path,
    size_bytes: i64,
    checksum: Option<String>,
    content_hash: Option<String>,
) -> FilestoreResult<(String, String)> {
    let metadata = tokio::fs::metadata(staging_path).await.map_err(|err| {
        FilestoreError::invalid_request(format!(
            "staging file '{}' unreadable: {err}",
            staging_path.display()
        ))
    })?;
    if metadata.len() as i64 != size_bytes {
        return Err(FilestoreError::invalid_request(format!(
            "declared size {size_bytes} does not match staged {} bytes",
            metadata.len()
        )));
    }

    let actual = hashing::sha256_file(staging_path).await?;
    let checksum = match checksum {
        Some(declared) => {
            let expected = hashing::parse_checksum(&declared)?;
            if expected != actual {
                return Err(FilestoreError::checksum_mismatch(
                    "uploaded bytes do not match the declared checksum",
                )
                .with_details(serde_json::json!({
                    "expected": expected,
                    "actual": actual,
                })));
            }
            expected
        }
        None => actual,
    };

    let content_hash = match content_hash {
        Some(hash) => hash,
        None => hashing::blake3_file(staging_path).await?,
    };

    Ok((checksum, content_hash))
}

/// Fold the transport hints into the node's metadata map.
pub(super) fn merge_file_metadata(
    base: serde_json::Value,
    provided: Option<serde_json::Value>,
    mime_type: Option<String>,
    original_name: Option<String>,
) -> serde_json::Value {
    let mut map = match base {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if let Some(serde_json::Value::Object(provided)) = provided {
        map.extend(provided);
    }
    if let Some(mime_type) = mime_type {
        map.insert("mimeType".to_string(), serde_json::json!(mime_type));
    }
    if let Some(original_name) = original_name {
        map.insert("originalName".to_string(), serde_json::json!(original_name));
    }
    serde_json::Value::Object(map)
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    path: &str,
    staging_path: &Path,
    size_bytes: i64,
    checksum: Option<String>,
    content_hash: Option<String>,
    mime_type: Option<String>,
    original_name: Option<String>,
    metadata: Option<serde_json::Value>,
) -> FilestoreResult<StepOutput> {
    let mount = step.writable_mount(backend_mount_id).await?;
    let executor = step.executors.for_mount(&mount)?;
    let exec_ctx = ExecutorContext {
        mount: mount.clone(),
    };
    let mut output = StepOutput::default();

    // Checksum verification happens before any backend side effect
    let (checksum, content_hash) =
        verify_staging(staging_path, size_bytes, checksum, content_hash).await?;

    let existing = nodes::get_node_by_path(step.txn, mount.id, path, true).await?;
    if let Some(existing) = &existing {
        if existing.is_directory() {
            return Err(FilestoreError::not_a_file(format!(
                "'{path}' is a directory"
            )));
        }
    }

    let parent = step
        .ensure_parent_directories(&executor, &exec_ctx, &mount, path, &mut output)
        .await?;

    step.run_executor(
        &executor,
        &ExecutorOperation::StoreFile {
            path: path.to_string(),
            staging_path: staging_path.to_path_buf(),
        },
        &exec_ctx,
    )
    .await?;

    match existing {
        None => {
            let mut new = nodes::NewNode::directory(mount.id, parent.as_ref().map(|p| p.id), path);
            new.kind = NodeKind::File;
            new.size_bytes = size_bytes;
            new.checksum = Some(checksum);
            new.content_hash = Some(content_hash);
            new.metadata = merge_file_metadata(
                serde_json::json!({}),
                metadata,
                mime_type,
                original_name,
            );
            let node = nodes::insert_node(step.txn, new).await?;
            step.snapshot(&node).await?;

            if let Some(parent_node) = &parent {
                let pending = step
                    .rollups
                    .apply_for_mutation(
                        step.txn,
                        parent_node,
                        RollupDelta {
                            size_bytes,
                            file_count: 1,
                            directory_count: 0,
                            child_count: 1,
                        },
                        false,
                    )
                    .await?;
                output.pending_rollups.extend(pending);
            }

            output.result = serde_json::json!({ "created": true, "path": path, "sizeBytes": size_bytes });
            output.affected.push(node.id);
            output.lifecycle.push((Lifecycle::Created, node.clone()));
            output.lifecycle.push((Lifecycle::Uploaded, node.clone()));
            output.primary = Some(node);
        }
        Some(old) => {
            let merged = merge_file_metadata(
                old.metadata.clone(),
                metadata,
                mime_type,
                original_name,
            );
            let node = nodes::update_node_content(
                step.txn,
                old.id,
                size_bytes,
                Some(checksum),
                Some(content_hash),
                Some(merged),
            )
            .await?;
            step.snapshot(&node).await?;

            if let Some(parent_node) = &parent {
                let pending = step
                    .rollups
                    .apply_for_mutation(
                        step.txn,
                        parent_node,
                        RollupDelta {
                            size_bytes: size_bytes - old.size_bytes,
                            file_count: 0,
                            directory_count: 0,
                            child_count: 0,
                        },
                        false,
                    )
                    .await?;
                output.pending_rollups.extend(pending);
            }

            output.result = serde_json::json!({ "created": false, "path": path, "sizeBytes": size_bytes });
            output.affected.push(node.id);
            output.lifecycle.push((Lifecycle::Updated, node.clone()));
            output.lifecycle.push((Lifecycle::Uploaded, node.clone()));
            output.primary = Some(node);
        }
    }

    Ok(output)
}
