//! updateNodeMetadata handler - merge/prune the metadata map

use super::{Lifecycle, StepContext, StepOutput};
use crate::catalog::nodes;
use crate::shared::error::{FilestoreError, FilestoreResult};
use uuid::Uuid;

pub(super) async fn execute(
    step: &StepContext<'_>,
    backend_mount_id: Uuid,
    node_id: Uuid,
    set: Option<serde_json::Map<String, serde_json::Value>>,
    unset: Option<Vec<String>>,
) -> FilestoreResult<StepOutput> {
    step.writable_mount(backend_mount_id).await?;

    let node = nodes::get_node_by_id(step.txn, node_id, true)
        .await?
        .filter(|node| !node.is_deleted() && node.backend_mount_id == backend_mount_id)
        .ok_or_else(|| {
            FilestoreError::node_not_found(format!(
                "node {node_id} not found on backend mount {backend_mount_id}"
            ))
        })?;

    let mut map = match node.metadata.clone() {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if let Some(set) = set {
        map.extend(set);
    }
    if let Some(unset) = unset {
        for key in unset {
            map.remove(&key);
        }
    }

    let updated =
        nodes::update_node_metadata(step.txn, node.id, serde_json::Value::Object(map)).await?;
    step.snapshot(&updated).await?;

    let mut output = StepOutput::default();
    output.result = serde_json::json!({
        "path": updated.path,
        "metadata": updated.metadata,
        "version": updated.version,
    });
    output.affected.push(updated.id);
    output.lifecycle.push((Lifecycle::Updated, updated.clone()));
    output.primary = Some(updated);
    Ok(output)
}
