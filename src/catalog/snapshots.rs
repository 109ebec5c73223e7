//! Snapshot rows: append-only node history

use crate::domain::node::Node;
use crate::infrastructure::database::entities::snapshot;
use crate::shared::error::FilestoreResult;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

/// Capture a node at its current version. Re-capturing the same version is a
/// no-op (the `(node_id, version)` index absorbs replays).
pub async fn capture_snapshot<C: ConnectionTrait>(conn: &C, node: &Node) -> FilestoreResult<()> {
    let active = snapshot::ActiveModel {
        id: Set(Uuid::new_v4()),
        node_id: Set(node.id),
        version: Set(node.version),
        captured: Set(serde_json::to_value(node)?),
        created_at: Set(Utc::now()),
    };
    match active.insert(conn).await {
        Ok(_) => Ok(()),
        Err(err)
            if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) =>
        {
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Captured history for a node, newest first.
pub async fn list_snapshots<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
    limit: u64,
) -> FilestoreResult<Vec<(i64, serde_json::Value)>> {
    let models = snapshot::Entity::find()
        .filter(snapshot::Column::NodeId.eq(node_id))
        .order_by_desc(snapshot::Column::Version)
        .limit(limit)
        .all(conn)
        .await?;
    Ok(models
        .into_iter()
        .map(|model| (model.version, model.captured))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::nodes::{insert_node, NewNode};
    use crate::catalog::test_support::{memory_db, seed_local_mount};

    #[tokio::test]
    async fn snapshots_are_versioned_and_deduplicated() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let node = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();

        capture_snapshot(&db, &node).await.unwrap();
        capture_snapshot(&db, &node).await.unwrap(); // Same version, absorbed

        let history = list_snapshots(&db, node.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0, 1);
        assert_eq!(history[0].1["path"], "a");
    }
}
