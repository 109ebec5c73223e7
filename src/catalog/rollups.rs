//! Rollup rows: delta application and recalculation from direct children

use crate::domain::node::{NodeKind, NodeState};
use crate::domain::rollup::{RollupDelta, RollupState, RollupSummary};
use crate::infrastructure::database::entities::rollup;
use crate::shared::error::{FilestoreError, FilestoreResult};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set};
use std::str::FromStr;
use uuid::Uuid;

fn summary_from_model(model: rollup::Model) -> FilestoreResult<RollupSummary> {
    let state = RollupState::from_str(&model.state)
        .map_err(|_| FilestoreError::internal(format!("unknown rollup state '{}'", model.state)))?;
    Ok(RollupSummary {
        node_id: model.node_id,
        size_bytes: model.size_bytes,
        file_count: model.file_count,
        directory_count: model.directory_count,
        child_count: model.child_count,
        pending_bytes_delta: model.pending_bytes_delta,
        pending_items_delta: model.pending_items_delta,
        state,
        last_calculated_at: model.last_calculated_at,
    })
}

pub async fn get_rollup<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
) -> FilestoreResult<Option<RollupSummary>> {
    let model = rollup::Entity::find_by_id(node_id).one(conn).await?;
    model.map(summary_from_model).transpose()
}

/// Fetch the rollup row, inserting a zeroed one when absent.
pub async fn ensure_rollup<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
) -> FilestoreResult<RollupSummary> {
    if let Some(existing) = get_rollup(conn, node_id).await? {
        return Ok(existing);
    }
    let active = rollup::ActiveModel {
        node_id: Set(node_id),
        size_bytes: Set(0),
        file_count: Set(0),
        directory_count: Set(0),
        child_count: Set(0),
        pending_bytes_delta: Set(0),
        pending_items_delta: Set(0),
        state: Set(RollupState::UpToDate.to_string()),
        last_calculated_at: Set(None),
        updated_at: Set(Utc::now()),
    };
    match active.insert(conn).await {
        Ok(model) => summary_from_model(model),
        // Lost an insert race: the row is there now
        Err(err)
            if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) =>
        {
            get_rollup(conn, node_id)
                .await?
                .ok_or_else(|| FilestoreError::internal("rollup row vanished after conflict"))
        }
        Err(err) => Err(err.into()),
    }
}

/// Apply a signed delta to a rollup row, clamping every aggregate at zero.
///
/// With `mark_pending` the real columns stay untouched; the delta accumulates
/// in the pending counters until a recalculation flushes them.
pub async fn apply_delta<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
    delta: &RollupDelta,
    mark_pending: bool,
) -> FilestoreResult<RollupSummary> {
    let current = ensure_rollup(conn, node_id).await?;
    let mut active: rollup::ActiveModel = rollup::Entity::find_by_id(node_id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal("rollup row vanished"))?
        .into();

    if mark_pending {
        active.pending_bytes_delta = Set(current.pending_bytes_delta + delta.size_bytes);
        active.pending_items_delta = Set(current.pending_items_delta + delta.item_count());
        active.state = Set(RollupState::Pending.to_string());
    } else {
        active.size_bytes = Set((current.size_bytes + delta.size_bytes).max(0));
        active.file_count = Set((current.file_count + delta.file_count).max(0));
        active.directory_count = Set((current.directory_count + delta.directory_count).max(0));
        active.child_count = Set((current.child_count + delta.child_count).max(0));
        if current.state == RollupState::Invalid {
            active.state = Set(RollupState::UpToDate.to_string());
        }
    }
    active.updated_at = Set(Utc::now());
    summary_from_model(active.update(conn).await?)
}

/// Zero a deleted node's rollup and mark it invalid.
pub async fn mark_invalid<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
) -> FilestoreResult<RollupSummary> {
    ensure_rollup(conn, node_id).await?;
    let mut active: rollup::ActiveModel = rollup::Entity::find_by_id(node_id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal("rollup row vanished"))?
        .into();
    active.size_bytes = Set(0);
    active.file_count = Set(0);
    active.directory_count = Set(0);
    active.child_count = Set(0);
    active.pending_bytes_delta = Set(0);
    active.pending_items_delta = Set(0);
    active.state = Set(RollupState::Invalid.to_string());
    active.updated_at = Set(Utc::now());
    summary_from_model(active.update(conn).await?)
}

#[derive(Debug, sea_orm::FromQueryResult)]
struct FileAggRow {
    file_count: i64,
    size_sum: i64,
}

#[derive(Debug, sea_orm::FromQueryResult)]
struct DirAggRow {
    dir_count: i64,
    size_sum: i64,
    nested_dirs: i64,
}

/// Recompute every aggregate from the node's direct children, flushing any
/// pending deltas.
pub async fn recalculate<C: ConnectionTrait>(
    conn: &C,
    node_id: Uuid,
) -> FilestoreResult<RollupSummary> {
    use crate::infrastructure::database::entities::node;
    use sea_orm::sea_query::Expr;
    use sea_orm::{ColumnTrait, JoinType, QueryFilter, QuerySelect, RelationTrait};

    // Direct file children: count plus raw sizes
    let file_agg = node::Entity::find()
        .select_only()
        .column_as(Expr::cust("CAST(COUNT(*) AS BIGINT)"), "file_count")
        .column_as(
            Expr::cust("CAST(COALESCE(SUM(\"size_bytes\"), 0) AS BIGINT)"),
            "size_sum",
        )
        .filter(node::Column::ParentId.eq(node_id))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .filter(node::Column::Kind.eq(NodeKind::File.to_string()))
        .into_model::<FileAggRow>()
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal("aggregate query returned no row"))?;
    let file_count = file_agg.file_count;
    let file_size = file_agg.size_sum;

    // Direct directory children: their rollups carry the recursive totals
    let dir_agg = node::Entity::find()
        .select_only()
        .join(JoinType::LeftJoin, node::Relation::Rollup.def())
        .column_as(Expr::cust("CAST(COUNT(*) AS BIGINT)"), "dir_count")
        .column_as(
            Expr::cust("CAST(COALESCE(SUM(\"rollups\".\"size_bytes\"), 0) AS BIGINT)"),
            "size_sum",
        )
        .column_as(
            Expr::cust("CAST(COALESCE(SUM(\"rollups\".\"directory_count\"), 0) AS BIGINT)"),
            "nested_dirs",
        )
        .filter(node::Column::ParentId.eq(node_id))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .filter(node::Column::Kind.eq(NodeKind::Directory.to_string()))
        .into_model::<DirAggRow>()
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal("aggregate query returned no row"))?;
    let dir_count = dir_agg.dir_count;
    let dir_size = dir_agg.size_sum;
    let nested_dirs = dir_agg.nested_dirs;

    ensure_rollup(conn, node_id).await?;
    let mut active: rollup::ActiveModel = rollup::Entity::find_by_id(node_id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal("rollup row vanished"))?
        .into();
    active.size_bytes = Set((file_size + dir_size).max(0));
    active.file_count = Set(file_count.max(0));
    active.directory_count = Set((dir_count + nested_dirs).max(0));
    active.child_count = Set((file_count + dir_count).max(0));
    active.pending_bytes_delta = Set(0);
    active.pending_items_delta = Set(0);
    active.state = Set(RollupState::UpToDate.to_string());
    active.last_calculated_at = Set(Some(Utc::now()));
    active.updated_at = Set(Utc::now());
    summary_from_model(active.update(conn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::nodes::{insert_node, NewNode};
    use crate::catalog::test_support::{memory_db, seed_local_mount};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn deltas_clamp_at_zero() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let dir = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();

        let summary = apply_delta(
            &db,
            dir.id,
            &RollupDelta {
                size_bytes: 100,
                file_count: 1,
                directory_count: 0,
                child_count: 1,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(summary.size_bytes, 100);
        assert_eq!(summary.child_count, 1);

        let clamped = apply_delta(
            &db,
            dir.id,
            &RollupDelta {
                size_bytes: -500,
                file_count: -5,
                directory_count: 0,
                child_count: -5,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(clamped.size_bytes, 0);
        assert_eq!(clamped.file_count, 0);
        assert_eq!(clamped.child_count, 0);
    }

    #[tokio::test]
    async fn pending_deltas_accumulate_without_touching_totals() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let dir = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();

        let summary = apply_delta(
            &db,
            dir.id,
            &RollupDelta {
                size_bytes: 64,
                file_count: 1,
                directory_count: 0,
                child_count: 1,
            },
            true,
        )
        .await
        .unwrap();
        assert_eq!(summary.state, RollupState::Pending);
        assert_eq!(summary.size_bytes, 0);
        assert_eq!(summary.pending_bytes_delta, 64);
        assert_eq!(summary.pending_items_delta, 2);
    }

    #[tokio::test]
    async fn recalculation_matches_children() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let root = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();
        let sub = insert_node(&db, NewNode::directory(mount.id, Some(root.id), "d/sub"))
            .await
            .unwrap();
        let mut file = NewNode::directory(mount.id, Some(root.id), "d/f.bin");
        file.kind = NodeKind::File;
        file.size_bytes = 10;
        insert_node(&db, file).await.unwrap();
        let mut nested = NewNode::directory(mount.id, Some(sub.id), "d/sub/g.bin");
        nested.kind = NodeKind::File;
        nested.size_bytes = 7;
        insert_node(&db, nested).await.unwrap();

        let sub_summary = recalculate(&db, sub.id).await.unwrap();
        assert_eq!(sub_summary.size_bytes, 7);
        assert_eq!(sub_summary.file_count, 1);

        let root_summary = recalculate(&db, root.id).await.unwrap();
        assert_eq!(root_summary.size_bytes, 17);
        assert_eq!(root_summary.file_count, 1); // Direct files only
        assert_eq!(root_summary.directory_count, 1);
        assert_eq!(root_summary.child_count, 2);
        assert_eq!(root_summary.state, RollupState::UpToDate);
        assert_eq!(root_summary.pending_bytes_delta, 0);
    }

    #[tokio::test]
    async fn invalidation_zeroes_everything() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let dir = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();
        apply_delta(
            &db,
            dir.id,
            &RollupDelta {
                size_bytes: 9,
                file_count: 1,
                directory_count: 0,
                child_count: 1,
            },
            false,
        )
        .await
        .unwrap();

        let invalid = mark_invalid(&db, dir.id).await.unwrap();
        assert_eq!(invalid.state, RollupState::Invalid);
        assert_eq!(invalid.size_bytes, 0);
        assert_eq!(invalid.child_count, 0);
    }
}
