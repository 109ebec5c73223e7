//! Node rows: lookups, inserts, state transitions, listing

use crate::domain::node::{ConsistencyState, Node, NodeKind, NodeState};
use crate::infrastructure::database::entities::{self, node};
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::path;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LikeExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbBackend, EntityTrait,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
};
use std::str::FromStr;
use uuid::Uuid;

/// Escape `%`, `_`, and the escape character itself for LIKE patterns
pub(crate) fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn node_from_model(model: node::Model) -> FilestoreResult<Node> {
    let kind = NodeKind::from_str(&model.kind)
        .map_err(|_| FilestoreError::internal(format!("unknown node kind '{}'", model.kind)))?;
    let state = NodeState::from_str(&model.state)
        .map_err(|_| FilestoreError::internal(format!("unknown node state '{}'", model.state)))?;
    let consistency_state = ConsistencyState::from_str(&model.consistency_state).map_err(|_| {
        FilestoreError::internal(format!(
            "unknown consistency state '{}'",
            model.consistency_state
        ))
    })?;
    Ok(Node {
        id: model.id,
        backend_mount_id: model.backend_mount_id,
        parent_id: model.parent_id,
        path: model.path,
        name: model.name,
        depth: model.depth,
        kind,
        size_bytes: model.size_bytes,
        checksum: model.checksum,
        content_hash: model.content_hash,
        is_symlink: model.is_symlink,
        state,
        consistency_state,
        version: model.version,
        metadata: model.metadata,
        created_at: model.created_at,
        updated_at: model.updated_at,
        last_seen_at: model.last_seen_at,
        last_modified_at: model.last_modified_at,
        consistency_checked_at: model.consistency_checked_at,
        last_reconciled_at: model.last_reconciled_at,
        last_drift_detected_at: model.last_drift_detected_at,
        deleted_at: model.deleted_at,
    })
}

fn lock_if_supported<C: ConnectionTrait>(
    conn: &C,
    select: sea_orm::Select<node::Entity>,
    for_update: bool,
) -> sea_orm::Select<node::Entity> {
    // SQLite has a single writer; the row lock only matters on Postgres
    if for_update && conn.get_database_backend() == DbBackend::Postgres {
        select.lock_exclusive()
    } else {
        select
    }
}

pub async fn get_node_by_id<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    for_update: bool,
) -> FilestoreResult<Option<Node>> {
    let select = node::Entity::find().filter(node::Column::Id.eq(id));
    let model = lock_if_supported(conn, select, for_update).one(conn).await?;
    model.map(node_from_model).transpose()
}

/// Live (non-deleted) node at `(mount, path)`.
pub async fn get_node_by_path<C: ConnectionTrait>(
    conn: &C,
    backend_mount_id: Uuid,
    path: &str,
    for_update: bool,
) -> FilestoreResult<Option<Node>> {
    let select = node::Entity::find()
        .filter(node::Column::BackendMountId.eq(backend_mount_id))
        .filter(node::Column::Path.eq(path))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()));
    let model = lock_if_supported(conn, select, for_update).one(conn).await?;
    model.map(node_from_model).transpose()
}

/// Most recent node row at `(mount, path)` including deleted history rows.
pub async fn get_node_by_path_any<C: ConnectionTrait>(
    conn: &C,
    backend_mount_id: Uuid,
    path: &str,
) -> FilestoreResult<Option<Node>> {
    let model = node::Entity::find()
        .filter(node::Column::BackendMountId.eq(backend_mount_id))
        .filter(node::Column::Path.eq(path))
        .order_by_desc(node::Column::UpdatedAt)
        .one(conn)
        .await?;
    model.map(node_from_model).transpose()
}

/// Fields for a fresh node row
#[derive(Debug, Clone)]
pub struct NewNode {
    pub backend_mount_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub kind: NodeKind,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub content_hash: Option<String>,
    pub is_symlink: bool,
    pub metadata: serde_json::Value,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl NewNode {
    pub fn directory(backend_mount_id: Uuid, parent_id: Option<Uuid>, path: &str) -> Self {
        Self {
            backend_mount_id,
            parent_id,
            path: path.to_string(),
            kind: NodeKind::Directory,
            size_bytes: 0,
            checksum: None,
            content_hash: None,
            is_symlink: false,
            metadata: serde_json::json!({}),
            last_modified_at: None,
        }
    }
}

/// Insert a node row, deriving `name`/`depth` from the path and the
/// consistency state from the (active) lifecycle state.
pub async fn insert_node<C: ConnectionTrait>(conn: &C, new: NewNode) -> FilestoreResult<Node> {
    let now = Utc::now();
    let state = NodeState::Active;
    let metadata = if new.metadata.is_null() {
        serde_json::json!({})
    } else {
        new.metadata
    };
    let active = node::ActiveModel {
        id: Set(Uuid::new_v4()),
        backend_mount_id: Set(new.backend_mount_id),
        parent_id: Set(new.parent_id),
        path: Set(new.path.clone()),
        name: Set(path::path_name(&new.path).to_string()),
        depth: Set(path::path_depth(&new.path)),
        kind: Set(new.kind.to_string()),
        size_bytes: Set(new.size_bytes),
        checksum: Set(new.checksum),
        content_hash: Set(new.content_hash),
        is_symlink: Set(new.is_symlink),
        state: Set(state.to_string()),
        consistency_state: Set(state.derived_consistency().to_string()),
        version: Set(1),
        metadata: Set(metadata),
        created_at: Set(now),
        updated_at: Set(now),
        last_seen_at: Set(now),
        last_modified_at: Set(new.last_modified_at),
        consistency_checked_at: Set(now),
        last_reconciled_at: Set(None),
        last_drift_detected_at: Set(None),
        deleted_at: Set(None),
    };
    let model = active.insert(conn).await.map_err(|err| {
        if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) {
            FilestoreError::node_exists(format!("node already exists at {}", new.path))
        } else {
            err.into()
        }
    })?;
    node_from_model(model)
}

/// Lifecycle transition for one node
#[derive(Debug, Clone, Default)]
pub struct StateTransition {
    pub consistency_override: Option<ConsistencyState>,
    pub record_reconciled: bool,
    pub record_drift: bool,
    pub record_seen: bool,
}

/// Transition a node's lifecycle state, bumping the version.
///
/// `deleted_at` is set when entering `deleted`, retained when entering
/// `missing`, and cleared otherwise.
pub async fn update_node_state<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    state: NodeState,
    transition: StateTransition,
) -> FilestoreResult<Node> {
    let model = node::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {id} not found")))?;

    let now = Utc::now();
    let was_deleted = model.state == NodeState::Deleted.to_string();
    let consistency = transition
        .consistency_override
        .unwrap_or_else(|| state.derived_consistency());

    let mut active: node::ActiveModel = model.clone().into();
    active.state = Set(state.to_string());
    active.consistency_state = Set(consistency.to_string());
    active.version = Set(model.version + 1);
    active.updated_at = Set(now);
    active.consistency_checked_at = Set(now);
    active.deleted_at = Set(match state {
        NodeState::Deleted => {
            if was_deleted {
                model.deleted_at
            } else {
                Some(now)
            }
        }
        NodeState::Missing => model.deleted_at,
        _ => None,
    });
    if transition.record_reconciled {
        active.last_reconciled_at = Set(Some(now));
    }
    if transition.record_drift {
        active.last_drift_detected_at = Set(Some(now));
    }
    if transition.record_seen {
        active.last_seen_at = Set(now);
    }

    node_from_model(active.update(conn).await?)
}

/// Record a consistency check that found nothing to change. No version
/// bump: the node was observed, not mutated.
pub async fn touch_consistency<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    seen_on_backend: bool,
) -> FilestoreResult<()> {
    let model = node::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {id} not found")))?;
    let now = Utc::now();
    let mut active: node::ActiveModel = model.into();
    active.consistency_checked_at = Set(now);
    if seen_on_backend {
        active.last_seen_at = Set(now);
    }
    active.update(conn).await?;
    Ok(())
}

/// Replace a node's metadata map, bumping the version.
pub async fn update_node_metadata<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    metadata: serde_json::Value,
) -> FilestoreResult<Node> {
    let model = node::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {id} not found")))?;
    let mut active: node::ActiveModel = model.clone().into();
    active.metadata = Set(metadata);
    active.version = Set(model.version + 1);
    active.updated_at = Set(Utc::now());
    node_from_model(active.update(conn).await?)
}

/// Replace a file node's content descriptors after an upload/write.
pub async fn update_node_content<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    size_bytes: i64,
    checksum: Option<String>,
    content_hash: Option<String>,
    metadata: Option<serde_json::Value>,
) -> FilestoreResult<Node> {
    let model = node::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {id} not found")))?;
    let now = Utc::now();
    let mut active: node::ActiveModel = model.clone().into();
    active.size_bytes = Set(size_bytes);
    active.checksum = Set(checksum);
    active.content_hash = Set(content_hash);
    if let Some(metadata) = metadata {
        active.metadata = Set(metadata);
    }
    active.state = Set(NodeState::Active.to_string());
    active.consistency_state = Set(NodeState::Active.derived_consistency().to_string());
    active.version = Set(model.version + 1);
    active.updated_at = Set(now);
    active.last_seen_at = Set(now);
    active.last_modified_at = Set(Some(now));
    active.deleted_at = Set(None);
    node_from_model(active.update(conn).await?)
}

/// Move a single node row to a new location, bumping the version.
pub async fn update_node_location<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    backend_mount_id: Uuid,
    parent_id: Option<Uuid>,
    new_path: &str,
) -> FilestoreResult<Node> {
    let model = node::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::node_not_found(format!("node {id} not found")))?;
    let mut active: node::ActiveModel = model.clone().into();
    active.backend_mount_id = Set(backend_mount_id);
    active.parent_id = Set(parent_id);
    active.path = Set(new_path.to_string());
    active.name = Set(path::path_name(new_path).to_string());
    active.depth = Set(path::path_depth(new_path));
    active.version = Set(model.version + 1);
    active.updated_at = Set(Utc::now());
    node_from_model(active.update(conn).await?)
}

/// Rewrite every live descendant of a moved directory in one statement.
///
/// The root itself is relocated separately via [`update_node_location`].
pub async fn relocate_subtree<C: ConnectionTrait>(
    conn: &C,
    source_mount_id: Uuid,
    old_prefix: &str,
    target_mount_id: Uuid,
    new_prefix: &str,
) -> FilestoreResult<u64> {
    let depth_delta = path::path_depth(new_prefix) - path::path_depth(old_prefix);
    let pattern = format!("{}/%", escape_like(old_prefix));
    let start = (old_prefix.len() + 1) as i32;

    let result = node::Entity::update_many()
        .col_expr(
            node::Column::Path,
            Expr::cust_with_values("? || SUBSTR(path, ?)", [
                sea_orm::Value::from(new_prefix),
                sea_orm::Value::from(start),
            ]),
        )
        .col_expr(
            node::Column::Depth,
            Expr::col(node::Column::Depth).add(depth_delta),
        )
        .col_expr(node::Column::BackendMountId, Expr::value(target_mount_id))
        .col_expr(
            node::Column::Version,
            Expr::col(node::Column::Version).add(1),
        )
        .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(node::Column::BackendMountId.eq(source_mount_id))
        .filter(Expr::col(node::Column::Path).like(LikeExpr::new(pattern).escape('\\')))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .exec(conn)
        .await?;

    Ok(result.rows_affected)
}

/// Live children of a directory, path-ordered.
pub async fn list_children<C: ConnectionTrait>(
    conn: &C,
    parent_id: Uuid,
) -> FilestoreResult<Vec<Node>> {
    let models = node::Entity::find()
        .filter(node::Column::ParentId.eq(parent_id))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .order_by_asc(node::Column::Path)
        .all(conn)
        .await?;
    models.into_iter().map(node_from_model).collect()
}

/// Live subtree rooted at `path` (root included), shallowest first.
pub async fn list_subtree_by_path<C: ConnectionTrait>(
    conn: &C,
    backend_mount_id: Uuid,
    path: &str,
    max_depth: Option<i32>,
) -> FilestoreResult<Vec<Node>> {
    let pattern = format!("{}/%", escape_like(path));
    let mut select = node::Entity::find()
        .filter(node::Column::BackendMountId.eq(backend_mount_id))
        .filter(
            Condition::any()
                .add(node::Column::Path.eq(path))
                .add(Expr::col(node::Column::Path).like(LikeExpr::new(pattern).escape('\\'))),
        )
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()));
    if let Some(max_depth) = max_depth {
        select = select.filter(node::Column::Depth.lte(path::path_depth(path) + max_depth));
    }
    let models = select
        .order_by_asc(node::Column::Depth)
        .order_by_asc(node::Column::Path)
        .all(conn)
        .await?;
    models.into_iter().map(node_from_model).collect()
}

/// Live directories ordered by how long ago they were last checked; the
/// audit sweep walks this in batches.
pub async fn list_audit_candidates<C: ConnectionTrait>(
    conn: &C,
    batch_size: u64,
) -> FilestoreResult<Vec<Node>> {
    let models = node::Entity::find()
        .filter(node::Column::Kind.eq(NodeKind::Directory.to_string()))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .order_by_asc(node::Column::ConsistencyCheckedAt)
        .limit(batch_size)
        .all(conn)
        .await?;
    models.into_iter().map(node_from_model).collect()
}

/// Fail with `CHILDREN_EXIST` when a directory still has live children.
pub async fn ensure_no_active_children<C: ConnectionTrait>(
    conn: &C,
    parent_id: Uuid,
) -> FilestoreResult<()> {
    let count = node::Entity::find()
        .filter(node::Column::ParentId.eq(parent_id))
        .filter(node::Column::State.ne(NodeState::Deleted.to_string()))
        .count(conn)
        .await?;
    if count > 0 {
        return Err(FilestoreError::children_exist(format!(
            "directory has {count} non-deleted children"
        )));
    }
    Ok(())
}

/// Range predicates over the joined rollup table
#[derive(Debug, Clone, Default)]
pub struct RollupRangeFilter {
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub child_count_min: Option<i64>,
    pub child_count_max: Option<i64>,
    pub file_count_min: Option<i64>,
    pub file_count_max: Option<i64>,
}

impl RollupRangeFilter {
    fn is_empty(&self) -> bool {
        self.size_min.is_none()
            && self.size_max.is_none()
            && self.child_count_min.is_none()
            && self.child_count_max.is_none()
            && self.file_count_min.is_none()
            && self.file_count_max.is_none()
    }
}

/// Listing filters; every populated field narrows the result set
#[derive(Debug, Clone, Default)]
pub struct NodeListFilter {
    pub path_prefix: Option<String>,
    pub max_depth: Option<i32>,
    pub states: Vec<NodeState>,
    pub kinds: Vec<NodeKind>,
    /// Case-sensitive substring match over `path` and `name`
    pub search: Option<String>,
    pub drift_only: bool,
    /// Key/value pairs the metadata map must contain
    pub metadata: Vec<(String, serde_json::Value)>,
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub rollup: RollupRangeFilter,
}

/// One page of a node listing
#[derive(Debug, Clone)]
pub struct NodeListPage {
    pub nodes: Vec<Node>,
    pub total: u64,
}

/// Paginated listing with filters.
///
/// Deleted rows are excluded unless the states filter names them.
pub async fn list_nodes<C: ConnectionTrait>(
    conn: &C,
    backend_mount_id: Option<Uuid>,
    filter: &NodeListFilter,
    limit: u64,
    offset: u64,
) -> FilestoreResult<NodeListPage> {
    let mut select = node::Entity::find();
    if let Some(mount_id) = backend_mount_id {
        select = select.filter(node::Column::BackendMountId.eq(mount_id));
    }
    paginate_filtered(conn, select, filter, limit, offset).await
}

/// Paginated children of one directory, with the same filter surface as
/// [`list_nodes`].
pub async fn list_node_children<C: ConnectionTrait>(
    conn: &C,
    parent_id: Uuid,
    filter: &NodeListFilter,
    limit: u64,
    offset: u64,
) -> FilestoreResult<NodeListPage> {
    let select = node::Entity::find().filter(node::Column::ParentId.eq(parent_id));
    paginate_filtered(conn, select, filter, limit, offset).await
}

async fn paginate_filtered<C: ConnectionTrait>(
    conn: &C,
    mut select: sea_orm::Select<node::Entity>,
    filter: &NodeListFilter,
    limit: u64,
    offset: u64,
) -> FilestoreResult<NodeListPage> {
    if filter.states.is_empty() {
        select = select.filter(node::Column::State.ne(NodeState::Deleted.to_string()));
    } else {
        let states: Vec<String> = filter.states.iter().map(ToString::to_string).collect();
        select = select.filter(node::Column::State.is_in(states));
    }

    if !filter.kinds.is_empty() {
        let kinds: Vec<String> = filter.kinds.iter().map(ToString::to_string).collect();
        select = select.filter(node::Column::Kind.is_in(kinds));
    }

    if let Some(prefix) = &filter.path_prefix {
        let prefix = prefix.trim_end_matches('/');
        let pattern = format!("{}/%", escape_like(prefix));
        select = select.filter(
            Condition::any()
                .add(node::Column::Path.eq(prefix))
                .add(Expr::col(node::Column::Path).like(LikeExpr::new(pattern).escape('\\'))),
        );
    }

    if let Some(max_depth) = filter.max_depth {
        select = select.filter(node::Column::Depth.lte(max_depth));
    }

    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", escape_like(search));
        select = select.filter(
            Condition::any()
                .add(Expr::col(node::Column::Path).like(LikeExpr::new(pattern.clone()).escape('\\')))
                .add(Expr::col(node::Column::Name).like(LikeExpr::new(pattern).escape('\\'))),
        );
    }

    if filter.drift_only {
        select = select.filter(
            Condition::any()
                .add(node::Column::ConsistencyState.ne(ConsistencyState::Active.to_string()))
                .add(node::Column::LastDriftDetectedAt.is_not_null()),
        );
    }

    for (key, value) in &filter.metadata {
        // json_extract('"x"', '$') unwraps the encoded literal on both ends
        select = select.filter(Expr::cust_with_values(
            "json_extract(metadata, ?) = json_extract(?, '$')",
            [
                sea_orm::Value::from(format!("$.{key}")),
                sea_orm::Value::from(value.to_string()),
            ],
        ));
    }

    if let Some(min) = filter.size_min {
        select = select.filter(node::Column::SizeBytes.gte(min));
    }
    if let Some(max) = filter.size_max {
        select = select.filter(node::Column::SizeBytes.lte(max));
    }
    if let Some(after) = filter.created_after {
        select = select.filter(node::Column::CreatedAt.gte(after));
    }
    if let Some(before) = filter.created_before {
        select = select.filter(node::Column::CreatedAt.lte(before));
    }
    if let Some(after) = filter.updated_after {
        select = select.filter(node::Column::UpdatedAt.gte(after));
    }
    if let Some(before) = filter.updated_before {
        select = select.filter(node::Column::UpdatedAt.lte(before));
    }

    // Join the rollup table once, however many range predicates reference it
    if !filter.rollup.is_empty() {
        select = select.join(JoinType::LeftJoin, node::Relation::Rollup.def());
        let rollup = entities::rollup::Entity;
        if let Some(min) = filter.rollup.size_min {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::SizeBytes)).gte(min));
        }
        if let Some(max) = filter.rollup.size_max {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::SizeBytes)).lte(max));
        }
        if let Some(min) = filter.rollup.child_count_min {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::ChildCount)).gte(min));
        }
        if let Some(max) = filter.rollup.child_count_max {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::ChildCount)).lte(max));
        }
        if let Some(min) = filter.rollup.file_count_min {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::FileCount)).gte(min));
        }
        if let Some(max) = filter.rollup.file_count_max {
            select = select
                .filter(Expr::col((rollup, entities::rollup::Column::FileCount)).lte(max));
        }
    }

    let total = select.clone().count(conn).await?;
    let models = select
        .order_by_asc(node::Column::Path)
        .limit(limit)
        .offset(offset)
        .all(conn)
        .await?;
    let nodes = models
        .into_iter()
        .map(node_from_model)
        .collect::<FilestoreResult<Vec<_>>>()?;

    Ok(NodeListPage { nodes, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{memory_db, seed_local_mount};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn insert_derives_name_depth_and_consistency() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let node = insert_node(
            &db,
            NewNode::directory(mount.id, None, "datasets/observatory"),
        )
        .await
        .unwrap();
        assert_eq!(node.name, "observatory");
        assert_eq!(node.depth, 2);
        assert_eq!(node.version, 1);
        assert_eq!(node.state, NodeState::Active);
        assert_eq!(node.consistency_state, ConsistencyState::Active);
        assert_eq!(node.metadata, serde_json::json!({}));
    }

    #[tokio::test]
    async fn duplicate_live_path_is_rejected() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();
        let err = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::shared::error::ErrorKind::NodeExists);
    }

    #[tokio::test]
    async fn deleted_path_frees_the_slot() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let node = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();
        update_node_state(&db, node.id, NodeState::Deleted, StateTransition::default())
            .await
            .unwrap();

        // Path lookup no longer sees it, and a fresh row may take the path
        assert!(get_node_by_path(&db, mount.id, "a", false)
            .await
            .unwrap()
            .is_none());
        let fresh = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();
        assert_eq!(fresh.version, 1);
        assert_ne!(fresh.id, node.id);
    }

    #[tokio::test]
    async fn state_transitions_manage_deleted_at_and_version() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let node = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();

        let deleted =
            update_node_state(&db, node.id, NodeState::Deleted, StateTransition::default())
                .await
                .unwrap();
        assert_eq!(deleted.version, 2);
        assert!(deleted.deleted_at.is_some());
        assert_eq!(deleted.consistency_state, ConsistencyState::Missing);

        // Missing retains deleted_at, active clears it
        let missing =
            update_node_state(&db, node.id, NodeState::Missing, StateTransition::default())
                .await
                .unwrap();
        assert_eq!(missing.deleted_at, deleted.deleted_at);
        let active =
            update_node_state(&db, node.id, NodeState::Active, StateTransition::default())
                .await
                .unwrap();
        assert!(active.deleted_at.is_none());
        assert_eq!(active.version, 4);
    }

    #[tokio::test]
    async fn subtree_relocation_rewrites_descendants() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let root = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();
        let child = insert_node(&db, NewNode::directory(mount.id, Some(root.id), "a/b"))
            .await
            .unwrap();
        insert_node(&db, NewNode::directory(mount.id, Some(child.id), "a/b/c"))
            .await
            .unwrap();

        let rewritten = relocate_subtree(&db, mount.id, "a", mount.id, "x/y").await.unwrap();
        assert_eq!(rewritten, 2);

        let moved = get_node_by_path(&db, mount.id, "x/y/b/c", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.depth, 4);
        assert_eq!(moved.version, 2);
    }

    #[tokio::test]
    async fn listing_filters_compose() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let root = insert_node(&db, NewNode::directory(mount.id, None, "datasets"))
            .await
            .unwrap();
        let mut file = NewNode::directory(mount.id, Some(root.id), "datasets/report.bin");
        file.kind = NodeKind::File;
        file.size_bytes = 2048;
        file.metadata = serde_json::json!({ "owner": "observatory" });
        insert_node(&db, file).await.unwrap();
        insert_node(&db, NewNode::directory(mount.id, None, "other"))
            .await
            .unwrap();

        let page = list_nodes(
            &db,
            Some(mount.id),
            &NodeListFilter {
                path_prefix: Some("datasets/".to_string()),
                kinds: vec![NodeKind::File],
                size_min: Some(1024),
                metadata: vec![("owner".to_string(), serde_json::json!("observatory"))],
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.nodes[0].path, "datasets/report.bin");

        // Search with LIKE metacharacters must not widen the match
        let none = list_nodes(
            &db,
            Some(mount.id),
            &NodeListFilter {
                search: Some("%".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn children_guard_counts_live_rows_only() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/root").await;
        let root = insert_node(&db, NewNode::directory(mount.id, None, "w"))
            .await
            .unwrap();
        let child = insert_node(&db, NewNode::directory(mount.id, Some(root.id), "w/a"))
            .await
            .unwrap();

        assert!(ensure_no_active_children(&db, root.id).await.is_err());
        update_node_state(&db, child.id, NodeState::Deleted, StateTransition::default())
            .await
            .unwrap();
        assert!(ensure_no_active_children(&db, root.id).await.is_ok());
    }
}
