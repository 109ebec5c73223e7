//! Node entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub backend_mount_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub path: String, // Normalized, no leading slash
    pub name: String, // Last path segment
    pub depth: i32,   // Segment count of path
    pub kind: String, // file | directory
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub content_hash: Option<String>,
    pub is_symlink: bool,
    pub state: String,             // active | inconsistent | missing | deleted
    pub consistency_state: String, // active | inconsistent | missing
    pub version: i64,              // Bumped on every committed mutation
    pub metadata: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub last_seen_at: DateTimeUtc,
    pub last_modified_at: Option<DateTimeUtc>,
    pub consistency_checked_at: DateTimeUtc,
    pub last_reconciled_at: Option<DateTimeUtc>,
    pub last_drift_detected_at: Option<DateTimeUtc>,
    pub deleted_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::backend_mount::Entity",
        from = "Column::BackendMountId",
        to = "super::backend_mount::Column::Id"
    )]
    BackendMount,
    #[sea_orm(has_one = "super::rollup::Entity")]
    Rollup,
}

impl Related<super::backend_mount::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackendMount.def()
    }
}

impl Related<super::rollup::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Rollup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
