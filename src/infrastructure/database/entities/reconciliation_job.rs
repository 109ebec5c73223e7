//! Reconciliation job entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reconciliation_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub job_key: String, // "<mount_id>:<path>"
    pub backend_mount_id: Uuid,
    pub node_id: Option<Uuid>,
    pub path: String,
    pub reason: String, // drift | audit | manual
    pub status: String, // queued | running | succeeded | failed | skipped | cancelled
    pub detect_children: bool,
    pub requested_hash: bool,
    pub attempt: i32,
    pub enqueued_at: DateTimeUtc,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub next_run_at: DateTimeUtc, // Retry backoff scheduling
    pub duration_ms: Option<i64>,
    pub result: Option<Json>,
    pub error: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::backend_mount::Entity",
        from = "Column::BackendMountId",
        to = "super::backend_mount::Column::Id"
    )]
    BackendMount,
}

impl Related<super::backend_mount::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackendMount.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
