//! Journal entry entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "journal_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub command: String,
    pub status: String, // queued | running | succeeded | failed | canceled
    pub principal: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub primary_node_id: Option<Uuid>,
    pub secondary_node_id: Option<Uuid>,
    pub affected_node_ids: Json, // Array of node uuids
    pub parameters: Json,
    pub result: Option<Json>,
    pub error: Option<Json>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
    pub duration_ms: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
