//! Journal rows: insertion, idempotency lookup, finalization, pruning

use crate::domain::journal::{JournalEntry, JournalStatus};
use crate::infrastructure::database::entities::journal_entry;
use crate::shared::error::{FilestoreError, FilestoreResult};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::str::FromStr;
use uuid::Uuid;

fn entry_from_model(model: journal_entry::Model) -> FilestoreResult<JournalEntry> {
    let status = JournalStatus::from_str(&model.status).map_err(|_| {
        FilestoreError::internal(format!("unknown journal status '{}'", model.status))
    })?;
    let affected_node_ids: Vec<Uuid> =
        serde_json::from_value(model.affected_node_ids).unwrap_or_default();
    Ok(JournalEntry {
        id: model.id,
        command: model.command,
        status,
        principal: model.principal,
        idempotency_key: model.idempotency_key,
        correlation_id: model.correlation_id,
        primary_node_id: model.primary_node_id,
        secondary_node_id: model.secondary_node_id,
        affected_node_ids,
        parameters: model.parameters,
        result: model.result,
        error: model.error,
        created_at: model.created_at,
        updated_at: model.updated_at,
        completed_at: model.completed_at,
        duration_ms: model.duration_ms,
    })
}

/// Fields for a fresh `running` journal entry
#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub command: String,
    pub principal: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub parameters: serde_json::Value,
}

/// Insert a `running` journal entry.
///
/// The partial unique index on `(command, idempotency_key)` turns a racing
/// duplicate into `IDEMPOTENCY_CONFLICT`.
pub async fn insert_entry<C: ConnectionTrait>(
    conn: &C,
    new: NewJournalEntry,
) -> FilestoreResult<JournalEntry> {
    let now = Utc::now();
    let active = journal_entry::ActiveModel {
        id: Set(Uuid::new_v4()),
        command: Set(new.command.clone()),
        status: Set(JournalStatus::Running.to_string()),
        principal: Set(new.principal),
        idempotency_key: Set(new.idempotency_key.clone()),
        correlation_id: Set(new.correlation_id),
        primary_node_id: Set(None),
        secondary_node_id: Set(None),
        affected_node_ids: Set(serde_json::json!([])),
        parameters: Set(new.parameters),
        result: Set(None),
        error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        completed_at: Set(None),
        duration_ms: Set(None),
    };
    let model = active.insert(conn).await.map_err(|err| {
        if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) {
            FilestoreError::idempotency_conflict(format!(
                "command '{}' already journaled under this idempotency key",
                new.command
            ))
        } else {
            err.into()
        }
    })?;
    entry_from_model(model)
}

pub async fn get_entry<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> FilestoreResult<Option<JournalEntry>> {
    let model = journal_entry::Entity::find_by_id(id).one(conn).await?;
    model.map(entry_from_model).transpose()
}

/// Recent journal rows for external projection, newest first.
pub async fn list_entries<C: ConnectionTrait>(
    conn: &C,
    statuses: &[JournalStatus],
    limit: u64,
    offset: u64,
) -> FilestoreResult<Vec<JournalEntry>> {
    let mut select = journal_entry::Entity::find();
    if !statuses.is_empty() {
        let statuses: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        select = select.filter(journal_entry::Column::Status.is_in(statuses));
    }
    let models = select
        .order_by_desc(journal_entry::Column::CreatedAt)
        .limit(limit)
        .offset(offset)
        .all(conn)
        .await?;
    models.into_iter().map(entry_from_model).collect()
}

/// Idempotency anchor lookup
pub async fn find_by_idempotency_key<C: ConnectionTrait>(
    conn: &C,
    command: &str,
    idempotency_key: &str,
) -> FilestoreResult<Option<JournalEntry>> {
    let model = journal_entry::Entity::find()
        .filter(journal_entry::Column::Command.eq(command))
        .filter(journal_entry::Column::IdempotencyKey.eq(idempotency_key))
        .one(conn)
        .await?;
    model.map(entry_from_model).transpose()
}

pub async fn mark_succeeded<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    result: serde_json::Value,
    primary_node_id: Option<Uuid>,
    secondary_node_id: Option<Uuid>,
    affected_node_ids: &[Uuid],
) -> FilestoreResult<JournalEntry> {
    finalize(
        conn,
        id,
        JournalStatus::Succeeded,
        Some(result),
        None,
        primary_node_id,
        secondary_node_id,
        affected_node_ids,
    )
    .await
}

pub async fn mark_failed<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    error: serde_json::Value,
) -> FilestoreResult<JournalEntry> {
    finalize(conn, id, JournalStatus::Failed, None, Some(error), None, None, &[]).await
}

#[allow(clippy::too_many_arguments)]
async fn finalize<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    status: JournalStatus,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    primary_node_id: Option<Uuid>,
    secondary_node_id: Option<Uuid>,
    affected_node_ids: &[Uuid],
) -> FilestoreResult<JournalEntry> {
    let model = journal_entry::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal(format!("journal entry {id} vanished")))?;

    let now = Utc::now();
    let duration_ms = (now - model.created_at).num_milliseconds();
    let mut active: journal_entry::ActiveModel = model.into();
    active.status = Set(status.to_string());
    if let Some(result) = result {
        active.result = Set(Some(result));
    }
    if let Some(error) = error {
        active.error = Set(Some(error));
    }
    if primary_node_id.is_some() {
        active.primary_node_id = Set(primary_node_id);
    }
    if secondary_node_id.is_some() {
        active.secondary_node_id = Set(secondary_node_id);
    }
    if !affected_node_ids.is_empty() {
        active.affected_node_ids = Set(serde_json::json!(affected_node_ids));
    }
    active.updated_at = Set(now);
    active.completed_at = Set(Some(now));
    active.duration_ms = Set(Some(duration_ms));
    entry_from_model(active.update(conn).await?)
}

/// Put a failed entry back into `running` for a keyed re-attempt.
///
/// The idempotency key stays on the row; the clock restarts so the recorded
/// duration covers the new attempt.
pub async fn rearm_entry<C: ConnectionTrait>(conn: &C, id: Uuid) -> FilestoreResult<JournalEntry> {
    let model = journal_entry::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal(format!("journal entry {id} vanished")))?;
    let now = Utc::now();
    let mut active: journal_entry::ActiveModel = model.into();
    active.status = Set(JournalStatus::Running.to_string());
    active.result = Set(None);
    active.error = Set(None);
    active.primary_node_id = Set(None);
    active.secondary_node_id = Set(None);
    active.affected_node_ids = Set(serde_json::json!([]));
    active.created_at = Set(now);
    active.updated_at = Set(now);
    active.completed_at = Set(None);
    active.duration_ms = Set(None);
    entry_from_model(active.update(conn).await?)
}

/// Delete terminal entries older than the cutoff, one bounded batch.
///
/// Returns the number of rows removed; callers loop until zero.
pub async fn prune_terminal_before<C: ConnectionTrait>(
    conn: &C,
    cutoff: DateTime<Utc>,
    batch_size: u64,
) -> FilestoreResult<u64> {
    let terminal = [
        JournalStatus::Succeeded.to_string(),
        JournalStatus::Failed.to_string(),
        JournalStatus::Canceled.to_string(),
    ];
    let ids: Vec<Uuid> = journal_entry::Entity::find()
        .select_only()
        .column(journal_entry::Column::Id)
        .filter(journal_entry::Column::Status.is_in(terminal))
        .filter(journal_entry::Column::CreatedAt.lt(cutoff))
        .order_by_asc(journal_entry::Column::CreatedAt)
        .limit(batch_size)
        .into_tuple()
        .all(conn)
        .await?;
    if ids.is_empty() {
        return Ok(0);
    }
    let result = journal_entry::Entity::delete_many()
        .filter(journal_entry::Column::Id.is_in(ids))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
