//! Reconciliation job rows: enqueue with coalescing, atomic claim, finalization

use crate::domain::reconciliation::{
    ReconciliationJob, ReconciliationJobStatus, ReconciliationReason, ReconciliationRequest,
};
use crate::infrastructure::database::entities::reconciliation_job;
use crate::shared::error::{FilestoreError, FilestoreResult};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::str::FromStr;
use uuid::Uuid;

fn job_from_model(model: reconciliation_job::Model) -> FilestoreResult<ReconciliationJob> {
    let reason = ReconciliationReason::from_str(&model.reason).map_err(|_| {
        FilestoreError::internal(format!("unknown reconciliation reason '{}'", model.reason))
    })?;
    let status = ReconciliationJobStatus::from_str(&model.status).map_err(|_| {
        FilestoreError::internal(format!("unknown reconciliation status '{}'", model.status))
    })?;
    Ok(ReconciliationJob {
        id: model.id,
        job_key: model.job_key,
        backend_mount_id: model.backend_mount_id,
        node_id: model.node_id,
        path: model.path,
        reason,
        status,
        detect_children: model.detect_children,
        requested_hash: model.requested_hash,
        attempt: model.attempt,
        enqueued_at: model.enqueued_at,
        started_at: model.started_at,
        completed_at: model.completed_at,
        next_run_at: model.next_run_at,
        duration_ms: model.duration_ms,
        result: model.result,
        error: model.error,
    })
}

/// Enqueue a reconciliation job, coalescing on the job key.
///
/// Returns the job and whether a new round of work was scheduled. A
/// non-terminal job under the same key absorbs the request; a terminal row
/// under the key is re-armed in place (the key is unique forever).
pub async fn enqueue_job<C: ConnectionTrait>(
    conn: &C,
    request: &ReconciliationRequest,
) -> FilestoreResult<(ReconciliationJob, bool)> {
    let job_key = request.job_key();
    if let Some(existing) = find_by_key(conn, &job_key).await? {
        if !existing.status.is_terminal() {
            return Ok((existing, false));
        }
        // Re-arm the terminal row
        let model = reconciliation_job::Entity::find_by_id(existing.id)
            .one(conn)
            .await?
            .ok_or_else(|| FilestoreError::internal("reconciliation job vanished"))?;
        let now = Utc::now();
        let mut active: reconciliation_job::ActiveModel = model.into();
        active.node_id = Set(request.node_id);
        active.reason = Set(request.reason.to_string());
        active.status = Set(ReconciliationJobStatus::Queued.to_string());
        active.detect_children = Set(request.detect_children);
        active.requested_hash = Set(request.requested_hash);
        active.attempt = Set(0);
        active.enqueued_at = Set(now);
        active.started_at = Set(None);
        active.completed_at = Set(None);
        active.next_run_at = Set(now);
        active.duration_ms = Set(None);
        active.result = Set(None);
        active.error = Set(None);
        return Ok((job_from_model(active.update(conn).await?)?, true));
    }

    let now = Utc::now();
    let active = reconciliation_job::ActiveModel {
        id: Set(Uuid::new_v4()),
        job_key: Set(job_key.clone()),
        backend_mount_id: Set(request.backend_mount_id),
        node_id: Set(request.node_id),
        path: Set(request.path.clone()),
        reason: Set(request.reason.to_string()),
        status: Set(ReconciliationJobStatus::Queued.to_string()),
        detect_children: Set(request.detect_children),
        requested_hash: Set(request.requested_hash),
        attempt: Set(0),
        enqueued_at: Set(now),
        started_at: Set(None),
        completed_at: Set(None),
        next_run_at: Set(now),
        duration_ms: Set(None),
        result: Set(None),
        error: Set(None),
    };
    match active.insert(conn).await {
        Ok(model) => Ok((job_from_model(model)?, true)),
        // Lost an enqueue race for the key: return the winner
        Err(err)
            if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) =>
        {
            let existing = find_by_key(conn, &job_key)
                .await?
                .ok_or_else(|| FilestoreError::internal("reconciliation job vanished after race"))?;
            Ok((existing, false))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn get_job<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> FilestoreResult<Option<ReconciliationJob>> {
    let model = reconciliation_job::Entity::find_by_id(id).one(conn).await?;
    model.map(job_from_model).transpose()
}

pub async fn find_by_key<C: ConnectionTrait>(
    conn: &C,
    job_key: &str,
) -> FilestoreResult<Option<ReconciliationJob>> {
    let model = reconciliation_job::Entity::find()
        .filter(reconciliation_job::Column::JobKey.eq(job_key))
        .one(conn)
        .await?;
    model.map(job_from_model).transpose()
}

pub async fn list_jobs<C: ConnectionTrait>(
    conn: &C,
    backend_mount_id: Option<Uuid>,
    statuses: &[ReconciliationJobStatus],
    limit: u64,
    offset: u64,
) -> FilestoreResult<Vec<ReconciliationJob>> {
    let mut select = reconciliation_job::Entity::find();
    if let Some(mount_id) = backend_mount_id {
        select = select.filter(reconciliation_job::Column::BackendMountId.eq(mount_id));
    }
    if !statuses.is_empty() {
        let statuses: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        select = select.filter(reconciliation_job::Column::Status.is_in(statuses));
    }
    let models = select
        .order_by_desc(reconciliation_job::Column::EnqueuedAt)
        .limit(limit)
        .offset(offset)
        .all(conn)
        .await?;
    models.into_iter().map(job_from_model).collect()
}

/// Atomically claim the oldest due queued job.
///
/// The pick is the conditional `queued -> running` update; a concurrent
/// worker that grabbed the same candidate simply loses the update and moves
/// on to the next one.
pub async fn claim_next_job<C: ConnectionTrait>(
    conn: &C,
) -> FilestoreResult<Option<ReconciliationJob>> {
    let now = Utc::now();
    for _ in 0..4 {
        let candidate = reconciliation_job::Entity::find()
            .filter(reconciliation_job::Column::Status.eq(ReconciliationJobStatus::Queued.to_string()))
            .filter(reconciliation_job::Column::NextRunAt.lte(now))
            .order_by_asc(reconciliation_job::Column::EnqueuedAt)
            .one(conn)
            .await?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let claimed = reconciliation_job::Entity::update_many()
            .col_expr(
                reconciliation_job::Column::Status,
                Expr::value(ReconciliationJobStatus::Running.to_string()),
            )
            .col_expr(
                reconciliation_job::Column::StartedAt,
                Expr::value(Some(Utc::now())),
            )
            .col_expr(
                reconciliation_job::Column::Attempt,
                Expr::col(reconciliation_job::Column::Attempt).add(1),
            )
            .filter(reconciliation_job::Column::Id.eq(candidate.id))
            .filter(
                reconciliation_job::Column::Status
                    .eq(ReconciliationJobStatus::Queued.to_string()),
            )
            .exec(conn)
            .await?;
        if claimed.rows_affected == 1 {
            return get_job(conn, candidate.id).await;
        }
    }
    Ok(None)
}

pub async fn finish_job<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    status: ReconciliationJobStatus,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
) -> FilestoreResult<ReconciliationJob> {
    let model = reconciliation_job::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal(format!("reconciliation job {id} vanished")))?;
    let now = Utc::now();
    let duration_ms = model
        .started_at
        .map(|started| (now - started).num_milliseconds());
    let mut active: reconciliation_job::ActiveModel = model.into();
    active.status = Set(status.to_string());
    active.completed_at = Set(Some(now));
    active.duration_ms = Set(duration_ms);
    active.result = Set(result);
    active.error = Set(error);
    job_from_model(active.update(conn).await?)
}

/// Push a failed attempt back onto the queue with a retry delay.
pub async fn requeue_for_retry<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    next_run_at: DateTime<Utc>,
    error: serde_json::Value,
) -> FilestoreResult<ReconciliationJob> {
    let model = reconciliation_job::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::internal(format!("reconciliation job {id} vanished")))?;
    let mut active: reconciliation_job::ActiveModel = model.into();
    active.status = Set(ReconciliationJobStatus::Queued.to_string());
    active.started_at = Set(None);
    active.next_run_at = Set(next_run_at);
    active.error = Set(Some(error));
    job_from_model(active.update(conn).await?)
}
