//! Backend mount rows

use crate::domain::mount::{AccessMode, BackendKind, BackendMount, MountState};
use crate::infrastructure::database::entities::backend_mount;
use crate::shared::error::{FilestoreError, FilestoreResult};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::str::FromStr;
use uuid::Uuid;

fn mount_from_model(model: backend_mount::Model) -> FilestoreResult<BackendMount> {
    let backend_kind = BackendKind::from_str(&model.backend_kind).map_err(|_| {
        FilestoreError::internal(format!("unknown backend kind '{}'", model.backend_kind))
    })?;
    let access_mode = AccessMode::from_str(&model.access_mode).map_err(|_| {
        FilestoreError::internal(format!("unknown access mode '{}'", model.access_mode))
    })?;
    let state = MountState::from_str(&model.state)
        .map_err(|_| FilestoreError::internal(format!("unknown mount state '{}'", model.state)))?;
    Ok(BackendMount {
        id: model.id,
        mount_key: model.mount_key,
        backend_kind,
        access_mode,
        state,
        root_path: model.root_path,
        bucket: model.bucket,
        prefix: model.prefix,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

pub async fn create_mount<C: ConnectionTrait>(
    conn: &C,
    mount: &BackendMount,
) -> FilestoreResult<BackendMount> {
    mount.validate()?;
    let now = Utc::now();
    let active = backend_mount::ActiveModel {
        id: Set(mount.id),
        mount_key: Set(mount.mount_key.clone()),
        backend_kind: Set(mount.backend_kind.to_string()),
        access_mode: Set(mount.access_mode.to_string()),
        state: Set(mount.state.to_string()),
        root_path: Set(mount.root_path.clone()),
        bucket: Set(mount.bucket.clone()),
        prefix: Set(mount.prefix.clone()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    let model = active.insert(conn).await.map_err(|err| {
        if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) {
            FilestoreError::invalid_request(format!(
                "mount key '{}' already exists",
                mount.mount_key
            ))
        } else {
            err.into()
        }
    })?;
    mount_from_model(model)
}

pub async fn get_mount<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> FilestoreResult<Option<BackendMount>> {
    let model = backend_mount::Entity::find_by_id(id).one(conn).await?;
    model.map(mount_from_model).transpose()
}

/// Mount lookup that fails with `BACKEND_NOT_FOUND`
pub async fn require_mount<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> FilestoreResult<BackendMount> {
    get_mount(conn, id)
        .await?
        .ok_or_else(|| FilestoreError::backend_not_found(format!("backend mount {id} not found")))
}

pub async fn get_mount_by_key<C: ConnectionTrait>(
    conn: &C,
    mount_key: &str,
) -> FilestoreResult<Option<BackendMount>> {
    let model = backend_mount::Entity::find()
        .filter(backend_mount::Column::MountKey.eq(mount_key))
        .one(conn)
        .await?;
    model.map(mount_from_model).transpose()
}

pub async fn list_mounts<C: ConnectionTrait>(conn: &C) -> FilestoreResult<Vec<BackendMount>> {
    let models = backend_mount::Entity::find()
        .order_by_asc(backend_mount::Column::MountKey)
        .all(conn)
        .await?;
    models.into_iter().map(mount_from_model).collect()
}

/// Fields an admin may change on an existing mount
#[derive(Debug, Clone, Default)]
pub struct MountUpdate {
    pub access_mode: Option<AccessMode>,
    pub state: Option<MountState>,
    pub root_path: Option<Option<String>>,
    pub bucket: Option<Option<String>>,
    pub prefix: Option<Option<String>>,
}

pub async fn update_mount<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    update: MountUpdate,
) -> FilestoreResult<BackendMount> {
    let model = backend_mount::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| FilestoreError::backend_not_found(format!("backend mount {id} not found")))?;

    let mut candidate = mount_from_model(model.clone())?;
    if let Some(access_mode) = update.access_mode {
        candidate.access_mode = access_mode;
    }
    if let Some(state) = update.state {
        candidate.state = state;
    }
    if let Some(root_path) = update.root_path {
        candidate.root_path = root_path;
    }
    if let Some(bucket) = update.bucket {
        candidate.bucket = bucket;
    }
    if let Some(prefix) = update.prefix {
        candidate.prefix = prefix;
    }
    candidate.validate()?;

    let mut active: backend_mount::ActiveModel = model.into();
    active.access_mode = Set(candidate.access_mode.to_string());
    active.state = Set(candidate.state.to_string());
    active.root_path = Set(candidate.root_path.clone());
    active.bucket = Set(candidate.bucket.clone());
    active.prefix = Set(candidate.prefix.clone());
    active.updated_at = Set(Utc::now());
    mount_from_model(active.update(conn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::memory_db;

    #[tokio::test]
    async fn mount_crud_round_trip() {
        let db = memory_db().await;
        let mount = BackendMount {
            id: Uuid::new_v4(),
            mount_key: "primary".into(),
            backend_kind: BackendKind::Local,
            access_mode: AccessMode::Rw,
            state: MountState::Active,
            root_path: Some("/srv/filestore".into()),
            bucket: None,
            prefix: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = create_mount(&db, &mount).await.unwrap();
        assert_eq!(created.mount_key, "primary");

        let fetched = require_mount(&db, created.id).await.unwrap();
        assert_eq!(fetched.backend_kind, BackendKind::Local);

        let by_key = get_mount_by_key(&db, "primary").await.unwrap().unwrap();
        assert_eq!(by_key.id, created.id);

        let updated = update_mount(
            &db,
            created.id,
            MountUpdate {
                access_mode: Some(AccessMode::Ro),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!updated.is_writable());
    }

    #[tokio::test]
    async fn duplicate_mount_keys_are_rejected() {
        let db = memory_db().await;
        let mut mount = BackendMount {
            id: Uuid::new_v4(),
            mount_key: "dup".into(),
            backend_kind: BackendKind::Local,
            access_mode: AccessMode::Rw,
            state: MountState::Active,
            root_path: Some("/srv/a".into()),
            bucket: None,
            prefix: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        create_mount(&db, &mount).await.unwrap();
        mount.id = Uuid::new_v4();
        assert!(create_mount(&db, &mount).await.is_err());
    }

    #[tokio::test]
    async fn missing_mount_is_backend_not_found() {
        let db = memory_db().await;
        let err = require_mount(&db, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), crate::shared::error::ErrorKind::BackendNotFound);
    }
}
