//! Metadata store
//!
//! Typed CRUD over catalog rows. Every function takes a caller-supplied
//! connection or transaction (`impl ConnectionTrait`) and never opens its
//! own; the orchestrator owns transaction boundaries.

pub mod jobs;
pub mod journal;
pub mod mounts;
pub mod nodes;
pub mod rollups;
pub mod snapshots;

pub use nodes::{NewNode, NodeListFilter, NodeListPage, RollupRangeFilter, StateTransition};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::mount::{AccessMode, BackendKind, BackendMount, MountState};
    use crate::infrastructure::database::migration::Migrator;
    use chrono::Utc;
    use sea_orm::{ConnectOptions, Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;
    use uuid::Uuid;

    /// Fresh in-memory catalog. One pooled connection, or every checkout
    /// would see a different empty database.
    pub async fn memory_db() -> DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).sqlx_logging(false);
        let conn = Database::connect(opt).await.unwrap();
        Migrator::up(&conn, None).await.unwrap();
        conn
    }

    pub async fn seed_local_mount(conn: &DatabaseConnection, root_path: &str) -> BackendMount {
        let mount = BackendMount {
            id: Uuid::new_v4(),
            mount_key: format!("test-{}", Uuid::new_v4()),
            backend_kind: BackendKind::Local,
            access_mode: AccessMode::Rw,
            state: MountState::Active,
            root_path: Some(root_path.to_string()),
            bucket: None,
            prefix: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        super::mounts::create_mount(conn, &mount).await.unwrap()
    }
}
