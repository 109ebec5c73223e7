//! Database infrastructure using SeaORM

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr, Statement,
};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::info;

pub mod entities;
pub mod migration;

/// SQLite PRAGMAs applied to every sqlite connection for write throughput
const SQLITE_PRAGMAS: &[&str] = &[
	"PRAGMA journal_mode=WAL",
	"PRAGMA synchronous=NORMAL",
	"PRAGMA temp_store=MEMORY",
	"PRAGMA cache_size=-20000",
	"PRAGMA mmap_size=67108864",
];

/// Database wrapper for the filestore catalog
pub struct Database {
	conn: DatabaseConnection,
}

impl Database {
	/// Connect to the catalog database.
	///
	/// Accepts `sqlite://` (with `?mode=rwc` to create) and `postgres://` URLs.
	pub async fn connect(
		url: &str,
		max_connections: u32,
		connect_timeout: Duration,
		idle_timeout: Duration,
	) -> Result<Self, DbErr> {
		let mut opt = ConnectOptions::new(url.to_string());
		opt.max_connections(max_connections)
			.connect_timeout(connect_timeout)
			.idle_timeout(idle_timeout)
			.sqlx_logging(false); // We use tracing instead

		let conn = SeaDatabase::connect(opt).await?;

		if conn.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
			for pragma in SQLITE_PRAGMAS {
				let _ = conn
					.execute(Statement::from_string(
						sea_orm::DatabaseBackend::Sqlite,
						*pragma,
					))
					.await;
			}
		}

		info!("Connected to catalog database");

		Ok(Self { conn })
	}

	/// Run pending migrations
	pub async fn migrate(&self) -> Result<(), DbErr> {
		migration::Migrator::up(&self.conn, None).await?;
		info!("Database migrations completed");
		Ok(())
	}

	/// Get the database connection
	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	/// Close the underlying pool
	pub async fn close(self) -> Result<(), DbErr> {
		self.conn.close().await
	}
}
