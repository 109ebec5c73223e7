//! Initial migration to create all tables

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		// Create backend_mounts table
		manager
			.create_table(
				Table::create()
					.table(BackendMounts::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(BackendMounts::Id)
							.uuid()
							.not_null()
							.primary_key(),
					)
					.col(
						ColumnDef::new(BackendMounts::MountKey)
							.string()
							.not_null()
							.unique_key(),
					)
					.col(ColumnDef::new(BackendMounts::BackendKind).string().not_null())
					.col(
						ColumnDef::new(BackendMounts::AccessMode)
							.string()
							.not_null()
							.default("rw"),
					)
					.col(
						ColumnDef::new(BackendMounts::State)
							.string()
							.not_null()
							.default("active"),
					)
					.col(ColumnDef::new(BackendMounts::RootPath).string())
					.col(ColumnDef::new(BackendMounts::Bucket).string())
					.col(ColumnDef::new(BackendMounts::Prefix).string())
					.col(
						ColumnDef::new(BackendMounts::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(BackendMounts::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		// Create nodes table
		manager
			.create_table(
				Table::create()
					.table(Nodes::Table)
					.if_not_exists()
					.col(ColumnDef::new(Nodes::Id).uuid().not_null().primary_key())
					.col(ColumnDef::new(Nodes::BackendMountId).uuid().not_null())
					.col(ColumnDef::new(Nodes::ParentId).uuid())
					.col(ColumnDef::new(Nodes::Path).string().not_null())
					.col(ColumnDef::new(Nodes::Name).string().not_null())
					.col(ColumnDef::new(Nodes::Depth).integer().not_null())
					.col(ColumnDef::new(Nodes::Kind).string().not_null())
					.col(
						ColumnDef::new(Nodes::SizeBytes)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(ColumnDef::new(Nodes::Checksum).string())
					.col(ColumnDef::new(Nodes::ContentHash).string())
					.col(
						ColumnDef::new(Nodes::IsSymlink)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(Nodes::State)
							.string()
							.not_null()
							.default("active"),
					)
					.col(
						ColumnDef::new(Nodes::ConsistencyState)
							.string()
							.not_null()
							.default("active"),
					)
					.col(
						ColumnDef::new(Nodes::Version)
							.big_integer()
							.not_null()
							.default(1),
					)
					.col(ColumnDef::new(Nodes::Metadata).json().not_null())
					.col(
						ColumnDef::new(Nodes::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(Nodes::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(Nodes::LastSeenAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(Nodes::LastModifiedAt).timestamp_with_time_zone())
					.col(
						ColumnDef::new(Nodes::ConsistencyCheckedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(Nodes::LastReconciledAt).timestamp_with_time_zone())
					.col(ColumnDef::new(Nodes::LastDriftDetectedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(Nodes::DeletedAt).timestamp_with_time_zone())
					.foreign_key(
						ForeignKey::create()
							.name("fk_nodes_backend_mount")
							.from(Nodes::Table, Nodes::BackendMountId)
							.to(BackendMounts::Table, BackendMounts::Id),
					)
					.to_owned(),
			)
			.await?;

		// Live rows are unique per (mount, path); deleted rows retain history
		manager
			.get_connection()
			.execute_unprepared(
				"CREATE UNIQUE INDEX idx_nodes_mount_path_live \
				 ON nodes (backend_mount_id, path) WHERE state != 'deleted'",
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_nodes_parent")
					.table(Nodes::Table)
					.col(Nodes::ParentId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_nodes_mount_state")
					.table(Nodes::Table)
					.col(Nodes::BackendMountId)
					.col(Nodes::State)
					.to_owned(),
			)
			.await?;

		// Create rollups table
		manager
			.create_table(
				Table::create()
					.table(Rollups::Table)
					.if_not_exists()
					.col(ColumnDef::new(Rollups::NodeId).uuid().not_null().primary_key())
					.col(
						ColumnDef::new(Rollups::SizeBytes)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::FileCount)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::DirectoryCount)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::ChildCount)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::PendingBytesDelta)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::PendingItemsDelta)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(Rollups::State)
							.string()
							.not_null()
							.default("up_to_date"),
					)
					.col(ColumnDef::new(Rollups::LastCalculatedAt).timestamp_with_time_zone())
					.col(
						ColumnDef::new(Rollups::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.foreign_key(
						ForeignKey::create()
							.name("fk_rollups_node")
							.from(Rollups::Table, Rollups::NodeId)
							.to(Nodes::Table, Nodes::Id),
					)
					.to_owned(),
			)
			.await?;

		// Create journal_entries table
		manager
			.create_table(
				Table::create()
					.table(JournalEntries::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(JournalEntries::Id)
							.uuid()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(JournalEntries::Command).string().not_null())
					.col(ColumnDef::new(JournalEntries::Status).string().not_null())
					.col(ColumnDef::new(JournalEntries::Principal).string())
					.col(ColumnDef::new(JournalEntries::IdempotencyKey).string())
					.col(ColumnDef::new(JournalEntries::CorrelationId).string())
					.col(ColumnDef::new(JournalEntries::PrimaryNodeId).uuid())
					.col(ColumnDef::new(JournalEntries::SecondaryNodeId).uuid())
					.col(
						ColumnDef::new(JournalEntries::AffectedNodeIds)
							.json()
							.not_null(),
					)
					.col(ColumnDef::new(JournalEntries::Parameters).json().not_null())
					.col(ColumnDef::new(JournalEntries::Result).json())
					.col(ColumnDef::new(JournalEntries::Error).json())
					.col(
						ColumnDef::new(JournalEntries::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(JournalEntries::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(JournalEntries::CompletedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(JournalEntries::DurationMs).big_integer())
					.to_owned(),
			)
			.await?;

		// Idempotency anchor: one journal row per (command, key) when a key is present
		manager
			.get_connection()
			.execute_unprepared(
				"CREATE UNIQUE INDEX idx_journal_command_idempotency_key \
				 ON journal_entries (command, idempotency_key) WHERE idempotency_key IS NOT NULL",
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_journal_status_created")
					.table(JournalEntries::Table)
					.col(JournalEntries::Status)
					.col(JournalEntries::CreatedAt)
					.to_owned(),
			)
			.await?;

		// Create snapshots table
		manager
			.create_table(
				Table::create()
					.table(Snapshots::Table)
					.if_not_exists()
					.col(ColumnDef::new(Snapshots::Id).uuid().not_null().primary_key())
					.col(ColumnDef::new(Snapshots::NodeId).uuid().not_null())
					.col(ColumnDef::new(Snapshots::Version).big_integer().not_null())
					.col(ColumnDef::new(Snapshots::Captured).json().not_null())
					.col(
						ColumnDef::new(Snapshots::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.foreign_key(
						ForeignKey::create()
							.name("fk_snapshots_node")
							.from(Snapshots::Table, Snapshots::NodeId)
							.to(Nodes::Table, Nodes::Id),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_snapshots_node_version")
					.table(Snapshots::Table)
					.col(Snapshots::NodeId)
					.col(Snapshots::Version)
					.unique()
					.to_owned(),
			)
			.await?;

		// Create reconciliation_jobs table
		manager
			.create_table(
				Table::create()
					.table(ReconciliationJobs::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ReconciliationJobs::Id)
							.uuid()
							.not_null()
							.primary_key(),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::JobKey)
							.string()
							.not_null()
							.unique_key(),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::BackendMountId)
							.uuid()
							.not_null(),
					)
					.col(ColumnDef::new(ReconciliationJobs::NodeId).uuid())
					.col(ColumnDef::new(ReconciliationJobs::Path).string().not_null())
					.col(ColumnDef::new(ReconciliationJobs::Reason).string().not_null())
					.col(
						ColumnDef::new(ReconciliationJobs::Status)
							.string()
							.not_null()
							.default("queued"),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::DetectChildren)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::RequestedHash)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::Attempt)
							.integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(ReconciliationJobs::EnqueuedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ReconciliationJobs::StartedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(ReconciliationJobs::CompletedAt).timestamp_with_time_zone())
					.col(
						ColumnDef::new(ReconciliationJobs::NextRunAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ReconciliationJobs::DurationMs).big_integer())
					.col(ColumnDef::new(ReconciliationJobs::Result).json())
					.col(ColumnDef::new(ReconciliationJobs::Error).json())
					.foreign_key(
						ForeignKey::create()
							.name("fk_reconciliation_jobs_backend_mount")
							.from(ReconciliationJobs::Table, ReconciliationJobs::BackendMountId)
							.to(BackendMounts::Table, BackendMounts::Id),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_reconciliation_jobs_status_next_run")
					.table(ReconciliationJobs::Table)
					.col(ReconciliationJobs::Status)
					.col(ReconciliationJobs::NextRunAt)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_reconciliation_jobs_mount_path")
					.table(ReconciliationJobs::Table)
					.col(ReconciliationJobs::BackendMountId)
					.col(ReconciliationJobs::Path)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(ReconciliationJobs::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Snapshots::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(JournalEntries::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Rollups::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Nodes::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(BackendMounts::Table).to_owned())
			.await?;
		Ok(())
	}
}

#[derive(DeriveIden)]
enum BackendMounts {
	Table,
	Id,
	MountKey,
	BackendKind,
	AccessMode,
	State,
	RootPath,
	Bucket,
	Prefix,
	CreatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum Nodes {
	Table,
	Id,
	BackendMountId,
	ParentId,
	Path,
	Name,
	Depth,
	Kind,
	SizeBytes,
	Checksum,
	ContentHash,
	IsSymlink,
	State,
	ConsistencyState,
	Version,
	Metadata,
	CreatedAt,
	UpdatedAt,
	LastSeenAt,
	LastModifiedAt,
	ConsistencyCheckedAt,
	LastReconciledAt,
	LastDriftDetectedAt,
	DeletedAt,
}

#[derive(DeriveIden)]
enum Rollups {
	Table,
	NodeId,
	SizeBytes,
	FileCount,
	DirectoryCount,
	ChildCount,
	PendingBytesDelta,
	PendingItemsDelta,
	State,
	LastCalculatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum JournalEntries {
	Table,
	Id,
	Command,
	Status,
	Principal,
	IdempotencyKey,
	CorrelationId,
	PrimaryNodeId,
	SecondaryNodeId,
	AffectedNodeIds,
	Parameters,
	Result,
	Error,
	CreatedAt,
	UpdatedAt,
	CompletedAt,
	DurationMs,
}

#[derive(DeriveIden)]
enum Snapshots {
	Table,
	Id,
	NodeId,
	Version,
	Captured,
	CreatedAt,
}

#[derive(DeriveIden)]
enum ReconciliationJobs {
	Table,
	Id,
	JobKey,
	BackendMountId,
	NodeId,
	Path,
	Reason,
	Status,
	DetectChildren,
	RequestedHash,
	Attempt,
	EnqueuedAt,
	StartedAt,
	CompletedAt,
	NextRunAt,
	DurationMs,
	Result,
	Error,
}
