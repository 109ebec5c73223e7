//! Filestore core
//!
//! A content-addressable file/object metadata service in front of
//! heterogeneous storage backends. One transactional namespace of
//! hierarchical nodes with journaled, idempotent, event-emitting commands,
//! directory rollups, and a reconciliation engine that repairs drift between
//! the catalog and the bytes the backends actually hold.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod domain;
pub mod executors;
pub mod infrastructure;
pub mod reconciliation;
pub mod rollups;
pub mod shared;

use crate::catalog::{journal, mounts, nodes};
use crate::commands::{CommandOrchestrator, RunCommandRequest};
use crate::config::FilestoreConfig;
use crate::domain::command::CommandOutcome;
use crate::domain::mount::BackendMount;
use crate::domain::node::Node;
use crate::domain::reconciliation::{ReconciliationJob, ReconciliationRequest};
use crate::executors::{
    ByteRange, ExecutorContext, ExecutorRegistry, LocalExecutor, PresignedDownload, ReadStream,
    S3Executor,
};
use crate::infrastructure::database::Database;
use crate::infrastructure::events::{
    CommandContext, EventBus, EventPublisher, FilestoreEvent, NodeEventPayload,
};
use crate::reconciliation::ReconciliationEngine;
use crate::rollups::RollupManager;
use crate::shared::error::{FilestoreError, FilestoreResult};
use crate::shared::path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The assembled service: every singleton with explicit init and teardown.
pub struct FilestoreCore {
    config: FilestoreConfig,
    db: Database,
    publisher: Arc<EventPublisher>,
    executors: Arc<ExecutorRegistry>,
    rollups: Arc<RollupManager>,
    orchestrator: Arc<CommandOrchestrator>,
    reconciliation: Arc<ReconciliationEngine>,
    pruner: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FilestoreCore {
    /// Initialize with the default executor set (local + s3).
    pub async fn init(config: FilestoreConfig) -> FilestoreResult<Self> {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(LocalExecutor::new()));
        registry.register(Arc::new(S3Executor::from_env().await));
        Self::init_with_executors(config, registry).await
    }

    /// Initialize with a caller-supplied executor registry.
    pub async fn init_with_executors(
        config: FilestoreConfig,
        executors: ExecutorRegistry,
    ) -> FilestoreResult<Self> {
        let db = Database::connect(
            &config.database.url,
            config.database.max_connections,
            Duration::from_millis(config.database.connect_timeout_ms),
            Duration::from_millis(config.database.idle_timeout_ms),
        )
        .await?;
        db.migrate().await?;

        let publisher =
            EventPublisher::connect(&config.events, &config.redis, EventBus::default()).await?;

        let executors = Arc::new(executors);
        let rollups = RollupManager::new(db.conn().clone(), config.rollups.clone());
        let orchestrator = Arc::new(CommandOrchestrator::new(
            db.conn().clone(),
            executors.clone(),
            rollups.clone(),
            publisher.clone(),
            config.snapshots.clone(),
        ));
        let reconciliation = ReconciliationEngine::new(
            db.conn().clone(),
            executors.clone(),
            publisher.clone(),
            config.reconciliation.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!("Filestore core initialized");
        Ok(Self {
            config,
            db,
            publisher,
            executors,
            rollups,
            orchestrator,
            reconciliation,
            pruner: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Start the reconciliation workers, audit sweep, and journal pruning.
    pub async fn start_background(&self) {
        self.reconciliation.start().await;

        let mut pruner = self.pruner.lock().await;
        if pruner.is_none() {
            let db = self.db.conn().clone();
            let journal_config = self.config.journal.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            *pruner = Some(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    journal_config.prune_interval_ms.max(1000),
                ));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tick.tick() => {
                            let cutoff = chrono::Utc::now()
                                - chrono::Duration::days(journal_config.retention_days);
                            loop {
                                match journal::prune_terminal_before(
                                    &db,
                                    cutoff,
                                    journal_config.prune_batch_size,
                                )
                                .await
                                {
                                    Ok(0) => break,
                                    Ok(removed) => {
                                        info!("Pruned {removed} journal entries");
                                    }
                                    Err(err) => {
                                        warn!("Journal pruning failed: {err}");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Run one command through the orchestrator.
    pub async fn run_command(&self, request: RunCommandRequest) -> FilestoreResult<CommandOutcome> {
        self.orchestrator.run_command(request).await
    }

    /// Accept a reconciliation request (may coalesce into an existing job).
    pub async fn enqueue_reconciliation(
        &self,
        request: ReconciliationRequest,
    ) -> FilestoreResult<ReconciliationJob> {
        self.reconciliation.enqueue(request).await
    }

    /// Stream a file's bytes, with optional range, emitting `node.downloaded`.
    pub async fn read_file(
        &self,
        backend_mount_id: Uuid,
        raw_path: &str,
        range: Option<ByteRange>,
        principal: Option<String>,
    ) -> FilestoreResult<(Node, ReadStream)> {
        let (node, mount) = self.resolve_file(backend_mount_id, raw_path).await?;
        let executor = self.executors.for_mount(&mount)?;
        let stream = executor
            .create_read_stream(
                &node.path,
                &ExecutorContext {
                    mount: mount.clone(),
                },
                range,
            )
            .await?;

        self.publisher
            .publish(FilestoreEvent::NodeDownloaded(NodeEventPayload::from_node(
                &node,
                CommandContext {
                    principal,
                    ..Default::default()
                },
            )))
            .await;
        Ok((node, stream))
    }

    /// Create a time-bounded signed download URL (s3 mounts only).
    pub async fn presign_download(
        &self,
        backend_mount_id: Uuid,
        raw_path: &str,
        expires_in: Duration,
    ) -> FilestoreResult<(Node, PresignedDownload)> {
        let (node, mount) = self.resolve_file(backend_mount_id, raw_path).await?;
        let executor = self.executors.for_mount(&mount)?;
        let presigned = executor
            .create_presigned_download(
                &node.path,
                &ExecutorContext {
                    mount: mount.clone(),
                },
                expires_in,
            )
            .await?;
        Ok((node, presigned))
    }

    async fn resolve_file(
        &self,
        backend_mount_id: Uuid,
        raw_path: &str,
    ) -> FilestoreResult<(Node, BackendMount)> {
        let normalized = path::normalize_path(raw_path)?;
        let mount = mounts::require_mount(self.db.conn(), backend_mount_id).await?;
        let node = nodes::get_node_by_path(self.db.conn(), mount.id, &normalized, false)
            .await?
            .ok_or_else(|| FilestoreError::node_not_found(format!("no node at '{normalized}'")))?;
        if node.is_directory() {
            return Err(FilestoreError::not_a_file(format!(
                "'{normalized}' is a directory"
            )));
        }
        Ok((node, mount))
    }

    pub fn config(&self) -> &FilestoreConfig {
        &self.config
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        self.db.conn()
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn rollups(&self) -> &Arc<RollupManager> {
        &self.rollups
    }

    pub fn orchestrator(&self) -> &Arc<CommandOrchestrator> {
        &self.orchestrator
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciliation
    }

    /// Stop background work and close shared resources.
    pub async fn shutdown(&self) {
        info!("Shutting down filestore core");
        let _ = self.shutdown_tx.send(true);
        if let Some(pruner) = self.pruner.lock().await.take() {
            pruner.abort();
        }
        self.reconciliation.shutdown().await;
        self.rollups.shutdown().await;
        self.publisher.shutdown().await;
    }
}
