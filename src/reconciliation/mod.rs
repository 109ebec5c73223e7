//! Reconciliation engine
//!
//! Detects drift between the catalog and what backends actually hold.
//! Durable jobs are claimed by a worker pool, evaluated against the
//! executor's observations, and resolved into node state transitions with
//! events. A periodic audit sweep keeps every live directory rotating
//! through the queue.

use crate::catalog::{jobs, mounts, nodes};
use crate::config::ReconciliationConfig;
use crate::domain::node::{Node, NodeState};
use crate::domain::reconciliation::{
    ReconciliationJob, ReconciliationJobStatus, ReconciliationReason, ReconciliationRequest,
};
use crate::executors::{ExecutorContext, ExecutorRegistry, StorageExecutor};
use crate::infrastructure::events::{
    CommandContext, EventPublisher, FilestoreEvent, NodeEventPayload, ReconciliationJobPayload,
};
use crate::shared::error::FilestoreResult;
use crate::shared::path;
use chrono::Utc;
use futures::StreamExt;
use sea_orm::{DatabaseConnection, TransactionTrait};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ReconciliationEngine {
    db: DatabaseConnection,
    executors: Arc<ExecutorRegistry>,
    publisher: Arc<EventPublisher>,
    config: ReconciliationConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReconciliationEngine {
    pub fn new(
        db: DatabaseConnection,
        executors: Arc<ExecutorRegistry>,
        publisher: Arc<EventPublisher>,
        config: ReconciliationConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            db,
            executors,
            publisher,
            config,
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Accept a reconciliation request; duplicates coalesce on the job key.
    pub async fn enqueue(
        &self,
        mut request: ReconciliationRequest,
    ) -> FilestoreResult<ReconciliationJob> {
        request.path = path::normalize_path(&request.path)?;
        mounts::require_mount(&self.db, request.backend_mount_id).await?;
        let (job, created) = jobs::enqueue_job(&self.db, &request).await?;
        if created {
            self.publish_job_event(&job, "queued").await;
        }
        Ok(job)
    }

    /// Start the worker pool and the audit sweep.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.queue_concurrency.max(1) {
            let engine = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                engine.worker_loop(worker_id, shutdown_rx).await;
            }));
        }
        let engine = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move {
            engine.audit_loop(shutdown_rx).await;
        }));
        info!(
            "Reconciliation engine started with {} workers",
            self.config.queue_concurrency.max(1)
        );
    }

    /// Stop workers; in-flight jobs finish their current step.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {
                    loop {
                        let claimed = match jobs::claim_next_job(&self.db).await {
                            Ok(claimed) => claimed,
                            Err(err) => {
                                warn!("Worker {worker_id} failed to poll queue: {err}");
                                break;
                            }
                        };
                        let Some(job) = claimed else { break };
                        debug!("Worker {worker_id} picked job {} ({})", job.id, job.job_key);
                        self.run_job(job).await;
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn run_job(&self, job: ReconciliationJob) {
        self.publish_job_event(&job, "started").await;
        match self.evaluate(&job).await {
            Ok((status, result)) => {
                match jobs::finish_job(&self.db, job.id, status, Some(result), None).await {
                    Ok(finished) => self.publish_job_event(&finished, "completed").await,
                    Err(err) => warn!("Failed to finalize job {}: {err}", job.id),
                }
            }
            Err(err) if err.is_retryable() && job.attempt < self.config.max_attempts => {
                let delay = self.retry_delay(job.attempt);
                warn!(
                    "Job {} attempt {} failed, retrying in {:?}: {err}",
                    job.id, job.attempt, delay
                );
                match jobs::requeue_for_retry(
                    &self.db,
                    job.id,
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    err.to_json(),
                )
                .await
                {
                    Ok(requeued) => self.publish_job_event(&requeued, "queued").await,
                    Err(requeue_err) => {
                        warn!("Failed to requeue job {}: {requeue_err}", job.id)
                    }
                }
            }
            Err(err) => {
                warn!("Job {} failed permanently: {err}", job.id);
                match jobs::finish_job(
                    &self.db,
                    job.id,
                    ReconciliationJobStatus::Failed,
                    None,
                    Some(err.to_json()),
                )
                .await
                {
                    Ok(failed) => self.publish_job_event(&failed, "failed").await,
                    Err(finalize_err) => {
                        warn!("Failed to finalize job {}: {finalize_err}", job.id)
                    }
                }
            }
        }
    }

    fn retry_delay(&self, attempt: i32) -> Duration {
        let base = self.config.retry_base_delay_ms.max(1);
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        let delay = base.saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.config.retry_max_delay_ms))
    }

    /// Compare one catalog node against the backend and apply transitions.
    async fn evaluate(
        &self,
        job: &ReconciliationJob,
    ) -> FilestoreResult<(ReconciliationJobStatus, serde_json::Value)> {
        let mount = mounts::require_mount(&self.db, job.backend_mount_id).await?;
        let executor = self.executors.for_mount(&mount)?;
        let exec_ctx = ExecutorContext {
            mount: mount.clone(),
        };

        let listing = executor
            .list_for_reconciliation(&job.path, &exec_ctx, job.detect_children)
            .await?;

        let node = match job.node_id {
            Some(node_id) => nodes::get_node_by_id(&self.db, node_id, false).await?,
            None => nodes::get_node_by_path(&self.db, mount.id, &job.path, false).await?,
        };
        let Some(node) = node else {
            return Ok((
                ReconciliationJobStatus::Skipped,
                serde_json::json!({
                    "outcome": "untracked",
                    "backendExists": listing.exists,
                }),
            ));
        };
        if node.is_deleted() {
            return Ok((
                ReconciliationJobStatus::Skipped,
                serde_json::json!({ "outcome": "deleted" }),
            ));
        }

        let mut events: Vec<FilestoreEvent> = Vec::new();
        let mut outcome = "clean";

        let txn = self.db.begin().await?;
        if listing.exists {
            let mut transitioned = false;

            // Hash/size verification only when the request asked for it
            if job.requested_hash && node.is_file() {
                let observed_size = listing.info.as_ref().map(|info| info.size_bytes);
                let size_matches = observed_size == Some(node.size_bytes);
                let hash_matches = if size_matches {
                    self.verify_checksum(&executor, &exec_ctx, &node).await?
                } else {
                    false
                };
                if !size_matches || !hash_matches {
                    let updated = nodes::update_node_state(
                        &txn,
                        node.id,
                        NodeState::Inconsistent,
                        nodes::StateTransition {
                            record_drift: true,
                            record_seen: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                    events.push(drift_event(&updated));
                    outcome = "inconsistent";
                    transitioned = true;
                }
            }

            if !transitioned {
                match node.state {
                    NodeState::Missing | NodeState::Inconsistent => {
                        let updated = nodes::update_node_state(
                            &txn,
                            node.id,
                            NodeState::Active,
                            nodes::StateTransition {
                                record_reconciled: true,
                                record_seen: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                        events.push(FilestoreEvent::NodeReconciled(NodeEventPayload::from_node(
                            &updated,
                            CommandContext::default(),
                        )));
                        outcome = "reconciled";
                    }
                    _ => {
                        nodes::touch_consistency(&txn, node.id, true).await?;
                    }
                }
            }
        } else if node.state != NodeState::Missing {
            let updated = nodes::update_node_state(
                &txn,
                node.id,
                NodeState::Missing,
                nodes::StateTransition {
                    record_drift: true,
                    ..Default::default()
                },
            )
            .await?;
            events.push(FilestoreEvent::NodeMissing(NodeEventPayload::from_node(
                &updated,
                CommandContext::default(),
            )));
            events.push(drift_event(&updated));
            outcome = "missing";
        } else {
            nodes::touch_consistency(&txn, node.id, false).await?;
        }
        txn.commit().await?;

        for event in events {
            self.publisher.publish(event).await;
        }

        // Child divergence spawns narrower follow-up jobs
        let mut follow_ups = 0usize;
        if job.detect_children && node.is_directory() && listing.exists {
            follow_ups = self.enqueue_child_follow_ups(&node, &listing.children).await?;
        }

        Ok((
            ReconciliationJobStatus::Succeeded,
            serde_json::json!({
                "outcome": outcome,
                "backendExists": listing.exists,
                "followUpJobs": follow_ups,
            }),
        ))
    }

    async fn verify_checksum(
        &self,
        executor: &Arc<dyn StorageExecutor>,
        exec_ctx: &ExecutorContext,
        node: &Node,
    ) -> FilestoreResult<bool> {
        let Some(expected) = node.checksum.as_deref() else {
            return Ok(true); // Nothing recorded to compare against
        };
        let mut read = executor
            .create_read_stream(&node.path, exec_ctx, None)
            .await?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = read.stream.next().await {
            hasher.update(&chunk?);
        }
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        Ok(actual == expected)
    }

    async fn enqueue_child_follow_ups(
        &self,
        node: &Node,
        backend_children: &[crate::executors::BackendChild],
    ) -> FilestoreResult<usize> {
        let catalog_children = nodes::list_children(&self.db, node.id).await?;
        let catalog_names: std::collections::BTreeSet<&str> =
            catalog_children.iter().map(|c| c.name.as_str()).collect();
        let backend_names: std::collections::BTreeSet<&str> =
            backend_children.iter().map(|c| c.name.as_str()).collect();

        let mut enqueued = 0usize;
        for name in catalog_names.symmetric_difference(&backend_names) {
            let child_path = path::join_path(&node.path, name);
            let request = ReconciliationRequest {
                backend_mount_id: node.backend_mount_id,
                path: child_path,
                node_id: None,
                reason: ReconciliationReason::Drift,
                detect_children: false,
                requested_hash: false,
            };
            let (job, created) = jobs::enqueue_job(&self.db, &request).await?;
            if created {
                self.publish_job_event(&job, "queued").await;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    async fn audit_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.audit_interval_ms.max(1000)));
        tick.tick().await; // Skip the immediate first fire
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.audit_sweep().await {
                        warn!("Audit sweep failed: {err}");
                    }
                }
            }
        }
    }

    /// Enqueue audit jobs for the least-recently-checked live directories.
    pub async fn audit_sweep(&self) -> FilestoreResult<usize> {
        let candidates =
            nodes::list_audit_candidates(&self.db, self.config.audit_batch_size).await?;
        let mut enqueued = 0usize;
        for node in candidates {
            let request = ReconciliationRequest {
                backend_mount_id: node.backend_mount_id,
                path: node.path.clone(),
                node_id: Some(node.id),
                reason: ReconciliationReason::Audit,
                detect_children: true,
                requested_hash: false,
            };
            let (job, created) = jobs::enqueue_job(&self.db, &request).await?;
            if created {
                self.publish_job_event(&job, "queued").await;
                enqueued += 1;
            }
        }
        debug!("Audit sweep enqueued {enqueued} jobs");
        Ok(enqueued)
    }

    /// Claim and run queued jobs until the queue drains. Used by tests and
    /// the CLI; the worker pool does the same thing on a timer.
    pub async fn drain_queue(&self) -> FilestoreResult<usize> {
        let mut processed = 0usize;
        while let Some(job) = jobs::claim_next_job(&self.db).await? {
            self.run_job(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn publish_job_event(&self, job: &ReconciliationJob, transition: &str) {
        let payload = ReconciliationJobPayload {
            job_id: job.id,
            job_key: job.job_key.clone(),
            backend_mount_id: job.backend_mount_id,
            node_id: job.node_id,
            path: job.path.clone(),
            reason: job.reason.to_string(),
            status: job.status.to_string(),
            attempt: job.attempt,
            result: job.result.clone(),
            error: job.error.clone(),
            observed_at: Utc::now(),
        };
        let event = match transition {
            "queued" => FilestoreEvent::ReconciliationJobQueued(payload),
            "started" => FilestoreEvent::ReconciliationJobStarted(payload),
            "completed" => FilestoreEvent::ReconciliationJobCompleted(payload),
            "failed" => FilestoreEvent::ReconciliationJobFailed(payload),
            _ => FilestoreEvent::ReconciliationJobCancelled(payload),
        };
        self.publisher.publish(event).await;
    }
}

fn drift_event(node: &Node) -> FilestoreEvent {
    FilestoreEvent::DriftDetected(NodeEventPayload::from_node(
        node,
        CommandContext::default(),
    ))
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
