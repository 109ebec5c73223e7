//! Rollup manager
//!
//! Keeps per-directory aggregates consistent under concurrent mutation. The
//! orchestrator hands it signed deltas inside the command transaction; deep
//! or wide mutations defer to a background recompute pool instead of walking
//! synchronously.

use crate::catalog::{nodes, rollups};
use crate::config::RollupsConfig;
use crate::domain::node::Node;
use crate::domain::rollup::{RollupDelta, RollupSummary};
use crate::shared::error::FilestoreResult;
use lru::LruCache;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

struct CacheEntry {
    summary: RollupSummary,
    inserted_at: Instant,
}

pub struct RollupManager {
    db: DatabaseConnection,
    config: RollupsConfig,
    cache: Mutex<LruCache<Uuid, CacheEntry>>,
    recalc_tx: mpsc::UnboundedSender<Uuid>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RollupManager {
    /// Create the manager and start its recompute workers.
    pub fn new(db: DatabaseConnection, config: RollupsConfig) -> Arc<Self> {
        let (recalc_tx, recalc_rx) = mpsc::unbounded_channel();
        let capacity =
            NonZeroUsize::new(config.cache_max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let manager = Arc::new(Self {
            db,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            recalc_tx,
            workers: Mutex::new(Vec::new()),
        });
        manager.clone().spawn_workers(recalc_rx);
        manager
    }

    fn spawn_workers(self: Arc<Self>, recalc_rx: mpsc::UnboundedReceiver<Uuid>) {
        let shared_rx = Arc::new(Mutex::new(recalc_rx));
        let count = self.config.queue_concurrency.max(1);
        let manager = self.clone();
        tokio::spawn(async move {
            let mut workers = manager.workers.lock().await;
            for worker_id in 0..count {
                let manager = manager.clone();
                let shared_rx = shared_rx.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let node_id = { shared_rx.lock().await.recv().await };
                        let Some(node_id) = node_id else { break };
                        debug!("Rollup worker {worker_id} recomputing {node_id}");
                        if let Err(err) = manager.recalculate(node_id).await {
                            warn!("Rollup recompute for {node_id} failed: {err}");
                        }
                    }
                }));
            }
        });
    }

    /// Read a rollup summary, serving from cache within the TTL.
    pub async fn get_summary(&self, node_id: Uuid) -> FilestoreResult<Option<RollupSummary>> {
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&node_id) {
                if entry.inserted_at.elapsed() < ttl {
                    return Ok(Some(entry.summary.clone()));
                }
                cache.pop(&node_id);
            }
        }

        let summary = rollups::get_rollup(&self.db, node_id).await?;
        if let Some(summary) = &summary {
            self.cache.lock().await.put(
                node_id,
                CacheEntry {
                    summary: summary.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }
        Ok(summary)
    }

    /// Apply a mutation's delta to the parent and cascade to its ancestors,
    /// inside the caller's transaction.
    ///
    /// Returns node ids whose rollups went `pending` and need a recompute
    /// scheduled once the transaction commits.
    pub async fn apply_for_mutation<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &Node,
        delta: RollupDelta,
        force_pending: bool,
    ) -> FilestoreResult<Vec<Uuid>> {
        if delta.is_zero() {
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();
        let current = rollups::ensure_rollup(conn, parent.id).await?;
        let defer = force_pending
            || parent.depth > self.config.recalc_depth_threshold
            || current.child_count > self.config.recalc_child_count_threshold;

        rollups::apply_delta(conn, parent.id, &delta, defer).await?;
        self.evict(parent.id).await;
        if defer {
            pending.push(parent.id);
        }

        // Size and recursive directory totals cascade upward
        let ancestor_delta = delta.for_ancestors();
        if !ancestor_delta.is_zero() {
            let mut cursor = parent.parent_id;
            let mut hops = 0;
            while let Some(ancestor_id) = cursor {
                if hops >= self.config.max_cascade_depth {
                    break;
                }
                // Lock the ancestor's node row before touching its rollup,
                // same as the handlers do for the immediate parent; the
                // read-modify-write below is only safe under that lock
                let Some(ancestor) = nodes::get_node_by_id(conn, ancestor_id, true).await? else {
                    break;
                };
                rollups::apply_delta(conn, ancestor.id, &ancestor_delta, defer).await?;
                self.evict(ancestor.id).await;
                if defer {
                    pending.push(ancestor.id);
                }
                cursor = ancestor.parent_id;
                hops += 1;
            }
        }

        Ok(pending)
    }

    /// Item count above which subtree-sized mutations defer their rollup
    /// maintenance to the background pool.
    pub fn defer_item_threshold(&self) -> i64 {
        self.config.recalc_child_count_threshold
    }

    /// Queue a background recompute.
    pub fn schedule_recalculate(&self, node_id: Uuid) {
        let _ = self.recalc_tx.send(node_id);
    }

    /// Recompute aggregates from direct children immediately.
    pub async fn recalculate(&self, node_id: Uuid) -> FilestoreResult<RollupSummary> {
        let summary = rollups::recalculate(&self.db, node_id).await?;
        self.evict(node_id).await;
        Ok(summary)
    }

    /// Transition a deleted node's rollup to `invalid` with zeroed counts.
    pub async fn invalidate_node<C: ConnectionTrait>(
        &self,
        conn: &C,
        node_id: Uuid,
    ) -> FilestoreResult<()> {
        rollups::mark_invalid(conn, node_id).await?;
        self.evict(node_id).await;
        Ok(())
    }

    async fn evict(&self, node_id: Uuid) {
        self.cache.lock().await.pop(&node_id);
    }

    /// Stop the recompute workers.
    pub async fn shutdown(&self) {
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::nodes::{insert_node, NewNode};
    use crate::catalog::test_support::{memory_db, seed_local_mount};
    use crate::domain::node::NodeKind;
    use crate::domain::rollup::RollupState;
    use pretty_assertions::assert_eq;

    fn config() -> RollupsConfig {
        RollupsConfig {
            cache_ttl_seconds: 60,
            cache_max_entries: 16,
            recalc_depth_threshold: 6,
            recalc_child_count_threshold: 100,
            max_cascade_depth: 32,
            queue_concurrency: 1,
        }
    }

    #[tokio::test]
    async fn deltas_cascade_to_ancestors() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let manager = RollupManager::new(db.clone(), config());

        let root = insert_node(&db, NewNode::directory(mount.id, None, "a"))
            .await
            .unwrap();
        let child = insert_node(&db, NewNode::directory(mount.id, Some(root.id), "a/b"))
            .await
            .unwrap();

        // A file landing in a/b: full delta to the parent, size-only upward
        let pending = manager
            .apply_for_mutation(
                &db,
                &child,
                RollupDelta {
                    size_bytes: 100,
                    file_count: 1,
                    directory_count: 0,
                    child_count: 1,
                },
                false,
            )
            .await
            .unwrap();
        assert!(pending.is_empty());

        let child_summary = manager.get_summary(child.id).await.unwrap().unwrap();
        assert_eq!(child_summary.size_bytes, 100);
        assert_eq!(child_summary.file_count, 1);
        assert_eq!(child_summary.child_count, 1);

        let root_summary = manager.get_summary(root.id).await.unwrap().unwrap();
        assert_eq!(root_summary.size_bytes, 100);
        assert_eq!(root_summary.file_count, 0);
        assert_eq!(root_summary.child_count, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn forced_pending_defers_and_reports() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let manager = RollupManager::new(db.clone(), config());
        let dir = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();

        let pending = manager
            .apply_for_mutation(
                &db,
                &dir,
                RollupDelta {
                    size_bytes: 10,
                    file_count: 1,
                    directory_count: 0,
                    child_count: 1,
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(pending, vec![dir.id]);

        let summary = manager.get_summary(dir.id).await.unwrap().unwrap();
        assert_eq!(summary.state, RollupState::Pending);
        assert_eq!(summary.size_bytes, 0);
        assert_eq!(summary.pending_bytes_delta, 10);

        // The recompute flushes pending state from actual children
        let mut file = NewNode::directory(mount.id, Some(dir.id), "d/f");
        file.kind = NodeKind::File;
        file.size_bytes = 10;
        insert_node(&db, file).await.unwrap();
        let recomputed = manager.recalculate(dir.id).await.unwrap();
        assert_eq!(recomputed.state, RollupState::UpToDate);
        assert_eq!(recomputed.size_bytes, 10);
        assert_eq!(recomputed.pending_bytes_delta, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn cache_never_outlives_writes() {
        let db = memory_db().await;
        let mount = seed_local_mount(&db, "/tmp/r").await;
        let manager = RollupManager::new(db.clone(), config());
        let dir = insert_node(&db, NewNode::directory(mount.id, None, "d"))
            .await
            .unwrap();

        crate::catalog::rollups::ensure_rollup(&db, dir.id).await.unwrap();
        let before = manager.get_summary(dir.id).await.unwrap().unwrap();
        assert_eq!(before.size_bytes, 0);

        manager
            .apply_for_mutation(
                &db,
                &dir,
                RollupDelta {
                    size_bytes: 5,
                    file_count: 1,
                    directory_count: 0,
                    child_count: 1,
                },
                false,
            )
            .await
            .unwrap();

        // The write evicted the cached zero; the re-read sees the new row
        let after = manager.get_summary(dir.id).await.unwrap().unwrap();
        assert_eq!(after.size_bytes, 5);

        manager.shutdown().await;
    }
}
