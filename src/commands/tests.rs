use super::*;
use crate::catalog::test_support::{memory_db, seed_local_mount};
use crate::config::{RollupsConfig, SnapshotsConfig};
use crate::domain::node::{NodeKind, NodeState};
use crate::domain::rollup::RollupState;
use crate::executors::LocalExecutor;
use crate::infrastructure::events::EventBus;
use crate::shared::error::ErrorKind;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

struct Harness {
    db: DatabaseConnection,
    orchestrator: CommandOrchestrator,
    mount: BackendMount,
    publisher: Arc<EventPublisher>,
    rollups: Arc<RollupManager>,
    _root: tempfile::TempDir,
    staging: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        let db = memory_db().await;
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mount = seed_local_mount(&db, &root.path().display().to_string()).await;

        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(LocalExecutor::new()));
        let publisher = EventPublisher::inline(EventBus::default());
        let rollups = RollupManager::new(db.clone(), RollupsConfig::default());
        let orchestrator = CommandOrchestrator::new(
            db.clone(),
            Arc::new(registry),
            rollups.clone(),
            publisher.clone(),
            SnapshotsConfig { enabled: true },
        );

        Self {
            db,
            orchestrator,
            mount,
            publisher,
            rollups,
            _root: root,
            staging,
        }
    }

    fn backend_root(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(self.mount.root_path.clone().unwrap())
    }

    async fn stage(&self, contents: &[u8]) -> std::path::PathBuf {
        let staged = self
            .staging
            .path()
            .join(format!("stage-{}", Uuid::new_v4()));
        tokio::fs::write(&staged, contents).await.unwrap();
        staged
    }

    async fn create_directory(&self, path: &str) -> CommandOutcome {
        self.orchestrator
            .run_command(RunCommandRequest::new(Command::CreateDirectory {
                backend_mount_id: self.mount.id,
                path: path.to_string(),
                metadata: None,
            }))
            .await
            .unwrap()
    }

    async fn upload(&self, path: &str, contents: &[u8]) -> CommandOutcome {
        let staged = self.stage(contents).await;
        self.orchestrator
            .run_command(RunCommandRequest::new(Command::UploadFile {
                backend_mount_id: self.mount.id,
                path: path.to_string(),
                staging_path: staged,
                size_bytes: contents.len() as i64,
                checksum: None,
                content_hash: None,
                mime_type: None,
                original_name: None,
                metadata: None,
            }))
            .await
            .unwrap()
    }
}

fn drain_events(rx: &mut broadcast::Receiver<FilestoreEvent>) -> Vec<FilestoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn create_directory_builds_ancestors_and_rollups() {
    let harness = Harness::new().await;
    let mut rx = harness.publisher.subscribe();

    let outcome = harness.create_directory("datasets/observatory").await;
    let node = outcome.node.unwrap();
    assert_eq!(node.kind, NodeKind::Directory);
    assert_eq!(node.state, NodeState::Active);
    assert_eq!(node.depth, 2);
    assert_eq!(node.name, "observatory");
    assert!(harness.backend_root().join("datasets/observatory").is_dir());

    // The auto-created ancestor is a real node with a rollup
    let datasets = nodes::get_node_by_path(&harness.db, harness.mount.id, "datasets", false)
        .await
        .unwrap()
        .unwrap();
    let summary = harness
        .rollups
        .get_summary(datasets.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.directory_count, 1);
    assert_eq!(summary.child_count, 1);

    let events = drain_events(&mut rx);
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec!["command.completed", "node.created", "node.created"]
    );
}

#[tokio::test]
async fn create_existing_directory_is_noop_update() {
    let harness = Harness::new().await;
    let first = harness.create_directory("datasets").await;
    let first_node = first.node.unwrap();

    let mut rx = harness.publisher.subscribe();
    let second = harness.create_directory("datasets").await;
    let second_node = second.node.unwrap();
    assert_eq!(second.result["created"], false);
    assert_eq!(second_node.id, first_node.id);
    // No version bump on the no-op
    assert_eq!(second_node.version, first_node.version);

    let events = drain_events(&mut rx);
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["command.completed", "node.updated"]);
}

#[tokio::test]
async fn create_directory_over_file_conflicts() {
    let harness = Harness::new().await;
    harness.upload("blob.bin", b"x").await;
    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::CreateDirectory {
            backend_mount_id: harness.mount.id,
            path: "blob.bin".to_string(),
            metadata: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeExists);
}

#[tokio::test]
async fn idempotent_create_replays_the_journal() {
    let harness = Harness::new().await;
    let command = Command::CreateDirectory {
        backend_mount_id: harness.mount.id,
        path: "datasets/a".to_string(),
        metadata: None,
    };

    let first = harness
        .orchestrator
        .run_command(RunCommandRequest::new(command.clone()).with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(!first.idempotent);

    let mut rx = harness.publisher.subscribe();
    let second = harness
        .orchestrator
        .run_command(RunCommandRequest::new(command).with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(second.idempotent);
    assert_eq!(second.journal_entry_id, first.journal_entry_id);
    // A replay emits nothing and bumps nothing
    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(second.node.unwrap().version, 1);
}

#[tokio::test]
async fn idempotency_key_with_different_parameters_conflicts() {
    let harness = Harness::new().await;
    harness
        .orchestrator
        .run_command(
            RunCommandRequest::new(Command::CreateDirectory {
                backend_mount_id: harness.mount.id,
                path: "a".to_string(),
                metadata: None,
            })
            .with_idempotency_key("k9"),
        )
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .run_command(
            RunCommandRequest::new(Command::CreateDirectory {
                backend_mount_id: harness.mount.id,
                path: "b".to_string(),
                metadata: None,
            })
            .with_idempotency_key("k9"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdempotencyConflict);
}

#[tokio::test]
async fn upload_verifies_checksums_before_side_effects() {
    let harness = Harness::new().await;
    let staged = harness.stage(b"actual contents").await;

    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::UploadFile {
            backend_mount_id: harness.mount.id,
            path: "x/y.bin".to_string(),
            staging_path: staged,
            size_bytes: 15,
            checksum: Some(format!("sha256:{}", "a".repeat(64))),
            content_hash: None,
            mime_type: None,
            original_name: None,
            metadata: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

    // No metadata change, no backend bytes
    assert!(
        nodes::get_node_by_path(&harness.db, harness.mount.id, "x/y.bin", false)
            .await
            .unwrap()
            .is_none()
    );
    assert!(!harness.backend_root().join("x/y.bin").exists());
}

#[tokio::test]
async fn upload_then_overwrite_tracks_size_and_version() {
    let harness = Harness::new().await;
    harness.create_directory("datasets").await;
    let first = harness.upload("datasets/report.bin", b"0123456789").await;
    let first_node = first.node.unwrap();
    assert_eq!(first_node.size_bytes, 10);
    assert_eq!(first_node.version, 1);
    assert!(first_node.checksum.as_deref().unwrap().starts_with("sha256:"));

    let mut rx = harness.publisher.subscribe();
    let second = harness.upload("datasets/report.bin", b"0123").await;
    let second_node = second.node.unwrap();
    assert_eq!(second_node.id, first_node.id);
    assert_eq!(second_node.version, 2);
    assert_eq!(second_node.size_bytes, 4);

    let events = drain_events(&mut rx);
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec!["command.completed", "node.updated", "node.uploaded"]
    );

    let parent = nodes::get_node_by_path(&harness.db, harness.mount.id, "datasets", false)
        .await
        .unwrap()
        .unwrap();
    let summary = harness.rollups.get_summary(parent.id).await.unwrap().unwrap();
    assert_eq!(summary.size_bytes, 4);
    assert_eq!(summary.file_count, 1);
}

#[tokio::test]
async fn write_file_overwrites_by_node_id() {
    let harness = Harness::new().await;
    let uploaded = harness.upload("notes.txt", b"v1").await.node.unwrap();

    let staged = harness.stage(b"version two").await;
    let outcome = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::WriteFile {
            node_id: uploaded.id,
            staging_path: staged,
            size_bytes: 11,
            checksum: None,
            content_hash: None,
            mime_type: Some("text/plain".to_string()),
            metadata: None,
        }))
        .await
        .unwrap();
    let node = outcome.node.unwrap();
    assert_eq!(node.version, 2);
    assert_eq!(node.size_bytes, 11);
    assert_eq!(node.metadata["mimeType"], "text/plain");
    assert_eq!(
        tokio::fs::read(harness.backend_root().join("notes.txt"))
            .await
            .unwrap(),
        b"version two"
    );
}

#[tokio::test]
async fn non_recursive_delete_guards_children() {
    let harness = Harness::new().await;
    harness.create_directory("w/a").await;
    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::DeleteNode {
            backend_mount_id: harness.mount.id,
            path: "w".to_string(),
            recursive: false,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChildrenExist);
}

#[tokio::test]
async fn recursive_delete_marks_root_and_invalidates_rollup() {
    let harness = Harness::new().await;
    harness.create_directory("w/a").await;
    harness.upload("w/a/f.txt", b"payload").await;

    let mut rx = harness.publisher.subscribe();
    let outcome = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::DeleteNode {
            backend_mount_id: harness.mount.id,
            path: "w".to_string(),
            recursive: true,
        }))
        .await
        .unwrap();
    let deleted = outcome.node.unwrap();
    assert_eq!(deleted.state, NodeState::Deleted);
    assert!(deleted.deleted_at.is_some());

    let events = drain_events(&mut rx);
    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["command.completed", "node.deleted"]);

    // Rollup reports invalid with zero counts; backend bytes are gone
    let summary = harness.rollups.get_summary(deleted.id).await.unwrap().unwrap();
    assert_eq!(summary.state, RollupState::Invalid);
    assert_eq!(summary.size_bytes, 0);
    assert!(!harness.backend_root().join("w").exists());

    // Live lookup misses it, history lookup still sees it
    assert!(
        nodes::get_node_by_path(&harness.db, harness.mount.id, "w", false)
            .await
            .unwrap()
            .is_none()
    );

    // Re-delete without a key: success, no new journal entry
    let again = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::DeleteNode {
            backend_mount_id: harness.mount.id,
            path: "w".to_string(),
            recursive: true,
        }))
        .await
        .unwrap();
    assert!(again.idempotent);
    assert!(again.journal_entry_id.is_none());
}

#[tokio::test]
async fn delete_then_create_yields_a_fresh_node() {
    let harness = Harness::new().await;
    let first = harness.create_directory("p").await.node.unwrap();
    harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::DeleteNode {
            backend_mount_id: harness.mount.id,
            path: "p".to_string(),
            recursive: false,
        }))
        .await
        .unwrap();

    let recreated = harness.create_directory("p").await.node.unwrap();
    assert_ne!(recreated.id, first.id);
    assert_eq!(recreated.version, 1);
    assert_eq!(recreated.state, NodeState::Active);
}

#[tokio::test]
async fn move_directory_rewrites_subtree_and_backend() {
    let harness = Harness::new().await;
    harness.create_directory("src/inner").await;
    harness.upload("src/inner/file.bin", b"abcdef").await;

    let mut rx = harness.publisher.subscribe();
    let outcome = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::MoveNode {
            backend_mount_id: harness.mount.id,
            path: "src".to_string(),
            target_path: "dst/renamed".to_string(),
            target_backend_mount_id: None,
            overwrite: false,
        }))
        .await
        .unwrap();
    let moved = outcome.node.unwrap();
    assert_eq!(moved.path, "dst/renamed");
    assert_eq!(moved.depth, 2);

    let descendant = nodes::get_node_by_path(
        &harness.db,
        harness.mount.id,
        "dst/renamed/inner/file.bin",
        false,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(descendant.size_bytes, 6);
    assert!(
        nodes::get_node_by_path(&harness.db, harness.mount.id, "src/inner", false)
            .await
            .unwrap()
            .is_none()
    );
    assert!(harness
        .backend_root()
        .join("dst/renamed/inner/file.bin")
        .is_file());
    assert!(!harness.backend_root().join("src").exists());

    let types: Vec<String> = drain_events(&mut rx)
        .iter()
        .map(|e| e.event_type().to_string())
        .collect();
    // Ancestor creation precedes the move pair
    assert_eq!(types[0], "command.completed");
    assert!(types.contains(&"node.updated".to_string()));
    assert_eq!(types.last().unwrap(), "node.moved");
}

#[tokio::test]
async fn copy_directory_duplicates_subtree() {
    let harness = Harness::new().await;
    harness.create_directory("tree/sub").await;
    harness.upload("tree/sub/data.bin", b"123456789").await;

    let outcome = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::CopyNode {
            backend_mount_id: harness.mount.id,
            path: "tree".to_string(),
            target_path: "copies/tree".to_string(),
            target_backend_mount_id: None,
            overwrite: false,
        }))
        .await
        .unwrap();
    assert_eq!(outcome.result["copiedNodes"], 3);

    // Source intact, copy present, contents equal
    for path in ["tree/sub/data.bin", "copies/tree/sub/data.bin"] {
        let node = nodes::get_node_by_path(&harness.db, harness.mount.id, path, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.size_bytes, 9);
    }
    assert_eq!(
        tokio::fs::read(harness.backend_root().join("copies/tree/sub/data.bin"))
            .await
            .unwrap(),
        b"123456789"
    );

    // The fresh subtree's rollups settled inside the transaction
    let copy_root = nodes::get_node_by_path(&harness.db, harness.mount.id, "copies/tree", false)
        .await
        .unwrap()
        .unwrap();
    let summary = harness
        .rollups
        .get_summary(copy_root.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.size_bytes, 9);
    assert_eq!(summary.directory_count, 1);

    // Copy onto an existing path without overwrite fails
    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::CopyNode {
            backend_mount_id: harness.mount.id,
            path: "tree".to_string(),
            target_path: "copies/tree".to_string(),
            target_backend_mount_id: None,
            overwrite: false,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeExists);
}

#[tokio::test]
async fn copy_into_own_subtree_is_rejected() {
    let harness = Harness::new().await;
    harness.create_directory("tree/sub").await;
    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::CopyNode {
            backend_mount_id: harness.mount.id,
            path: "tree".to_string(),
            target_path: "tree/sub/clone".to_string(),
            target_backend_mount_id: None,
            overwrite: false,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn update_metadata_merges_and_prunes() {
    let harness = Harness::new().await;
    let node = harness.upload("doc.txt", b"doc").await.node.unwrap();

    let mut set = serde_json::Map::new();
    set.insert("owner".to_string(), serde_json::json!("observatory"));
    set.insert("stage".to_string(), serde_json::json!("raw"));
    let outcome = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::UpdateNodeMetadata {
            backend_mount_id: harness.mount.id,
            node_id: node.id,
            set: Some(set),
            unset: None,
        }))
        .await
        .unwrap();
    assert_eq!(outcome.node.as_ref().unwrap().metadata["owner"], "observatory");

    let mut set = serde_json::Map::new();
    set.insert("stage".to_string(), serde_json::json!("curated"));
    let pruned = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::UpdateNodeMetadata {
            backend_mount_id: harness.mount.id,
            node_id: node.id,
            set: Some(set),
            unset: Some(vec!["owner".to_string()]),
        }))
        .await
        .unwrap();
    let metadata = &pruned.node.as_ref().unwrap().metadata;
    assert_eq!(metadata["stage"], "curated");
    assert!(metadata.get("owner").is_none());
    assert_eq!(pruned.node.unwrap().version, 3);
}

#[tokio::test]
async fn failed_command_journals_the_failure() {
    let harness = Harness::new().await;
    let err = harness
        .orchestrator
        .run_command(
            RunCommandRequest::new(Command::DeleteNode {
                backend_mount_id: harness.mount.id,
                path: "ghost".to_string(),
                recursive: false,
            })
            .with_idempotency_key("del-1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeNotFound);

    let entry = journal::find_by_idempotency_key(&harness.db, "node.delete", "del-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, JournalStatus::Failed);
    assert_eq!(entry.error.unwrap()["code"], "NODE_NOT_FOUND");
}

#[tokio::test]
async fn unknown_mount_is_backend_not_found() {
    let harness = Harness::new().await;
    let err = harness
        .orchestrator
        .run_command(RunCommandRequest::new(Command::CreateDirectory {
            backend_mount_id: Uuid::new_v4(),
            path: "a".to_string(),
            metadata: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendNotFound);
}
