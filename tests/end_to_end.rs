//! End-to-end scenarios over a file-backed catalog and a local mount

use filestore_core::catalog::mounts;
use filestore_core::commands::RunCommandRequest;
use filestore_core::config::FilestoreConfig;
use filestore_core::domain::command::Command;
use filestore_core::domain::mount::{AccessMode, BackendKind, BackendMount, MountState};
use filestore_core::domain::node::NodeState;
use filestore_core::domain::reconciliation::{ReconciliationReason, ReconciliationRequest};
use filestore_core::executors::{ExecutorRegistry, LocalExecutor};
use filestore_core::infrastructure::events::{
    EventFilter, FilestoreEvent, SseDispatcher, SseFrame, SseSettings,
};
use filestore_core::FilestoreCore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct TestCore {
    core: FilestoreCore,
    mount: BackendMount,
    backend_root: std::path::PathBuf,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    staging: tempfile::TempDir,
}

async fn setup() -> TestCore {
    let data_dir = tempfile::tempdir().unwrap();
    let backend_dir = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();

    let mut config = FilestoreConfig::default();
    config.database.url = format!(
        "sqlite://{}?mode=rwc",
        data_dir.path().join("catalog.db").display()
    );

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(LocalExecutor::new()));
    let core = FilestoreCore::init_with_executors(config, registry)
        .await
        .unwrap();

    let mount = mounts::create_mount(
        core.db(),
        &BackendMount {
            id: Uuid::new_v4(),
            mount_key: "primary".to_string(),
            backend_kind: BackendKind::Local,
            access_mode: AccessMode::Rw,
            state: MountState::Active,
            root_path: Some(backend_dir.path().display().to_string()),
            bucket: None,
            prefix: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        },
    )
    .await
    .unwrap();

    TestCore {
        core,
        mount,
        backend_root: backend_dir.path().to_path_buf(),
        _dirs: (data_dir, backend_dir),
        staging,
    }
}

impl TestCore {
    async fn create_directory(&self, path: &str) {
        self.core
            .run_command(RunCommandRequest::new(Command::CreateDirectory {
                backend_mount_id: self.mount.id,
                path: path.to_string(),
                metadata: None,
            }))
            .await
            .unwrap();
    }

    async fn upload(&self, path: &str, contents: &[u8]) {
        let staged = self.staging.path().join(format!("s-{}", Uuid::new_v4()));
        tokio::fs::write(&staged, contents).await.unwrap();
        self.core
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
            .unwrap();
    }

    async fn node(&self, path: &str) -> filestore_core::domain::node::Node {
        filestore_core::catalog::nodes::get_node_by_path_any(self.core.db(), self.mount.id, path)
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn drift_detection_round_trip() {
    let test = setup().await;
    test.create_directory("d").await;
    test.upload("d/data.bin", b"drift-me").await;

    let mut events = test.core.events().subscribe();

    // Externally remove the file behind the catalog's back
    tokio::fs::remove_file(test.backend_root.join("d/data.bin"))
        .await
        .unwrap();

    let node = test.node("d/data.bin").await;
    test.core
        .enqueue_reconciliation(ReconciliationRequest {
            backend_mount_id: test.mount.id,
            path: "d/data.bin".to_string(),
            node_id: Some(node.id),
            reason: ReconciliationReason::Audit,
            detect_children: false,
            requested_hash: false,
        })
        .await
        .unwrap();
    let processed = test.core.reconciliation().drain_queue().await.unwrap();
    assert_eq!(processed, 1);

    let missing = test.node("d/data.bin").await;
    assert_eq!(missing.state, NodeState::Missing);
    assert!(missing.last_drift_detected_at.is_some());

    let mut saw_missing = false;
    let mut saw_drift = false;
    while let Ok(event) = events.try_recv() {
        match event.event_type() {
            "node.missing" => saw_missing = true,
            "drift.detected" => saw_drift = true,
            _ => {}
        }
    }
    assert!(saw_missing && saw_drift);

    // Restore the bytes; a manual job transitions the node back to active
    tokio::fs::write(test.backend_root.join("d/data.bin"), b"drift-me")
        .await
        .unwrap();
    test.core
        .enqueue_reconciliation(ReconciliationRequest {
            backend_mount_id: test.mount.id,
            path: "d/data.bin".to_string(),
            node_id: Some(node.id),
            reason: ReconciliationReason::Manual,
            detect_children: false,
            requested_hash: false,
        })
        .await
        .unwrap();
    test.core.reconciliation().drain_queue().await.unwrap();

    let reconciled = test.node("d/data.bin").await;
    assert_eq!(reconciled.state, NodeState::Active);
    assert!(reconciled.last_reconciled_at.is_some());

    let mut saw_reconciled = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type() == "node.reconciled" {
            saw_reconciled = true;
        }
    }
    assert!(saw_reconciled);

    test.core.shutdown().await;
}

#[tokio::test]
async fn child_divergence_enqueues_follow_ups() {
    let test = setup().await;
    test.create_directory("dir").await;

    // A stray file the catalog knows nothing about
    tokio::fs::write(test.backend_root.join("dir/stray.bin"), b"stray")
        .await
        .unwrap();

    let node = test.node("dir").await;
    test.core
        .enqueue_reconciliation(ReconciliationRequest {
            backend_mount_id: test.mount.id,
            path: "dir".to_string(),
            node_id: Some(node.id),
            reason: ReconciliationReason::Audit,
            detect_children: true,
            requested_hash: false,
        })
        .await
        .unwrap();

    // The sweep job plus the follow-up it spawned
    let processed = test.core.reconciliation().drain_queue().await.unwrap();
    assert_eq!(processed, 2);

    let follow_up = filestore_core::catalog::jobs::find_by_key(
        test.core.db(),
        &format!("{}:dir/stray.bin", test.mount.id),
    )
    .await
    .unwrap()
    .unwrap();
    // Untracked on the catalog side: observed, recorded, skipped
    assert_eq!(follow_up.result.unwrap()["outcome"], "untracked");

    test.core.shutdown().await;
}

#[tokio::test]
async fn checksum_drift_marks_inconsistent() {
    let test = setup().await;
    test.upload("hashcheck.bin", b"original").await;

    // Same length, different bytes: only the hash can tell
    tokio::fs::write(test.backend_root.join("hashcheck.bin"), b"ORIGINAL")
        .await
        .unwrap();

    let node = test.node("hashcheck.bin").await;
    test.core
        .enqueue_reconciliation(ReconciliationRequest {
            backend_mount_id: test.mount.id,
            path: "hashcheck.bin".to_string(),
            node_id: Some(node.id),
            reason: ReconciliationReason::Manual,
            detect_children: false,
            requested_hash: true,
        })
        .await
        .unwrap();
    test.core.reconciliation().drain_queue().await.unwrap();

    let flagged = test.node("hashcheck.bin").await;
    assert_eq!(flagged.state, NodeState::Inconsistent);
    assert!(flagged.last_drift_detected_at.is_some());

    test.core.shutdown().await;
}

#[tokio::test]
async fn streaming_subscription_filters_by_mount_and_prefix() {
    let test = setup().await;

    let filter = EventFilter {
        backend_mount_id: Some(test.mount.id),
        path_prefix: Some("datasets/".to_string()),
        event_types: vec!["node.created".to_string()],
    };
    let (mut frames, pump) = SseDispatcher::attach(
        test.core.events().subscribe(),
        filter,
        SseSettings::default(),
    );

    test.create_directory("other").await;
    test.create_directory("datasets/x").await;

    // Exactly one frame: the node.created for datasets/x. ("datasets" itself
    // does not match the trailing-slash prefix.)
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    match frame {
        SseFrame::Event { event, data } => {
            assert_eq!(event, "node.created");
            assert!(data.contains("datasets/x"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), frames.recv())
            .await
            .is_err()
    );

    pump.abort();
    test.core.shutdown().await;
}

#[tokio::test]
async fn read_file_streams_and_emits_downloaded() {
    let test = setup().await;
    test.upload("download/me.bin", b"streamed-bytes").await;

    let mut events = test.core.events().subscribe();
    let (node, stream) = test
        .core
        .read_file(test.mount.id, "download/me.bin", None, None)
        .await
        .unwrap();
    assert_eq!(node.size_bytes, 14);
    assert_eq!(stream.total_size, Some(14));

    use futures::TryStreamExt;
    let bytes = stream
        .stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap();
    assert_eq!(bytes, b"streamed-bytes");

    let mut saw_downloaded = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FilestoreEvent::NodeDownloaded(_)) {
            saw_downloaded = true;
        }
    }
    assert!(saw_downloaded);

    test.core.shutdown().await;
}

#[tokio::test]
async fn audit_sweep_covers_live_directories() {
    let test = setup().await;
    test.create_directory("a").await;
    test.create_directory("b/nested").await;

    let enqueued = test.core.reconciliation().audit_sweep().await.unwrap();
    assert_eq!(enqueued, 3); // a, b, b/nested

    let processed = test.core.reconciliation().drain_queue().await.unwrap();
    assert_eq!(processed, 3);

    // A clean sweep leaves every directory active
    for path in ["a", "b", "b/nested"] {
        assert_eq!(test.node(path).await.state, NodeState::Active);
    }

    test.core.shutdown().await;
}
