//! Local POSIX executor

use super::{
    BackendChild, BackendListing, ByteRange, ExecutorContext, ExecutorOperation, HeadInfo,
    PresignedDownload, ReadStream, StorageExecutor,
};
use crate::domain::mount::BackendKind;
use crate::domain::node::NodeKind;
use crate::shared::error::{FilestoreError, FilestoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Executor over a local filesystem root
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    fn root(ctx: &ExecutorContext) -> FilestoreResult<PathBuf> {
        ctx.mount
            .root_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| {
                FilestoreError::invalid_request(format!(
                    "local mount '{}' has no rootPath configured",
                    ctx.mount.mount_key
                ))
            })
    }

    fn absolute(ctx: &ExecutorContext, path: &str) -> FilestoreResult<PathBuf> {
        Ok(Self::root(ctx)?.join(path))
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn move_into_place(staging: &Path, target: &Path) -> FilestoreResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(staging, target).await {
        Ok(()) => Ok(()),
        // Staging may live on another filesystem
        Err(_) => {
            tokio::fs::copy(staging, target).await?;
            tokio::fs::remove_file(staging).await?;
            Ok(())
        }
    }
}

fn modified_at(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(Into::into)
}

#[async_trait]
impl StorageExecutor for LocalExecutor {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn execute(
        &self,
        operation: &ExecutorOperation,
        ctx: &ExecutorContext,
    ) -> FilestoreResult<()> {
        match operation {
            ExecutorOperation::CreateDirectory { path } => {
                let target = Self::absolute(ctx, path)?;
                tokio::fs::create_dir_all(&target).await?;
                Ok(())
            }
            ExecutorOperation::StoreFile { path, staging_path } => {
                let target = Self::absolute(ctx, path)?;
                move_into_place(staging_path, &target).await
            }
            ExecutorOperation::CopyFile {
                source_path,
                target_path,
            } => {
                let source = Self::absolute(ctx, source_path)?;
                let target = Self::absolute(ctx, target_path)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&source, &target).await?;
                Ok(())
            }
            ExecutorOperation::Rename {
                from_path, to_path, ..
            } => {
                let from = Self::absolute(ctx, from_path)?;
                let to = Self::absolute(ctx, to_path)?;
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&from, &to).await?;
                Ok(())
            }
            ExecutorOperation::Delete {
                path,
                kind,
                recursive,
            } => {
                let target = Self::absolute(ctx, path)?;
                let result = match (kind, recursive) {
                    (NodeKind::File, _) => tokio::fs::remove_file(&target).await,
                    (NodeKind::Directory, true) => tokio::fs::remove_dir_all(&target).await,
                    (NodeKind::Directory, false) => tokio::fs::remove_dir(&target).await,
                };
                ignore_not_found(result)?;
                Ok(())
            }
        }
    }

    async fn head(&self, path: &str, ctx: &ExecutorContext) -> FilestoreResult<Option<HeadInfo>> {
        let target = Self::absolute(ctx, path)?;
        match tokio::fs::metadata(&target).await {
            Ok(metadata) => Ok(Some(HeadInfo {
                size_bytes: if metadata.is_file() {
                    metadata.len() as i64
                } else {
                    0
                },
                content_type: None,
                checksum: None,
                last_modified_at: modified_at(&metadata),
            })),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_read_stream(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        range: Option<ByteRange>,
    ) -> FilestoreResult<ReadStream> {
        let target = Self::absolute(ctx, path)?;
        let mut file = match tokio::fs::File::open(&target).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(FilestoreError::node_not_found(format!(
                    "no backend content at '{path}'"
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let metadata = file.metadata().await?;
        let total_size = metadata.len();

        let (stream, content_length, content_range) = match range {
            Some(range) => {
                let (start, end) = range.resolve(total_size)?;
                let length = end - start + 1;
                file.seek(std::io::SeekFrom::Start(start)).await?;
                let limited = file.take(length);
                (
                    ReaderStream::new(limited).boxed(),
                    length as i64,
                    Some(format!("bytes {start}-{end}/{total_size}")),
                )
            }
            None => (ReaderStream::new(file).boxed(), total_size as i64, None),
        };

        debug!("Streaming {} bytes from {}", content_length, target.display());
        Ok(ReadStream {
            stream,
            content_length: Some(content_length),
            content_range,
            total_size: Some(total_size as i64),
            etag: None,
            last_modified_at: modified_at(&metadata),
        })
    }

    async fn create_presigned_download(
        &self,
        _path: &str,
        ctx: &ExecutorContext,
        _expires_in: Duration,
    ) -> FilestoreResult<PresignedDownload> {
        Err(FilestoreError::not_supported(format!(
            "local mount '{}' cannot presign downloads",
            ctx.mount.mount_key
        )))
    }

    async fn list_for_reconciliation(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        detect_children: bool,
    ) -> FilestoreResult<BackendListing> {
        let target = Self::absolute(ctx, path)?;
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Ok(BackendListing {
                    exists: false,
                    info: None,
                    children: Vec::new(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let info = HeadInfo {
            size_bytes: if metadata.is_file() {
                metadata.len() as i64
            } else {
                0
            },
            content_type: None,
            checksum: None,
            last_modified_at: modified_at(&metadata),
        };

        let mut children = Vec::new();
        if detect_children && metadata.is_dir() {
            let mut entries = tokio::fs::read_dir(&target).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let entry_metadata = entry.metadata().await?;
                children.push(BackendChild {
                    name,
                    kind: if entry_metadata.is_dir() {
                        NodeKind::Directory
                    } else {
                        NodeKind::File
                    },
                    size_bytes: if entry_metadata.is_file() {
                        entry_metadata.len() as i64
                    } else {
                        0
                    },
                });
            }
            children.sort_by(|a, b| a.name.cmp(&b.name));
        }

        Ok(BackendListing {
            exists: true,
            info: Some(info),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mount::{AccessMode, BackendMount, MountState};
    use futures::TryStreamExt;
    use uuid::Uuid;

    fn context(root: &Path) -> ExecutorContext {
        ExecutorContext {
            mount: BackendMount {
                id: Uuid::new_v4(),
                mount_key: "local-test".into(),
                backend_kind: BackendKind::Local,
                access_mode: AccessMode::Rw,
                state: MountState::Active,
                root_path: Some(root.display().to_string()),
                bucket: None,
                prefix: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        }
    }

    async fn collect(stream: ReadStream) -> Vec<u8> {
        stream
            .stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn store_head_and_delete_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ctx = context(root.path());

        let staged = staging.path().join("upload.tmp");
        tokio::fs::write(&staged, b"hello filestore").await.unwrap();
        executor
            .execute(
                &ExecutorOperation::StoreFile {
                    path: "datasets/report.bin".into(),
                    staging_path: staged.clone(),
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(!staged.exists());

        let head = executor
            .head("datasets/report.bin", &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.size_bytes, 15);

        executor
            .execute(
                &ExecutorOperation::Delete {
                    path: "datasets/report.bin".into(),
                    kind: NodeKind::File,
                    recursive: false,
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(executor.head("datasets/report.bin", &ctx).await.unwrap().is_none());

        // Delete-of-deleted is idempotent
        executor
            .execute(
                &ExecutorOperation::Delete {
                    path: "datasets/report.bin".into(),
                    kind: NodeKind::File,
                    recursive: false,
                },
                &ctx,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_stream_honors_ranges() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ctx = context(root.path());
        tokio::fs::write(root.path().join("f.bin"), b"0123456789")
            .await
            .unwrap();

        let full = executor.create_read_stream("f.bin", &ctx, None).await.unwrap();
        assert_eq!(full.total_size, Some(10));
        assert_eq!(collect(full).await, b"0123456789");

        let bounded = executor
            .create_read_stream("f.bin", &ctx, Some(ByteRange::Bounded { start: 2, end: 5 }))
            .await
            .unwrap();
        assert_eq!(bounded.content_range.as_deref(), Some("bytes 2-5/10"));
        assert_eq!(collect(bounded).await, b"2345");

        let suffix = executor
            .create_read_stream("f.bin", &ctx, Some(ByteRange::Suffix { length: 3 }))
            .await
            .unwrap();
        assert_eq!(collect(suffix).await, b"789");

        let beyond = executor
            .create_read_stream("f.bin", &ctx, Some(ByteRange::From { start: 100 }))
            .await;
        assert!(beyond.is_err());
    }

    #[tokio::test]
    async fn presign_is_not_supported() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let err = executor
            .create_presigned_download("x", &context(root.path()), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::shared::error::ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn reconciliation_listing_reports_children() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ctx = context(root.path());
        executor
            .execute(
                &ExecutorOperation::CreateDirectory { path: "d".into() },
                &ctx,
            )
            .await
            .unwrap();
        tokio::fs::write(root.path().join("d/a.txt"), b"a").await.unwrap();
        tokio::fs::create_dir(root.path().join("d/sub")).await.unwrap();

        let listing = executor.list_for_reconciliation("d", &ctx, true).await.unwrap();
        assert!(listing.exists);
        assert_eq!(listing.children.len(), 2);
        assert_eq!(listing.children[0].name, "a.txt");
        assert_eq!(listing.children[0].kind, NodeKind::File);
        assert_eq!(listing.children[1].kind, NodeKind::Directory);

        let absent = executor
            .list_for_reconciliation("missing", &ctx, false)
            .await
            .unwrap();
        assert!(!absent.exists);
    }
}
