//! Storage executors
//!
//! The only components that touch backend bytes. Each backend kind supplies
//! one implementation of [`StorageExecutor`]; the registry resolves the
//! implementation for a mount.

use crate::domain::mount::{BackendKind, BackendMount};
use crate::domain::node::NodeKind;
use crate::shared::error::{FilestoreError, FilestoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod local;
pub mod s3;

pub use local::LocalExecutor;
pub use s3::S3Executor;

/// Context handed to every executor call
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub mount: BackendMount,
}

/// Backend-side effect of one command step.
///
/// Cross-mount byte movement is orchestrated above this layer: the
/// orchestrator streams from the source executor into a staging file and
/// hands the target executor a `StoreFile`.
#[derive(Debug, Clone)]
pub enum ExecutorOperation {
    CreateDirectory {
        path: String,
    },
    /// Move staged bytes into their final location (upload and overwrite)
    StoreFile {
        path: String,
        staging_path: PathBuf,
    },
    /// Same-mount single-file copy
    CopyFile {
        source_path: String,
        target_path: String,
    },
    /// Same-mount rename of a file or a whole directory subtree
    Rename {
        from_path: String,
        to_path: String,
        kind: NodeKind,
    },
    Delete {
        path: String,
        kind: NodeKind,
        recursive: bool,
    },
}

/// What a backend reports about one object
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub checksum: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Lazy byte sequence plus response metadata
pub struct ReadStream {
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    pub content_length: Option<i64>,
    pub content_range: Option<String>,
    pub total_size: Option<i64>,
    pub etag: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Time-bounded signed URL for direct backend reads
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedDownload {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub method: String,
    pub headers: HashMap<String, String>,
}

/// One child observed on the backend
#[derive(Debug, Clone)]
pub struct BackendChild {
    pub name: String,
    pub kind: NodeKind,
    pub size_bytes: i64,
}

/// Backend observation for reconciliation
#[derive(Debug, Clone)]
pub struct BackendListing {
    pub exists: bool,
    pub info: Option<HeadInfo>,
    pub children: Vec<BackendChild>,
}

/// Requested byte range on a file read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Bounded { start: u64, end: u64 },
    From { start: u64 },
    /// `bytes=-N`: the trailing N bytes, clamped to the file size
    Suffix { length: u64 },
}

impl ByteRange {
    /// Parse an HTTP `bytes=` range specifier (single range only).
    pub fn parse(header: &str) -> FilestoreResult<Self> {
        let raw = header
            .strip_prefix("bytes=")
            .ok_or_else(|| FilestoreError::invalid_request(format!("unsupported range '{header}'")))?;
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| FilestoreError::invalid_request(format!("malformed range '{header}'")))?;
        let parse = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| FilestoreError::invalid_request(format!("malformed range '{header}'")))
        };
        match (start.is_empty(), end.is_empty()) {
            (true, false) => Ok(Self::Suffix { length: parse(end)? }),
            (false, true) => Ok(Self::From { start: parse(start)? }),
            (false, false) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(FilestoreError::invalid_request(format!(
                        "range end before start in '{header}'"
                    )));
                }
                Ok(Self::Bounded { start, end })
            }
            (true, true) => Err(FilestoreError::invalid_request(format!(
                "malformed range '{header}'"
            ))),
        }
    }

    /// Resolve against a total size to an inclusive `(start, end)` pair.
    ///
    /// A start at or beyond EOF carries 416 semantics; suffix ranges clamp.
    pub fn resolve(&self, total_size: u64) -> FilestoreResult<(u64, u64)> {
        let last = total_size.saturating_sub(1);
        match *self {
            Self::Bounded { start, end } => {
                if start >= total_size {
                    return Err(range_not_satisfiable(total_size));
                }
                Ok((start, end.min(last)))
            }
            Self::From { start } => {
                if start >= total_size {
                    return Err(range_not_satisfiable(total_size));
                }
                Ok((start, last))
            }
            Self::Suffix { length } => {
                if length == 0 || total_size == 0 {
                    return Err(range_not_satisfiable(total_size));
                }
                Ok((total_size.saturating_sub(length), last))
            }
        }
    }
}

fn range_not_satisfiable(total_size: u64) -> FilestoreError {
    FilestoreError::invalid_request("requested range not satisfiable")
        .with_details(serde_json::json!({ "totalSize": total_size, "status": 416 }))
}

/// Capability set a backend implementation must satisfy.
///
/// Implementations must be idempotent for create-directory and for
/// delete-of-deleted, and must clean up their own partial state on failures.
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    async fn execute(
        &self,
        operation: &ExecutorOperation,
        ctx: &ExecutorContext,
    ) -> FilestoreResult<()>;

    /// `None` when the backend holds nothing at the path
    async fn head(&self, path: &str, ctx: &ExecutorContext) -> FilestoreResult<Option<HeadInfo>>;

    async fn create_read_stream(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        range: Option<ByteRange>,
    ) -> FilestoreResult<ReadStream>;

    async fn create_presigned_download(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        expires_in: Duration,
    ) -> FilestoreResult<PresignedDownload>;

    async fn list_for_reconciliation(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        detect_children: bool,
    ) -> FilestoreResult<BackendListing>;
}

impl std::fmt::Debug for dyn StorageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn StorageExecutor")
            .field("backend_kind", &self.backend_kind())
            .finish()
    }
}

/// Resolves a backend kind to its executor
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<BackendKind, Arc<dyn StorageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn StorageExecutor>) {
        self.executors.insert(executor.backend_kind(), executor);
    }

    pub fn resolve(&self, kind: BackendKind) -> FilestoreResult<Arc<dyn StorageExecutor>> {
        self.executors.get(&kind).cloned().ok_or_else(|| {
            FilestoreError::executor_not_found(format!("no executor registered for '{kind}'"))
        })
    }

    pub fn for_mount(&self, mount: &BackendMount) -> FilestoreResult<Arc<dyn StorageExecutor>> {
        self.resolve(mount.backend_kind)
    }
}
