//! S3 executor
//!
//! Maps node paths onto `prefix/path` object keys. Directories are zero-byte
//! placeholder objects with a trailing `/`; recursive deletes batch up to the
//! backend limit of 1000 keys per request.

use super::{
    BackendChild, BackendListing, ByteRange, ExecutorContext, ExecutorOperation, HeadInfo,
    PresignedDownload, ReadStream, StorageExecutor,
};
use crate::domain::mount::BackendKind;
use crate::domain::node::NodeKind;
use crate::shared::error::{FilestoreError, FilestoreResult};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Hard cap on presigned URL lifetime
const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);
/// DeleteObjects accepts at most this many keys per call
const DELETE_BATCH_SIZE: usize = 1000;

/// Join the mount prefix with a node path into an object key.
fn object_key(prefix: Option<&str>, path: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{path}"),
        None => path.to_string(),
    }
}

/// Placeholder key marking a directory.
fn directory_key(prefix: Option<&str>, path: &str) -> String {
    format!("{}/", object_key(prefix, path))
}

fn smithy_datetime_to_chrono(value: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

fn clean_etag(etag: Option<String>) -> Option<String> {
    etag.map(|value| value.trim_matches('"').to_string())
}

fn range_header(range: ByteRange) -> String {
    match range {
        ByteRange::Bounded { start, end } => format!("bytes={start}-{end}"),
        ByteRange::From { start } => format!("bytes={start}-"),
        ByteRange::Suffix { length } => format!("bytes=-{length}"),
    }
}

/// Total size out of a `bytes a-b/total` content range
fn total_from_content_range(content_range: Option<&str>) -> Option<i64> {
    content_range?.rsplit('/').next()?.parse().ok()
}

/// Executor over an S3-compatible bucket
pub struct S3Executor {
    client: Client,
}

impl S3Executor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from ambient AWS configuration (env, profile, IMDS).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }

    fn bucket(ctx: &ExecutorContext) -> FilestoreResult<&str> {
        ctx.mount.bucket.as_deref().ok_or_else(|| {
            FilestoreError::invalid_request(format!(
                "s3 mount '{}' has no bucket configured",
                ctx.mount.mount_key
            ))
        })
    }

    async fn head_key(&self, bucket: &str, key: &str) -> FilestoreResult<Option<HeadInfo>> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(HeadInfo {
                size_bytes: output.content_length().unwrap_or(0),
                content_type: output.content_type().map(ToString::to_string),
                checksum: clean_etag(output.e_tag().map(ToString::to_string)),
                last_modified_at: output.last_modified().and_then(smithy_datetime_to_chrono),
            })),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()) == Some(true) => Ok(None),
            Err(err) => Err(FilestoreError::internal(format!("s3 head failed: {err}"))),
        }
    }

    /// Every key under a prefix (continuation-token pagination).
    async fn list_all_keys(&self, bucket: &str, prefix: &str) -> FilestoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|err| FilestoreError::internal(format!("s3 list failed: {err}")))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, bucket: &str, keys: Vec<String>) -> FilestoreResult<()> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let identifiers = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|err| FilestoreError::internal(format!("s3 delete batch: {err}")))
                })
                .collect::<FilestoreResult<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|err| FilestoreError::internal(format!("s3 delete batch: {err}")))?;
            self.client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| FilestoreError::internal(format!("s3 delete failed: {err}")))?;
        }
        Ok(())
    }

    async fn copy_key(&self, bucket: &str, from: &str, to: &str) -> FilestoreResult<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .copy_source(format!("{bucket}/{from}"))
            .key(to)
            .send()
            .await
            .map_err(|err| FilestoreError::internal(format!("s3 copy failed: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl StorageExecutor for S3Executor {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn execute(
        &self,
        operation: &ExecutorOperation,
        ctx: &ExecutorContext,
    ) -> FilestoreResult<()> {
        let bucket = Self::bucket(ctx)?;
        let prefix = ctx.mount.prefix.as_deref();
        match operation {
            ExecutorOperation::CreateDirectory { path } => {
                // Re-putting an existing placeholder is a harmless no-op
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(directory_key(prefix, path))
                    .body(ByteStream::from_static(b""))
                    .send()
                    .await
                    .map_err(|err| {
                        FilestoreError::internal(format!("s3 placeholder put failed: {err}"))
                    })?;
                Ok(())
            }
            ExecutorOperation::StoreFile { path, staging_path } => {
                let body = ByteStream::from_path(staging_path).await.map_err(|err| {
                    FilestoreError::internal(format!("staging read failed: {err}"))
                })?;
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(object_key(prefix, path))
                    .body(body)
                    .send()
                    .await
                    .map_err(|err| FilestoreError::internal(format!("s3 put failed: {err}")))?;
                let _ = tokio::fs::remove_file(staging_path).await;
                Ok(())
            }
            ExecutorOperation::CopyFile {
                source_path,
                target_path,
            } => {
                self.copy_key(
                    bucket,
                    &object_key(prefix, source_path),
                    &object_key(prefix, target_path),
                )
                .await
            }
            ExecutorOperation::Rename {
                from_path,
                to_path,
                kind,
            } => match kind {
                NodeKind::File => {
                    let from = object_key(prefix, from_path);
                    let to = object_key(prefix, to_path);
                    self.copy_key(bucket, &from, &to).await?;
                    self.delete_keys(bucket, vec![from]).await
                }
                NodeKind::Directory => {
                    // No server-side rename; re-place the placeholder, copy
                    // every other key, then delete the old ones
                    let old_prefix = directory_key(prefix, from_path);
                    let new_prefix = directory_key(prefix, to_path);
                    self.client
                        .put_object()
                        .bucket(bucket)
                        .key(&new_prefix)
                        .body(ByteStream::from_static(b""))
                        .send()
                        .await
                        .map_err(|err| {
                            FilestoreError::internal(format!("s3 placeholder put failed: {err}"))
                        })?;
                    let mut keys = self.list_all_keys(bucket, &old_prefix).await?;
                    for key in &keys {
                        if key == &old_prefix {
                            continue;
                        }
                        let suffix = &key[old_prefix.len()..];
                        self.copy_key(bucket, key, &format!("{new_prefix}{suffix}"))
                            .await?;
                    }
                    if !keys.contains(&old_prefix) {
                        keys.push(old_prefix);
                    }
                    self.delete_keys(bucket, keys).await
                }
            },
            ExecutorOperation::Delete {
                path,
                kind,
                recursive,
            } => match (kind, recursive) {
                (NodeKind::File, _) => {
                    self.delete_keys(bucket, vec![object_key(prefix, path)]).await
                }
                (NodeKind::Directory, false) => {
                    self.delete_keys(bucket, vec![directory_key(prefix, path)]).await
                }
                (NodeKind::Directory, true) => {
                    let dir_prefix = directory_key(prefix, path);
                    let mut keys = self.list_all_keys(bucket, &dir_prefix).await?;
                    if !keys.contains(&dir_prefix) {
                        keys.push(dir_prefix);
                    }
                    debug!("Recursive s3 delete of {} keys under '{path}'", keys.len());
                    self.delete_keys(bucket, keys).await
                }
            },
        }
    }

    async fn head(&self, path: &str, ctx: &ExecutorContext) -> FilestoreResult<Option<HeadInfo>> {
        let bucket = Self::bucket(ctx)?;
        let prefix = ctx.mount.prefix.as_deref();
        if let Some(info) = self.head_key(bucket, &object_key(prefix, path)).await? {
            return Ok(Some(info));
        }
        self.head_key(bucket, &directory_key(prefix, path)).await
    }

    async fn create_read_stream(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        range: Option<ByteRange>,
    ) -> FilestoreResult<ReadStream> {
        let bucket = Self::bucket(ctx)?;
        let key = object_key(ctx.mount.prefix.as_deref(), path);
        let mut request = self.client.get_object().bucket(bucket).key(&key);
        if let Some(range) = range {
            request = request.range(range_header(range));
        }
        let output = request.send().await.map_err(|err| {
            if err.as_service_error().map(|e| e.is_no_such_key()) == Some(true) {
                FilestoreError::node_not_found(format!("no backend content at '{path}'"))
            } else {
                FilestoreError::internal(format!("s3 get failed: {err}"))
            }
        })?;

        let content_length = output.content_length();
        let content_range = output.content_range().map(ToString::to_string);
        let total_size = total_from_content_range(content_range.as_deref()).or(content_length);
        let etag = clean_etag(output.e_tag().map(ToString::to_string));
        let last_modified_at = output.last_modified().and_then(smithy_datetime_to_chrono);
        let stream = ReaderStream::new(output.body.into_async_read()).boxed();

        Ok(ReadStream {
            stream,
            content_length,
            content_range,
            total_size,
            etag,
            last_modified_at,
        })
    }

    async fn create_presigned_download(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        expires_in: Duration,
    ) -> FilestoreResult<PresignedDownload> {
        let bucket = Self::bucket(ctx)?;
        let key = object_key(ctx.mount.prefix.as_deref(), path);
        let expires_in = expires_in.min(MAX_PRESIGN_EXPIRY);
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|err| FilestoreError::invalid_request(format!("bad expiry: {err}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(&key)
            .presigned(config)
            .await
            .map_err(|err| FilestoreError::internal(format!("s3 presign failed: {err}")))?;

        Ok(PresignedDownload {
            url: presigned.uri().to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::zero()),
            method: presigned.method().to_string(),
            headers: presigned
                .headers()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        })
    }

    async fn list_for_reconciliation(
        &self,
        path: &str,
        ctx: &ExecutorContext,
        detect_children: bool,
    ) -> FilestoreResult<BackendListing> {
        let bucket = Self::bucket(ctx)?;
        let prefix = ctx.mount.prefix.as_deref();

        if let Some(info) = self.head_key(bucket, &object_key(prefix, path)).await? {
            return Ok(BackendListing {
                exists: true,
                info: Some(info),
                children: Vec::new(),
            });
        }

        let dir_prefix = directory_key(prefix, path);
        let placeholder = self.head_key(bucket, &dir_prefix).await?;

        let mut children = Vec::new();
        if detect_children {
            let mut continuation: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(&dir_prefix)
                    .delimiter("/");
                if let Some(token) = continuation.take() {
                    request = request.continuation_token(token);
                }
                let output = request
                    .send()
                    .await
                    .map_err(|err| FilestoreError::internal(format!("s3 list failed: {err}")))?;
                for object in output.contents() {
                    let Some(key) = object.key() else { continue };
                    let name = &key[dir_prefix.len()..];
                    if name.is_empty() {
                        continue; // The placeholder itself
                    }
                    children.push(BackendChild {
                        name: name.to_string(),
                        kind: NodeKind::File,
                        size_bytes: object.size().unwrap_or(0),
                    });
                }
                for common_prefix in output.common_prefixes() {
                    let Some(key) = common_prefix.prefix() else { continue };
                    let name = key[dir_prefix.len()..].trim_end_matches('/');
                    if name.is_empty() {
                        continue;
                    }
                    children.push(BackendChild {
                        name: name.to_string(),
                        kind: NodeKind::Directory,
                        size_bytes: 0,
                    });
                }
                match output.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            }
            children.sort_by(|a, b| a.name.cmp(&b.name));
        }

        // Implicit directories (children without a placeholder) still exist
        let exists = placeholder.is_some() || !children.is_empty();
        Ok(BackendListing {
            exists,
            info: placeholder,
            children,
        })
    }
}
