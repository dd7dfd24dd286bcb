//! Commit log segment backup and restore.
//!
//! The node archives finished segments into its archive directory; backup
//! uploads whatever the remote index does not already hold, and restore
//! places segments back into the live commit log directory so the node
//! replays them on its next start.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Context;
use async_trait::async_trait;
use nodekeeper_core::{FailureKind, OperationRequest, Progress, RemoteLocation};
use serde_json::{json, Value};

use super::manifest::{
    configured_dir, is_segment_name, resolve_location, sha256_file, CommitlogIndex,
    CommitlogSegment, COMMITLOG_INDEX_KEY,
};
use super::restore::rollback;
use super::ExecutorDeps;
use crate::service::executor::{
    typed_request, ExecutionContext, ExecutionError, Executor, FailureExt,
};
use crate::traits::StorageTransfer;

/// Uploads archived segments not yet in the remote index, then rewrites the
/// index. Segments whose digest matches the indexed one are skipped.
pub struct CommitlogBackupExecutor {
    deps: ExecutorDeps,
}

impl CommitlogBackupExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self { deps: deps.clone() }
    }
}

#[async_trait]
impl Executor for CommitlogBackupExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, CommitlogBackup);
        let (location, storage) = resolve_location(&self.deps, &request.storage_location)?;
        let archive = configured_dir(
            request.commitlog_archive_dir.as_deref(),
            self.deps.paths.commitlog_archive_dir.as_ref(),
            "commit log archive directory",
        )?;

        ctx.check_cancelled()?;
        let has_index = storage
            .exists(&location, COMMITLOG_INDEX_KEY)
            .await
            .context("checking commit log index")
            .or_fail(FailureKind::StorageTransfer)?;
        let mut index = if has_index {
            let raw = storage
                .get_bytes(&location, COMMITLOG_INDEX_KEY)
                .await
                .context("downloading commit log index")
                .or_fail(FailureKind::StorageTransfer)?;
            CommitlogIndex::parse(&raw)?
        } else {
            CommitlogIndex::default()
        };

        let segments = archived_segments(&archive).await.or_fail(FailureKind::Io)?;
        let total = segments.len() as u64;
        ctx.report(Progress::new(0, total).with_message("uploading commit log segments"));

        let (mut uploaded, mut skipped, mut bytes) = (0u64, 0u64, 0u64);
        for (done, (name, path)) in (1u64..).zip(segments) {
            ctx.check_cancelled()?;
            let (size, sha256) = sha256_file(&path).await.or_fail(FailureKind::Io)?;
            if index.get(&name).is_some_and(|s| s.sha256 == sha256) {
                skipped += 1;
                continue;
            }
            let segment = CommitlogSegment {
                name,
                size,
                sha256,
                archived_at: modified_millis(&path).await.or_fail(FailureKind::Io)?,
            };
            let key = segment.key();
            bytes += storage
                .upload(&location, &key, &path)
                .await
                .with_context(|| format!("uploading {key}"))
                .or_fail(FailureKind::StorageTransfer)?;
            index.upsert(segment);
            uploaded += 1;
            ctx.report(Progress::new(done, total).with_message(format!("uploaded {key}")));
        }

        if uploaded > 0 {
            ctx.check_cancelled()?;
            let encoded = index.to_json().or_fail(FailureKind::Internal)?;
            storage
                .put_bytes(&location, COMMITLOG_INDEX_KEY, encoded)
                .await
                .context("uploading commit log index")
                .or_fail(FailureKind::StorageTransfer)?;
        }

        tracing::info!(op_id = %ctx.id(), uploaded, skipped, bytes, %location, "commit logs uploaded");
        Ok(json!({
            "filesProcessed": uploaded,
            "filesSkipped": skipped,
            "bytesTransferred": bytes,
        }))
    }
}

/// Downloads indexed segments into the commit log directory. Nothing is
/// overwritten; a failure or cancellation removes every segment written.
pub struct CommitlogRestoreExecutor {
    deps: ExecutorDeps,
}

impl CommitlogRestoreExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self { deps: deps.clone() }
    }
}

#[async_trait]
impl Executor for CommitlogRestoreExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, CommitlogRestore);
        let (location, storage) = resolve_location(&self.deps, &request.storage_location)?;
        let target_dir = configured_dir(
            request.commitlog_dir.as_deref(),
            self.deps.paths.commitlog_dir.as_ref(),
            "commit log directory",
        )?;
        if !tokio::fs::try_exists(&target_dir).await.unwrap_or(false) {
            return Err(ExecutionError::failed(
                FailureKind::InvalidRequest,
                format!("commit log directory {} does not exist", target_dir.display()),
            ));
        }

        ctx.check_cancelled()?;
        let raw = storage
            .get_bytes(&location, COMMITLOG_INDEX_KEY)
            .await
            .context("downloading commit log index")
            .or_fail(FailureKind::StorageTransfer)?;
        let index = CommitlogIndex::parse(&raw)?;

        let mut plan = Vec::new();
        for segment in index
            .segments
            .iter()
            .filter(|s| match request.timestamp_end {
                Some(end) => s.archived_at <= end,
                None => true,
            })
        {
            let target = target_dir.join(&segment.name);
            if tokio::fs::try_exists(&target).await.unwrap_or(true) {
                return Err(ExecutionError::failed(
                    FailureKind::InvalidRequest,
                    format!("refusing to overwrite existing segment {}", target.display()),
                ));
            }
            plan.push((segment, target));
        }

        let mut written = Vec::new();
        let bytes = match download_segments(&plan, &location, storage.as_ref(), ctx, &mut written).await {
            Ok(bytes) => bytes,
            Err(e) => {
                rollback(&written, ctx).await;
                return Err(e);
            }
        };

        tracing::info!(
            op_id = %ctx.id(),
            segments = plan.len(),
            bytes,
            dir = %target_dir.display(),
            "commit logs restored, replayed on next node start"
        );
        Ok(json!({
            "filesProcessed": plan.len(),
            "bytesTransferred": bytes,
        }))
    }
}

async fn download_segments(
    plan: &[(&CommitlogSegment, PathBuf)],
    location: &RemoteLocation,
    storage: &dyn StorageTransfer,
    ctx: &ExecutionContext,
    written: &mut Vec<PathBuf>,
) -> Result<u64, ExecutionError> {
    let total = plan.len() as u64;
    let mut bytes = 0u64;
    for (done, (segment, target)) in (1u64..).zip(plan) {
        ctx.check_cancelled()?;
        let key = segment.key();
        written.push(target.clone());
        storage
            .download(location, &key, target)
            .await
            .with_context(|| format!("downloading {key}"))
            .or_fail(FailureKind::StorageTransfer)?;
        let (size, sha256) = sha256_file(target).await.or_fail(FailureKind::Io)?;
        if size != segment.size || sha256 != segment.sha256 {
            return Err(ExecutionError::failed(
                FailureKind::Integrity,
                format!("checksum mismatch for {key}"),
            ));
        }
        bytes += size;
        ctx.report(Progress::new(done, total).with_message(format!("restored {key}")));
    }
    Ok(bytes)
}

/// Segment files in `dir`, sorted by name.
async fn archived_segments(dir: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_segment_name(&name) && entry.file_type().await?.is_file() {
            found.push((name, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

async fn modified_millis(path: &Path) -> anyhow::Result<u64> {
    let modified = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .modified()
        .with_context(|| format!("reading mtime of {}", path.display()))?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
}
