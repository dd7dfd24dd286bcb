//! Snapshot-and-upload backup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use nodekeeper_core::requests::BackupRequest;
use nodekeeper_core::{FailureKind, OperationRequest, Progress, RemoteLocation};
use serde_json::{json, Value};

use super::manifest::{
    data_dirs, manifest_key, resolve_location, sha256_file, table_name, BackupManifest,
    ManifestEntry,
};
use super::ExecutorDeps;
use crate::service::executor::{
    typed_request, ExecutionContext, ExecutionError, Executor, FailureExt,
};
use crate::traits::{NodeManagement, StorageTransfer};

/// A file of the local snapshot, located under
/// `<data dir>/<keyspace>/<table>-<id>/snapshots/<tag>/`.
#[derive(Debug)]
struct SnapshotFile {
    keyspace: String,
    table: String,
    name: String,
    path: PathBuf,
}

/// Snapshots the node, uploads the snapshot files and a manifest, then
/// clears the snapshot whether or not the upload succeeded.
pub struct BackupExecutor {
    deps: ExecutorDeps,
}

impl BackupExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self { deps: deps.clone() }
    }

    async fn upload_snapshot(
        &self,
        request: &BackupRequest,
        tag: &str,
        location: &RemoteLocation,
        storage: &dyn StorageTransfer,
        ctx: &ExecutionContext,
    ) -> Result<(u64, u64), ExecutionError> {
        let dirs = data_dirs(&request.data_dirs, &self.deps);
        let files = collect_snapshot_files(&dirs, tag, &request.entities)
            .await
            .or_fail(FailureKind::Io)?;
        let total = files.len() as u64;
        ctx.report(Progress::new(0, total).with_message("uploading snapshot files"));

        let mut entries = Vec::with_capacity(files.len());
        let mut bytes = 0u64;
        for (done, file) in (1u64..).zip(files) {
            ctx.check_cancelled()?;
            let (size, sha256) = sha256_file(&file.path).await.or_fail(FailureKind::Io)?;
            let entry = ManifestEntry {
                keyspace: file.keyspace,
                table: file.table,
                name: file.name,
                size,
                sha256,
            };
            let key = entry.key();
            bytes += storage
                .upload(location, &key, &file.path)
                .await
                .with_context(|| format!("uploading {key}"))
                .or_fail(FailureKind::StorageTransfer)?;
            entries.push(entry);
            ctx.report(Progress::new(done, total).with_message(format!("uploaded {key}")));
        }

        ctx.check_cancelled()?;
        let manifest = BackupManifest {
            snapshot_tag: tag.to_string(),
            created_at: now_millis(),
            files: entries,
        };
        let encoded = manifest.to_json().or_fail(FailureKind::Internal)?;
        storage
            .put_bytes(location, &manifest_key(tag), encoded)
            .await
            .context("uploading manifest")
            .or_fail(FailureKind::StorageTransfer)?;
        Ok((total, bytes))
    }
}

#[async_trait]
impl Executor for BackupExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Backup);
        let (location, storage) = resolve_location(&self.deps, &request.storage_location)?;
        let tag = request
            .snapshot_tag
            .clone()
            .unwrap_or_else(|| format!("backup-{}", ctx.id()));

        let management = Arc::clone(&self.deps.management);
        ctx.call_node("take snapshot", management.take_snapshot(&tag, &request.entities))
            .await?;

        let outcome = self
            .upload_snapshot(request, &tag, &location, storage.as_ref(), ctx)
            .await;

        // Cleared even after cancellation, so not routed through call_node.
        if let Err(e) = management.clear_snapshot(&tag).await {
            tracing::warn!(op_id = %ctx.id(), snapshot = %tag, error = %e, "failed to clear snapshot");
        }

        let (files, bytes) = outcome?;
        tracing::info!(op_id = %ctx.id(), snapshot = %tag, files, bytes, %location, "backup uploaded");
        Ok(json!({
            "filesProcessed": files,
            "bytesTransferred": bytes,
            "snapshotTag": tag,
        }))
    }
}

fn now_millis() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
}

async fn subdirs(dir: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            found.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

async fn collect_snapshot_files(
    dirs: &[PathBuf],
    tag: &str,
    keyspaces: &[String],
) -> anyhow::Result<Vec<SnapshotFile>> {
    let mut files = Vec::new();
    for dir in dirs {
        for (keyspace, keyspace_dir) in subdirs(dir).await? {
            if !keyspaces.is_empty() && !keyspaces.contains(&keyspace) {
                continue;
            }
            for (table_dir_name, table_dir) in subdirs(&keyspace_dir).await? {
                let snapshot = table_dir.join("snapshots").join(tag);
                if !tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(&snapshot)
                    .await
                    .with_context(|| format!("listing {}", snapshot.display()))?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort();
                files.extend(names.into_iter().map(|name| SnapshotFile {
                    keyspace: keyspace.clone(),
                    table: table_name(&table_dir_name).to_string(),
                    path: snapshot.join(&name),
                    name,
                }));
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, deps};
    use super::*;
    use crate::management::fake::RecordingManagement;

    const TABLE_ID: &str = "0123456789abcdef0123456789abcdef";

    fn snapshot_path(data: &Path, keyspace: &str, table: &str, tag: &str, name: &str) -> PathBuf {
        data.join(keyspace)
            .join(format!("{table}-{TABLE_ID}"))
            .join("snapshots")
            .join(tag)
            .join(name)
    }

    fn request(location: String, tag: Option<&str>, entities: &[&str]) -> OperationRequest {
        BackupRequest {
            storage_location: location,
            snapshot_tag: tag.map(str::to_string),
            entities: entities.iter().map(ToString::to_string).collect(),
            data_dirs: vec![],
        }
        .into()
    }

    fn location(root: &Path) -> String {
        format!("file://{}/c1/dc1/n1", root.display())
    }

    #[tokio::test]
    async fn uploads_files_and_manifest_then_clears_snapshot() {
        let data = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let file = snapshot_path(data.path(), "ks1", "t1", "snap1", "nb-1-big-Data.db");
        let management = Arc::new(RecordingManagement::new().with_snapshot_file(file.clone(), b"abc"));
        let (ctx, _token) = context();

        let result = BackupExecutor::new(&deps(&management, vec![data.path().to_path_buf()]))
            .execute(&request(location(remote.path()), Some("snap1"), &[]), &ctx)
            .await
            .unwrap();

        assert_eq!(result["filesProcessed"], 1);
        assert_eq!(result["bytesTransferred"], 3);
        assert_eq!(result["snapshotTag"], "snap1");

        let node = remote.path().join("c1/dc1/n1");
        assert_eq!(
            std::fs::read(node.join("data/ks1/t1/nb-1-big-Data.db")).unwrap(),
            b"abc"
        );
        let manifest =
            BackupManifest::parse(&std::fs::read(node.join("manifests/snap1.json")).unwrap(), "snap1")
                .unwrap();
        assert_eq!(manifest.files[0].size, 3);
        assert_eq!(manifest.files[0].table, "t1");

        let calls = management.calls();
        assert!(calls[0].starts_with("take_snapshot snap1"));
        assert_eq!(calls.last().unwrap(), "clear_snapshot snap1");
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn tag_defaults_to_operation_id() {
        let remote = tempfile::tempdir().unwrap();
        let management = Arc::new(RecordingManagement::new());
        let (ctx, _token) = context();
        let result = BackupExecutor::new(&deps(&management, vec![]))
            .execute(&request(location(remote.path()), None, &[]), &ctx)
            .await
            .unwrap();
        assert_eq!(result["snapshotTag"], format!("backup-{}", ctx.id()));
        assert_eq!(result["filesProcessed"], 0);
    }

    #[tokio::test]
    async fn entities_limit_uploaded_keyspaces() {
        let data = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let management = Arc::new(
            RecordingManagement::new()
                .with_snapshot_file(snapshot_path(data.path(), "ks1", "t1", "s", "a.db"), b"1")
                .with_snapshot_file(snapshot_path(data.path(), "ks2", "t2", "s", "b.db"), b"2"),
        );
        let (ctx, _token) = context();
        let result = BackupExecutor::new(&deps(&management, vec![data.path().to_path_buf()]))
            .execute(&request(location(remote.path()), Some("s"), &["ks2"]), &ctx)
            .await
            .unwrap();

        assert_eq!(result["filesProcessed"], 1);
        let node = remote.path().join("c1/dc1/n1");
        assert!(node.join("data/ks2/t2/b.db").exists());
        assert!(!node.join("data/ks1").exists());
    }

    #[tokio::test]
    async fn upload_failure_still_clears_snapshot() {
        let data = tempfile::tempdir().unwrap();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let management = Arc::new(
            RecordingManagement::new()
                .with_snapshot_file(snapshot_path(data.path(), "ks1", "t1", "s", "a.db"), b"1"),
        );
        let (ctx, _token) = context();
        // The bucket is a regular file, so no object can be created under it.
        let err = BackupExecutor::new(&deps(&management, vec![data.path().to_path_buf()]))
            .execute(&request(location(blocker.path()), Some("s"), &[]), &ctx)
            .await
            .unwrap_err();

        let ExecutionError::Failed(cause) = err else {
            panic!("expected failure");
        };
        assert_eq!(cause.kind, FailureKind::StorageTransfer);
        assert_eq!(management.calls().last().unwrap(), "clear_snapshot s");
    }

    #[tokio::test]
    async fn cancellation_after_snapshot_still_clears_it() {
        let data = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let (ctx, token) = context();
        let management = Arc::new(
            RecordingManagement::new()
                .with_snapshot_file(snapshot_path(data.path(), "ks1", "t1", "s", "a.db"), b"1")
                .cancel_on("take_snapshot", token),
        );
        let err = BackupExecutor::new(&deps(&management, vec![data.path().to_path_buf()]))
            .execute(&request(location(remote.path()), Some("s"), &[]), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(management.calls().last().unwrap(), "clear_snapshot s");
        assert!(!remote.path().join("c1/dc1/n1/manifests/s.json").exists());
    }

    #[tokio::test]
    async fn unknown_protocol_fails_before_snapshot() {
        let management = Arc::new(RecordingManagement::new());
        let (ctx, _token) = context();
        let err = BackupExecutor::new(&deps(&management, vec![]))
            .execute(&request("s3://bucket/c1/dc1/n1".into(), Some("s"), &[]), &ctx)
            .await
            .unwrap_err();
        let ExecutionError::Failed(cause) = err else {
            panic!("expected failure");
        };
        assert_eq!(cause.kind, FailureKind::InvalidRequest);
        assert!(management.calls().is_empty());
    }
}
