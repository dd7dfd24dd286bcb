//! Download, verify and load a backed-up snapshot.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use nodekeeper_core::requests::{ImportRequest, RestorationStrategy, RestoreRequest};
use nodekeeper_core::{FailureKind, OperationRequest, Progress, RemoteLocation};
use serde_json::{json, Value};

use super::manifest::{
    configured_dir, data_dirs, manifest_key, resolve_location, sha256_file, table_name,
    BackupManifest, ManifestEntry,
};
use super::ExecutorDeps;
use crate::service::executor::{
    typed_request, ExecutionContext, ExecutionError, Executor, FailureExt,
};
use crate::traits::StorageTransfer;

/// Local target of every selected file, by table.
type TablePlan<'a> = BTreeMap<(&'a str, &'a str), Vec<(&'a ManifestEntry, PathBuf)>>;

/// Restores a snapshot written by [`super::BackupExecutor`].
///
/// With [`RestorationStrategy::InPlace`] every file is placed into the live
/// table directory, checked against the manifest digest, and the node is
/// asked to `refresh` each table once all files are in place. If a refresh
/// fails or the operation is cancelled between refreshes, the files of every
/// table not yet refreshed are removed; tables already refreshed keep theirs.
///
/// With [`RestorationStrategy::Import`] files are staged under
/// `<staging dir>/<operation id>/<keyspace>/<table>/` and each table is
/// loaded with `import`. The stage is removed whatever the outcome.
///
/// A failure or cancellation while downloading removes every file written
/// so far under either strategy.
pub struct RestoreExecutor {
    deps: ExecutorDeps,
}

impl RestoreExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self { deps: deps.clone() }
    }

    async fn in_place(
        &self,
        request: &RestoreRequest,
        selected: Vec<&ManifestEntry>,
        location: &RemoteLocation,
        storage: &dyn StorageTransfer,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let dirs = data_dirs(&request.data_dirs, &self.deps);
        let plan = plan_in_place(selected, &dirs).await?;
        let files = fetch(&plan, location, storage, ctx).await?;

        let tables: Vec<_> = plan.iter().collect();
        for (position, ((keyspace, table), _)) in tables.iter().enumerate() {
            let refreshed = ctx
                .call_node(
                    &format!("refresh {keyspace}.{table}"),
                    self.deps.management.refresh(keyspace, table),
                )
                .await;
            if let Err(e) = refreshed {
                let unloaded: Vec<PathBuf> = tables[position..]
                    .iter()
                    .flat_map(|(_, entries)| entries.iter().map(|(_, path)| path.clone()))
                    .collect();
                rollback(&unloaded, ctx).await;
                return Err(e);
            }
        }

        tracing::info!(
            op_id = %ctx.id(),
            snapshot = %request.snapshot_tag,
            files,
            tables = plan.len(),
            "snapshot restored in place"
        );
        Ok(json!({
            "filesProcessed": files,
            "tablesRefreshed": plan.len(),
            "restorationStrategy": RestorationStrategy::InPlace.as_str(),
        }))
    }

    async fn import(
        &self,
        request: &RestoreRequest,
        selected: Vec<&ManifestEntry>,
        location: &RemoteLocation,
        storage: &dyn StorageTransfer,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let root = configured_dir(
            request.staging_dir.as_deref(),
            self.deps.paths.staging_dir.as_ref(),
            "staging directory",
        )?;
        let stage = root.join(ctx.id().to_string());
        let plan = plan_staged(selected, &stage)?;
        let outcome = self.import_staged(&plan, location, storage, ctx).await;
        match tokio::fs::remove_dir_all(&stage).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn_leftover(&stage, &e, ctx),
        }
        let files = outcome?;

        tracing::info!(
            op_id = %ctx.id(),
            snapshot = %request.snapshot_tag,
            files,
            tables = plan.len(),
            "snapshot imported"
        );
        Ok(json!({
            "filesProcessed": files,
            "tablesImported": plan.len(),
            "restorationStrategy": RestorationStrategy::Import.as_str(),
        }))
    }

    async fn import_staged(
        &self,
        plan: &TablePlan<'_>,
        location: &RemoteLocation,
        storage: &dyn StorageTransfer,
        ctx: &ExecutionContext,
    ) -> Result<usize, ExecutionError> {
        let files = fetch(plan, location, storage, ctx).await?;
        for ((keyspace, table), entries) in plan {
            let Some(source_dir) = entries.first().and_then(|(_, path)| path.parent()) else {
                continue;
            };
            let import = ImportRequest {
                keyspace: (*keyspace).to_string(),
                table: (*table).to_string(),
                source_dir: source_dir.display().to_string(),
                keep_level: false,
                keep_repaired: false,
                no_verify: false,
                no_verify_tokens: false,
                no_invalidate_caches: false,
                extended_verify: false,
            };
            let failed = ctx
                .call_node(
                    &format!("import {keyspace}.{table}"),
                    self.deps.management.import_sstables(&import),
                )
                .await?;
            if !failed.is_empty() {
                return Err(ExecutionError::failed(
                    FailureKind::ManagementRpc,
                    format!("import failed for: {}", failed.join(", ")),
                ));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl Executor for RestoreExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Restore);
        let (location, storage) = resolve_location(&self.deps, &request.storage_location)?;

        ctx.check_cancelled()?;
        ctx.report(Progress::new(0, 0).with_message("fetching manifest"));
        let raw = storage
            .get_bytes(&location, &manifest_key(&request.snapshot_tag))
            .await
            .with_context(|| format!("downloading manifest of {}", request.snapshot_tag))
            .or_fail(FailureKind::StorageTransfer)?;
        let manifest = BackupManifest::parse(&raw, &request.snapshot_tag)?;

        let selected: Vec<&ManifestEntry> = manifest
            .files
            .iter()
            .filter(|f| request.entities.is_empty() || request.entities.contains(&f.keyspace))
            .collect();
        match request.restoration_strategy {
            RestorationStrategy::InPlace => {
                self.in_place(request, selected, &location, storage.as_ref(), ctx).await
            }
            RestorationStrategy::Import => {
                self.import(request, selected, &location, storage.as_ref(), ctx).await
            }
        }
    }
}

/// Downloads every planned file, removing all of them again on failure.
async fn fetch(
    plan: &TablePlan<'_>,
    location: &RemoteLocation,
    storage: &dyn StorageTransfer,
    ctx: &ExecutionContext,
) -> Result<usize, ExecutionError> {
    let targets: Vec<_> = plan.values().flatten().collect();
    let mut written = Vec::new();
    if let Err(e) = download_all(&targets, location, storage, ctx, &mut written).await {
        rollback(&written, ctx).await;
        return Err(e);
    }
    Ok(targets.len())
}

async fn download_all(
    plan: &[&(&ManifestEntry, PathBuf)],
    location: &RemoteLocation,
    storage: &dyn StorageTransfer,
    ctx: &ExecutionContext,
    written: &mut Vec<PathBuf>,
) -> Result<(), ExecutionError> {
    let total = plan.len() as u64;
    for (done, (entry, target)) in (1u64..).zip(plan) {
        ctx.check_cancelled()?;
        let key = entry.key();
        written.push(target.clone());
        storage
            .download(location, &key, target)
            .await
            .with_context(|| format!("downloading {key}"))
            .or_fail(FailureKind::StorageTransfer)?;

        let (size, sha256) = sha256_file(target).await.or_fail(FailureKind::Io)?;
        if size != entry.size || sha256 != entry.sha256 {
            return Err(ExecutionError::failed(
                FailureKind::Integrity,
                format!(
                    "checksum mismatch for {key}: expected {} bytes sha256 {}, got {size} bytes sha256 {sha256}",
                    entry.size, entry.sha256
                ),
            ));
        }
        ctx.report(Progress::new(done, total).with_message(format!("restored {key}")));
    }
    Ok(())
}

/// Live table directory target of every selected entry. Fails before
/// anything is written if a table directory is missing or a target already
/// exists.
async fn plan_in_place<'a>(
    entries: Vec<&'a ManifestEntry>,
    dirs: &[PathBuf],
) -> Result<TablePlan<'a>, ExecutionError> {
    let mut plan = TablePlan::new();
    let mut seen = HashSet::new();
    for entry in entries {
        let Some(table_dir) = find_table_dir(dirs, &entry.keyspace, &entry.table).await else {
            return Err(ExecutionError::failed(
                FailureKind::InvalidRequest,
                format!(
                    "no data directory for table {}.{}",
                    entry.keyspace, entry.table
                ),
            ));
        };
        let target = table_dir.join(&entry.name);
        if !seen.insert(target.clone()) {
            return Err(duplicate(entry));
        }
        if tokio::fs::try_exists(&target).await.unwrap_or(true) {
            return Err(ExecutionError::failed(
                FailureKind::InvalidRequest,
                format!("refusing to overwrite existing file {}", target.display()),
            ));
        }
        plan.entry((entry.keyspace.as_str(), entry.table.as_str()))
            .or_default()
            .push((entry, target));
    }
    Ok(plan)
}

/// Target of every selected entry under `<stage>/<keyspace>/<table>/`.
fn plan_staged<'a>(entries: Vec<&'a ManifestEntry>, stage: &Path) -> Result<TablePlan<'a>, ExecutionError> {
    let mut plan = TablePlan::new();
    let mut seen = HashSet::new();
    for entry in entries {
        let target = stage.join(&entry.keyspace).join(&entry.table).join(&entry.name);
        if !seen.insert(target.clone()) {
            return Err(duplicate(entry));
        }
        plan.entry((entry.keyspace.as_str(), entry.table.as_str()))
            .or_default()
            .push((entry, target));
    }
    Ok(plan)
}

fn duplicate(entry: &ManifestEntry) -> ExecutionError {
    ExecutionError::failed(
        FailureKind::Integrity,
        format!("manifest lists {} more than once", entry.key()),
    )
}

/// First directory `<data dir>/<keyspace>/<table>[-<id>]`.
async fn find_table_dir(dirs: &[PathBuf], keyspace: &str, table: &str) -> Option<PathBuf> {
    for dir in dirs {
        let Ok(mut entries) = tokio::fs::read_dir(dir.join(keyspace)).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir && table_name(&name.to_string_lossy()) == table {
                return Some(entry.path());
            }
        }
    }
    None
}

pub(super) async fn rollback(written: &[PathBuf], ctx: &ExecutionContext) {
    for path in written.iter().rev() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn_leftover(path, &e, ctx),
        }
    }
    if !written.is_empty() {
        tracing::info!(op_id = %ctx.id(), files = written.len(), "rolled back restored files");
    }
}

fn warn_leftover(path: &Path, error: &std::io::Error, ctx: &ExecutionContext) {
    tracing::warn!(
        op_id = %ctx.id(),
        path = %path.display(),
        %error,
        "could not remove restored file during rollback"
    );
}
