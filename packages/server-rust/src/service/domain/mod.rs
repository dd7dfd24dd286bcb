//! Built-in executors and the registry that wires them to their types.
//!
//! Types are split across two exclusion groups: `maintenance` (anything that
//! rewrites or reloads sstables) and `node-lifecycle` (anything that stops
//! or restarts the node). `backup`, `commitlog-backup` and `flush` run
//! alongside either.

pub mod backup;
pub mod commitlog;
pub mod lifecycle;
pub mod maintenance;
pub mod manifest;
pub mod restore;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nodekeeper_core::requests::{
    BackupRequest, CleanupRequest, CommitlogBackupRequest, CommitlogRestoreRequest,
    DecommissionRequest, DrainRequest, FlushRequest, ImportRequest, RebuildRequest,
    RefreshRequest, RestartRequest, RestoreRequest, ScrubRequest, TruncateRequest,
    UpgradeSSTablesRequest,
};
use nodekeeper_core::OperationPayload;

use super::executor::Executor;
use super::operation::EngineError;
use super::registry::{OperationRegistry, OperationTypeDescriptor};
use crate::storage::StorageProviders;
use crate::traits::NodeManagement;

pub use backup::BackupExecutor;
pub use commitlog::{CommitlogBackupExecutor, CommitlogRestoreExecutor};
pub use lifecycle::{DecommissionExecutor, DrainExecutor, RestartExecutor};
pub use maintenance::{
    CleanupExecutor, FlushExecutor, ImportExecutor, RebuildExecutor, RefreshExecutor,
    ScrubExecutor, TruncateExecutor, UpgradeSSTablesExecutor,
};
pub use restore::RestoreExecutor;

pub const MAINTENANCE: &str = "maintenance";
pub const NODE_LIFECYCLE: &str = "node-lifecycle";

/// Local filesystem layout of the node.
#[derive(Debug, Clone, Default)]
pub struct NodePaths {
    /// Data directories, each holding `<keyspace>/<table>-<id>/` trees.
    pub data_dirs: Vec<PathBuf>,
    /// Root under which `IMPORT` restores stage downloaded files.
    pub staging_dir: Option<PathBuf>,
    /// Live commit log directory; restored segments replay from here on start.
    pub commitlog_dir: Option<PathBuf>,
    /// Directory the node archives finished commit log segments into.
    pub commitlog_archive_dir: Option<PathBuf>,
}

/// Collaborators shared by every executor. Cloned into each factory.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub management: Arc<dyn NodeManagement>,
    pub storage: Arc<StorageProviders>,
    pub paths: NodePaths,
    /// Interval between node-mode polls while waiting for a restart.
    pub restart_poll: Duration,
}

impl ExecutorDeps {
    #[must_use]
    pub fn new(management: Arc<dyn NodeManagement>, storage: StorageProviders, paths: NodePaths) -> Self {
        Self {
            management,
            storage: Arc::new(storage),
            paths,
            restart_poll: Duration::from_secs(5),
        }
    }
}

fn descriptor<P, E>(deps: &ExecutorDeps, make: fn(&ExecutorDeps) -> E) -> OperationTypeDescriptor
where
    P: OperationPayload,
    E: Executor,
{
    let deps = deps.clone();
    OperationTypeDescriptor::of::<P>(move || Box::new(make(&deps)) as Box<dyn Executor>)
}

/// Registry of every built-in operation type. `truncate` is registered but
/// disabled unless `enable_truncate` is set.
///
/// # Errors
///
/// Returns [`EngineError::DuplicateType`] only if the catalogue itself is
/// inconsistent.
pub fn builtin_registry(deps: &ExecutorDeps, enable_truncate: bool) -> Result<OperationRegistry, EngineError> {
    Ok(OperationRegistry::builder()
        .register(descriptor::<BackupRequest, _>(deps, BackupExecutor::new))?
        .register(descriptor::<RestoreRequest, _>(deps, RestoreExecutor::new).in_group(MAINTENANCE))?
        .register(descriptor::<CommitlogBackupRequest, _>(deps, CommitlogBackupExecutor::new))?
        .register(
            descriptor::<CommitlogRestoreRequest, _>(deps, CommitlogRestoreExecutor::new)
                .in_group(MAINTENANCE),
        )?
        .register(descriptor::<CleanupRequest, _>(deps, CleanupExecutor::new).in_group(MAINTENANCE))?
        .register(descriptor::<ScrubRequest, _>(deps, ScrubExecutor::new).in_group(MAINTENANCE))?
        .register(
            descriptor::<UpgradeSSTablesRequest, _>(deps, UpgradeSSTablesExecutor::new)
                .in_group(MAINTENANCE),
        )?
        .register(
            descriptor::<DecommissionRequest, _>(deps, DecommissionExecutor::new)
                .in_group(NODE_LIFECYCLE),
        )?
        .register(descriptor::<DrainRequest, _>(deps, DrainExecutor::new).in_group(NODE_LIFECYCLE))?
        .register(descriptor::<RestartRequest, _>(deps, RestartExecutor::new).in_group(NODE_LIFECYCLE))?
        .register(descriptor::<FlushRequest, _>(deps, FlushExecutor::new))?
        .register(descriptor::<RefreshRequest, _>(deps, RefreshExecutor::new).in_group(MAINTENANCE))?
        .register(descriptor::<RebuildRequest, _>(deps, RebuildExecutor::new).in_group(MAINTENANCE))?
        .register(descriptor::<ImportRequest, _>(deps, ImportExecutor::new).in_group(MAINTENANCE))?
        .register(
            descriptor::<TruncateRequest, _>(deps, TruncateExecutor::new)
                .in_group(MAINTENANCE)
                .enabled(enable_truncate),
        )?
        .build())
}
