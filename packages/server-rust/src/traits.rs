use std::path::Path;

use async_trait::async_trait;
use nodekeeper_core::requests::{ImportRequest, RebuildRequest, ScrubRequest, UpgradeSSTablesRequest};
use nodekeeper_core::RemoteLocation;

/// Management channel to the local database node.
///
/// Every call blocks until the node reports the action finished (or failed).
/// Implementations: HTTP management API (`HttpManagementClient`), a
/// recording fake (tests).
#[async_trait]
pub trait NodeManagement: Send + Sync {
    /// Table names of a keyspace, as the node reports them.
    async fn list_tables(&self, keyspace: &str) -> anyhow::Result<Vec<String>>;

    async fn cleanup(&self, keyspace: &str, tables: &[String], jobs: u32) -> anyhow::Result<()>;

    async fn scrub(&self, request: &ScrubRequest) -> anyhow::Result<()>;

    async fn upgrade_sstables(&self, request: &UpgradeSSTablesRequest) -> anyhow::Result<()>;

    /// Flushes `tables` of `keyspace`, every table of it when `tables` is
    /// empty, or every keyspace when `keyspace` is `None`.
    async fn flush(&self, keyspace: Option<&str>, tables: &[String]) -> anyhow::Result<()>;

    /// Loads sstables newly placed in a table's data directory.
    async fn refresh(&self, keyspace: &str, table: &str) -> anyhow::Result<()>;

    async fn rebuild(&self, request: &RebuildRequest) -> anyhow::Result<()>;

    /// Imports sstables; returns the source directories that failed to import.
    async fn import_sstables(&self, request: &ImportRequest) -> anyhow::Result<Vec<String>>;

    async fn truncate(&self, keyspace: &str, table: &str) -> anyhow::Result<()>;

    async fn decommission(&self, force: bool) -> anyhow::Result<()>;

    async fn drain(&self) -> anyhow::Result<()>;

    /// Restarts the node process. Returns once the restart was initiated.
    async fn restart(&self) -> anyhow::Result<()>;

    /// Current operation mode, e.g. `NORMAL`, `DRAINED`, `STARTING`.
    async fn operation_mode(&self) -> anyhow::Result<String>;

    /// Snapshots `keyspaces` (all when empty) under `tag`.
    async fn take_snapshot(&self, tag: &str, keyspaces: &[String]) -> anyhow::Result<()>;

    async fn clear_snapshot(&self, tag: &str) -> anyhow::Result<()>;
}

/// Remote object storage for backup files.
///
/// Keys are relative to the node prefix of a [`RemoteLocation`]
/// (`cluster/datacenter/node/...`).
#[async_trait]
pub trait StorageTransfer: Send + Sync {
    /// Uploads a local file; returns the number of bytes written.
    async fn upload(&self, location: &RemoteLocation, key: &str, local: &Path) -> anyhow::Result<u64>;

    /// Downloads an object into a local file, creating parent directories;
    /// returns the number of bytes written.
    async fn download(&self, location: &RemoteLocation, key: &str, local: &Path) -> anyhow::Result<u64>;

    async fn put_bytes(&self, location: &RemoteLocation, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn get_bytes(&self, location: &RemoteLocation, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Whether an object is stored under `key`.
    async fn exists(&self, location: &RemoteLocation, key: &str) -> anyhow::Result<bool>;
}
