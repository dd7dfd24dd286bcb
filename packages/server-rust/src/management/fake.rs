//! Recording in-memory [`NodeManagement`] for executor tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use nodekeeper_core::requests::{ImportRequest, RebuildRequest, ScrubRequest, UpgradeSSTablesRequest};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::traits::NodeManagement;

/// Records every call as a short string (`"cleanup ks1 t1"`), and can be
/// scripted to fail an action, report a sequence of node modes, write
/// snapshot files, or trip a cancellation token when an action is called.
#[derive(Default)]
pub struct RecordingManagement {
    calls: Mutex<Vec<String>>,
    tables: HashMap<String, Vec<String>>,
    failing: Option<String>,
    modes: Mutex<VecDeque<String>>,
    snapshot_files: Vec<(PathBuf, Vec<u8>)>,
    cancel_on: Option<(String, CancellationToken)>,
    failed_imports: Vec<String>,
}

impl RecordingManagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(mut self, keyspace: &str, tables: &[&str]) -> Self {
        self.tables.insert(
            keyspace.to_string(),
            tables.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Calls whose recorded form starts with `prefix` fail.
    pub fn failing(mut self, prefix: &str) -> Self {
        self.failing = Some(prefix.to_string());
        self
    }

    /// Modes returned by successive `operation_mode` calls; the last repeats.
    pub fn with_modes(self, modes: &[&str]) -> Self {
        *self.modes.lock() = modes.iter().map(ToString::to_string).collect();
        self
    }

    /// Files written on `take_snapshot` and removed on `clear_snapshot`.
    pub fn with_snapshot_file(mut self, path: PathBuf, bytes: &[u8]) -> Self {
        self.snapshot_files.push((path, bytes.to_vec()));
        self
    }

    /// Cancels `token` once a call starting with `prefix` is recorded.
    pub fn cancel_on(mut self, prefix: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((prefix.to_string(), token));
        self
    }

    pub fn with_failed_imports(mut self, dirs: &[&str]) -> Self {
        self.failed_imports = dirs.iter().map(ToString::to_string).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) -> anyhow::Result<()> {
        let fail = self
            .failing
            .as_deref()
            .is_some_and(|prefix| call.starts_with(prefix));
        if let Some((prefix, token)) = &self.cancel_on {
            if call.starts_with(prefix.as_str()) {
                token.cancel();
            }
        }
        self.calls.lock().push(call.clone());
        if fail {
            anyhow::bail!("node rejected {call}");
        }
        Ok(())
    }
}

fn joined(tables: &[String]) -> String {
    tables.join(",")
}

#[async_trait]
impl NodeManagement for RecordingManagement {
    async fn list_tables(&self, keyspace: &str) -> anyhow::Result<Vec<String>> {
        self.record(format!("list_tables {keyspace}"))?;
        Ok(self.tables.get(keyspace).cloned().unwrap_or_default())
    }

    async fn cleanup(&self, keyspace: &str, tables: &[String], jobs: u32) -> anyhow::Result<()> {
        self.record(format!("cleanup {keyspace} {} jobs={jobs}", joined(tables)))
    }

    async fn scrub(&self, request: &ScrubRequest) -> anyhow::Result<()> {
        self.record(format!(
            "scrub {} {} skip_corrupted={}",
            request.keyspace,
            joined(&request.tables),
            request.skip_corrupted
        ))
    }

    async fn upgrade_sstables(&self, request: &UpgradeSSTablesRequest) -> anyhow::Result<()> {
        self.record(format!(
            "upgradesstables {} {} all={}",
            request.keyspace,
            joined(&request.tables),
            request.include_all_sstables
        ))
    }

    async fn flush(&self, keyspace: Option<&str>, tables: &[String]) -> anyhow::Result<()> {
        self.record(format!("flush {} {}", keyspace.unwrap_or("*"), joined(tables)))
    }

    async fn refresh(&self, keyspace: &str, table: &str) -> anyhow::Result<()> {
        self.record(format!("refresh {keyspace} {table}"))
    }

    async fn rebuild(&self, request: &RebuildRequest) -> anyhow::Result<()> {
        self.record(format!(
            "rebuild {} {} tokens={}",
            request.source_dc.as_deref().unwrap_or("*"),
            request.keyspace.as_deref().unwrap_or("*"),
            request.specific_tokens.len()
        ))
    }

    async fn import_sstables(&self, request: &ImportRequest) -> anyhow::Result<Vec<String>> {
        self.record(format!(
            "import {} {} {}",
            request.keyspace, request.table, request.source_dir
        ))?;
        Ok(self.failed_imports.clone())
    }

    async fn truncate(&self, keyspace: &str, table: &str) -> anyhow::Result<()> {
        self.record(format!("truncate {keyspace} {table}"))
    }

    async fn decommission(&self, force: bool) -> anyhow::Result<()> {
        self.record(format!("decommission force={force}"))
    }

    async fn drain(&self) -> anyhow::Result<()> {
        self.record("drain".to_string())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.record("restart".to_string())
    }

    async fn operation_mode(&self) -> anyhow::Result<String> {
        self.record("operation_mode".to_string())?;
        let mut modes = self.modes.lock();
        let mode = if modes.len() > 1 {
            modes.pop_front()
        } else {
            modes.front().cloned()
        };
        Ok(mode.unwrap_or_else(|| "NORMAL".to_string()))
    }

    async fn take_snapshot(&self, tag: &str, keyspaces: &[String]) -> anyhow::Result<()> {
        self.record(format!("take_snapshot {tag} {}", joined(keyspaces)))?;
        for (path, bytes) in &self.snapshot_files {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    async fn clear_snapshot(&self, tag: &str) -> anyhow::Result<()> {
        self.record(format!("clear_snapshot {tag}"))?;
        for (path, _) in &self.snapshot_files {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}
