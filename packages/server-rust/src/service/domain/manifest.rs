//! Backup manifest format and the helpers backup and restore share.
//!
//! Remote layout under a node prefix:
//!
//! ```text
//! manifests/<tag>.json
//! data/<keyspace>/<table>/<file>
//! commitlogs/index.json
//! commitlogs/<segment>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use nodekeeper_core::{FailureKind, RemoteLocation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::ExecutorDeps;
use crate::service::executor::ExecutionError;
use crate::traits::StorageTransfer;

/// Length of the hex table id the node appends to table directories.
const TABLE_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub snapshot_tag: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: Option<u64>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub keyspace: String,
    pub table: String,
    /// File name inside the table directory.
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

impl ManifestEntry {
    /// Storage key of the file, relative to the node prefix.
    #[must_use]
    pub fn key(&self) -> String {
        format!("data/{}/{}/{}", self.keyspace, self.table, self.name)
    }
}

impl BackupManifest {
    /// Parses a downloaded manifest and checks every name in it.
    ///
    /// # Errors
    ///
    /// Returns an `integrity` failure if the manifest is not valid JSON, was
    /// written for another tag, or names a file outside a table directory.
    pub fn parse(bytes: &[u8], expected_tag: &str) -> Result<Self, ExecutionError> {
        let manifest: Self = serde_json::from_slice(bytes).map_err(|e| {
            ExecutionError::failed(FailureKind::Integrity, format!("malformed manifest: {e}"))
        })?;
        if manifest.snapshot_tag != expected_tag {
            return Err(ExecutionError::failed(
                FailureKind::Integrity,
                format!(
                    "manifest is for snapshot '{}', expected '{expected_tag}'",
                    manifest.snapshot_tag
                ),
            ));
        }
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ExecutionError> {
        let names = self
            .files
            .iter()
            .flat_map(|f| [f.keyspace.as_str(), f.table.as_str()]);
        let mut bad: Vec<String> = nodekeeper_core::requests::invalid_names(names)
            .into_iter()
            .map(str::to_string)
            .collect();
        bad.extend(
            self.files
                .iter()
                .filter(|f| !is_plain_file_name(&f.name))
                .map(|f| f.name.clone()),
        );
        if bad.is_empty() {
            return Ok(());
        }
        bad.dedup();
        Err(ExecutionError::failed(
            FailureKind::Integrity,
            format!("manifest contains invalid names: {}", bad.join(", ")),
        ))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("encoding manifest")
    }
}

/// Commit log segments uploaded under a node prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitlogIndex {
    pub segments: Vec<CommitlogSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitlogSegment {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    /// Milliseconds since the Unix epoch at which the node archived the segment.
    pub archived_at: u64,
}

/// Storage key of the commit log index.
pub const COMMITLOG_INDEX_KEY: &str = "commitlogs/index.json";

impl CommitlogSegment {
    #[must_use]
    pub fn key(&self) -> String {
        format!("commitlogs/{}", self.name)
    }
}

impl CommitlogIndex {
    /// Parses a downloaded index.
    ///
    /// # Errors
    ///
    /// Returns an `integrity` failure if the index is not valid JSON or names
    /// something other than a commit log segment.
    pub fn parse(bytes: &[u8]) -> Result<Self, ExecutionError> {
        let index: Self = serde_json::from_slice(bytes).map_err(|e| {
            ExecutionError::failed(FailureKind::Integrity, format!("malformed commit log index: {e}"))
        })?;
        let bad: Vec<&str> = index
            .segments
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| !is_segment_name(name))
            .collect();
        if bad.is_empty() {
            Ok(index)
        } else {
            Err(ExecutionError::failed(
                FailureKind::Integrity,
                format!("commit log index contains invalid names: {}", bad.join(", ")),
            ))
        }
    }

    /// Segment recorded under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CommitlogSegment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Adds `segment`, replacing any earlier entry with the same name.
    pub fn upsert(&mut self, segment: CommitlogSegment) {
        match self.segments.iter_mut().find(|s| s.name == segment.name) {
            Some(existing) => *existing = segment,
            None => self.segments.push(segment),
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("encoding commit log index")
    }
}

/// Whether `name` looks like a commit log segment file: `CommitLog-<...>.log`.
#[must_use]
pub fn is_segment_name(name: &str) -> bool {
    is_plain_file_name(name) && name.starts_with("CommitLog-") && name.ends_with(".log")
}

/// Storage key of the manifest for `tag`.
#[must_use]
pub fn manifest_key(tag: &str) -> String {
    format!("manifests/{tag}.json")
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Table name of a data directory entry: `users-0123...cdef` is `users`.
#[must_use]
pub fn table_name(dir_name: &str) -> &str {
    match dir_name.rsplit_once('-') {
        Some((table, id))
            if id.len() == TABLE_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            table
        }
        _ => dir_name,
    }
}

/// Size and lowercase hex SHA-256 of a local file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> anyhow::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// Parses `raw` and picks the provider registered for its protocol.
///
/// # Errors
///
/// Returns an `invalid-request` failure if the location does not parse or
/// no provider handles its protocol.
pub fn resolve_location(
    deps: &ExecutorDeps,
    raw: &str,
) -> Result<(RemoteLocation, Arc<dyn StorageTransfer>), ExecutionError> {
    let location: RemoteLocation = raw
        .parse()
        .map_err(|e: nodekeeper_core::LocationError| {
            ExecutionError::failed(FailureKind::InvalidRequest, e.to_string())
        })?;
    let provider = deps.storage.for_location(&location).ok_or_else(|| {
        ExecutionError::failed(
            FailureKind::InvalidRequest,
            format!(
                "no storage provider for protocol '{}' (available: {})",
                location.protocol,
                deps.storage.protocols().join(", ")
            ),
        )
    })?;
    Ok((location, provider))
}

/// Data directories named by the request, or the node's configured ones.
#[must_use]
pub fn data_dirs(requested: &[String], deps: &ExecutorDeps) -> Vec<PathBuf> {
    if requested.is_empty() {
        deps.paths.data_dirs.clone()
    } else {
        requested.iter().map(PathBuf::from).collect()
    }
}

/// Directory named by the request, or the node's configured one.
///
/// # Errors
///
/// Returns an `invalid-request` failure naming `what` when neither is set.
pub fn configured_dir(
    requested: Option<&str>,
    configured: Option<&PathBuf>,
    what: &str,
) -> Result<PathBuf, ExecutionError> {
    requested
        .map(PathBuf::from)
        .or_else(|| configured.cloned())
        .ok_or_else(|| {
            ExecutionError::failed(
                FailureKind::InvalidRequest,
                format!("no {what} given and none configured on this node"),
            )
        })
}
