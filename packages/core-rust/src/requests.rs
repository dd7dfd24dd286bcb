//! Typed request payloads for the closed catalogue of built-in operations.
//!
//! Every payload type implements [`OperationPayload`], pairing its wire name
//! with the schema that raw submissions are validated against. The
//! [`OperationRequest`] enum is the tagged union of all of them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::location::RemoteLocation;
use crate::schema::{is_identifier, FieldError, FieldKind, RequestSchema};

/// A typed payload bound to one operation type name.
pub trait OperationPayload:
    DeserializeOwned + Serialize + Into<OperationRequest> + Send + Sync + 'static
{
    /// Operation type name, e.g. `"cleanup"`.
    const TYPE_NAME: &'static str;

    /// Schema raw payloads are validated against before decoding.
    fn schema() -> RequestSchema;

    /// Cross-field checks a schema cannot express.
    fn check(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

/// Decodes an already schema-validated payload into its typed request.
///
/// # Errors
///
/// Returns field-level errors when deserialization or [`OperationPayload::check`] fails.
pub fn decode_payload<P: OperationPayload>(
    raw: serde_json::Value,
) -> Result<OperationRequest, Vec<FieldError>> {
    let payload: P =
        serde_json::from_value(raw).map_err(|e| vec![FieldError::new("", e.to_string())])?;
    let errors = payload.check();
    if errors.is_empty() {
        Ok(payload.into())
    } else {
        Err(errors)
    }
}

macro_rules! operation_requests {
    ($($variant:ident($payload:ty)),+ $(,)?) => {
        /// Typed request of any built-in operation type.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        #[serde(untagged)]
        pub enum OperationRequest {
            $($variant($payload),)+
        }

        impl OperationRequest {
            /// Type name of the payload this request carries.
            #[must_use]
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(OperationRequest::$variant(_) => <$payload as OperationPayload>::TYPE_NAME,)+
                }
            }
        }

        $(
            impl From<$payload> for OperationRequest {
                fn from(payload: $payload) -> Self {
                    OperationRequest::$variant(payload)
                }
            }
        )+
    };
}

operation_requests!(
    Backup(BackupRequest),
    Restore(RestoreRequest),
    Cleanup(CleanupRequest),
    Scrub(ScrubRequest),
    UpgradeSSTables(UpgradeSSTablesRequest),
    Decommission(DecommissionRequest),
    Drain(DrainRequest),
    Restart(RestartRequest),
    Flush(FlushRequest),
    Refresh(RefreshRequest),
    Rebuild(RebuildRequest),
    Import(ImportRequest),
    Truncate(TruncateRequest),
    CommitlogBackup(CommitlogBackupRequest),
    CommitlogRestore(CommitlogRestoreRequest),
);

fn check_location(raw: &str, errors: &mut Vec<FieldError>) {
    if let Err(e) = raw.parse::<RemoteLocation>() {
        errors.push(FieldError::new("storageLocation", e.to_string()));
    }
}

fn check_absolute(field: &str, path: Option<&str>, errors: &mut Vec<FieldError>) {
    if path.is_some_and(|p| !p.starts_with('/')) {
        errors.push(FieldError::new(field, "must be an absolute path"));
    }
}

fn check_snapshot_tag(tag: &str, errors: &mut Vec<FieldError>) {
    let ok = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        errors.push(FieldError::new(
            "snapshotTag",
            "snapshot tag may only contain [A-Za-z0-9_.-]",
        ));
    }
}

// ---------------------------------------------------------------------------
// Backup / restore
// ---------------------------------------------------------------------------

/// Snapshot the node and upload the snapshot to remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    pub storage_location: String,
    /// Derived from the operation id when absent.
    #[serde(default)]
    pub snapshot_tag: Option<String>,
    /// Keyspaces to back up; empty means all.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Overrides the node's configured data directories.
    #[serde(default)]
    pub data_dirs: Vec<String>,
}

impl OperationPayload for BackupRequest {
    const TYPE_NAME: &'static str = "backup";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("storageLocation", FieldKind::String)
            .optional("snapshotTag", FieldKind::String)
            .optional("entities", FieldKind::IdentifierList)
            .optional("dataDirs", FieldKind::StringList)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_location(&self.storage_location, &mut errors);
        if let Some(tag) = &self.snapshot_tag {
            check_snapshot_tag(tag, &mut errors);
        }
        errors
    }
}

/// How restored sstables reach the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorationStrategy {
    /// Download into the live table directories, then `refresh` each table.
    #[default]
    InPlace,
    /// Download into a staging directory, then `import` each table from it.
    Import,
}

impl RestorationStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RestorationStrategy::InPlace => "IN_PLACE",
            RestorationStrategy::Import => "IMPORT",
        }
    }
}

/// Download a previously uploaded snapshot and load it into the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub storage_location: String,
    pub snapshot_tag: String,
    /// Keyspaces to restore; empty means everything in the manifest.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub data_dirs: Vec<String>,
    #[serde(default)]
    pub restoration_strategy: RestorationStrategy,
    /// Staging root for [`RestorationStrategy::Import`]; overrides the node's.
    #[serde(default)]
    pub staging_dir: Option<String>,
}

impl OperationPayload for RestoreRequest {
    const TYPE_NAME: &'static str = "restore";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("storageLocation", FieldKind::String)
            .required("snapshotTag", FieldKind::String)
            .optional("entities", FieldKind::IdentifierList)
            .optional("dataDirs", FieldKind::StringList)
            .optional("restorationStrategy", FieldKind::String)
            .optional("stagingDir", FieldKind::String)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_location(&self.storage_location, &mut errors);
        check_snapshot_tag(&self.snapshot_tag, &mut errors);
        check_absolute("stagingDir", self.staging_dir.as_deref(), &mut errors);
        errors
    }
}

/// Upload the commit log segments the node has archived.
///
/// Segments already present in the remote commit log index with the same
/// digest are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitlogBackupRequest {
    pub storage_location: String,
    /// Overrides the node's commit log archive directory.
    #[serde(default)]
    pub commitlog_archive_dir: Option<String>,
}

impl OperationPayload for CommitlogBackupRequest {
    const TYPE_NAME: &'static str = "commitlog-backup";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("storageLocation", FieldKind::String)
            .optional("commitlogArchiveDir", FieldKind::String)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_location(&self.storage_location, &mut errors);
        check_absolute(
            "commitlogArchiveDir",
            self.commitlog_archive_dir.as_deref(),
            &mut errors,
        );
        errors
    }
}

/// Download backed-up commit log segments for replay on the next node start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitlogRestoreRequest {
    pub storage_location: String,
    /// Overrides the node's commit log directory.
    #[serde(default)]
    pub commitlog_dir: Option<String>,
    /// Only segments archived at or before this time (ms since the Unix epoch).
    #[serde(default)]
    pub timestamp_end: Option<u64>,
}

impl OperationPayload for CommitlogRestoreRequest {
    const TYPE_NAME: &'static str = "commitlog-restore";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("storageLocation", FieldKind::String)
            .optional("commitlogDir", FieldKind::String)
            .optional("timestampEnd", FieldKind::UnsignedInt)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_location(&self.storage_location, &mut errors);
        check_absolute("commitlogDir", self.commitlog_dir.as_deref(), &mut errors);
        errors
    }
}

// ---------------------------------------------------------------------------
// Table maintenance
// ---------------------------------------------------------------------------

/// Remove data the node no longer owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub keyspace: String,
    /// Tables to clean; empty means every table of the keyspace.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Concurrent compaction jobs, 0 lets the node decide.
    #[serde(default)]
    pub jobs: u32,
}

impl OperationPayload for CleanupRequest {
    const TYPE_NAME: &'static str = "cleanup";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .optional("tables", FieldKind::IdentifierList)
            .optional("jobs", FieldKind::UnsignedInt)
    }
}

/// Rebuild sstables, discarding corrupted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct ScrubRequest {
    pub keyspace: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub disable_snapshot: bool,
    #[serde(default)]
    pub skip_corrupted: bool,
    #[serde(default)]
    pub no_validate: bool,
    #[serde(default, rename = "reinsertOverflowedTTL")]
    pub reinsert_overflowed_ttl: bool,
    #[serde(default)]
    pub jobs: u32,
}

impl OperationPayload for ScrubRequest {
    const TYPE_NAME: &'static str = "scrub";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .optional("tables", FieldKind::IdentifierList)
            .optional("disableSnapshot", FieldKind::Bool)
            .optional("skipCorrupted", FieldKind::Bool)
            .optional("noValidate", FieldKind::Bool)
            .optional("reinsertOverflowedTTL", FieldKind::Bool)
            .optional("jobs", FieldKind::UnsignedInt)
    }
}

/// Rewrite sstables in the node's current format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSSTablesRequest {
    pub keyspace: String,
    #[serde(default)]
    pub tables: Vec<String>,
    /// Also rewrite sstables already in the current format.
    #[serde(default, rename = "includeAllSSTables")]
    pub include_all_sstables: bool,
    #[serde(default)]
    pub jobs: u32,
}

impl OperationPayload for UpgradeSSTablesRequest {
    const TYPE_NAME: &'static str = "upgradesstables";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .optional("tables", FieldKind::IdentifierList)
            .optional("includeAllSSTables", FieldKind::Bool)
            .optional("jobs", FieldKind::UnsignedInt)
    }
}

/// Flush memtables to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushRequest {
    /// Keyspace to flush; absent flushes every keyspace.
    #[serde(default)]
    pub keyspace: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
}

impl OperationPayload for FlushRequest {
    const TYPE_NAME: &'static str = "flush";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .optional("keyspace", FieldKind::Identifier)
            .optional("tables", FieldKind::IdentifierList)
    }

    fn check(&self) -> Vec<FieldError> {
        if self.keyspace.is_none() && !self.tables.is_empty() {
            vec![FieldError::new("tables", "tables require a keyspace")]
        } else {
            Vec::new()
        }
    }
}

/// Load sstables newly placed in a table's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub keyspace: String,
    pub table: String,
}

impl OperationPayload for RefreshRequest {
    const TYPE_NAME: &'static str = "refresh";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .required("table", FieldKind::Identifier)
    }
}

/// A token range, bounds kept as the node prints them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: String,
    pub end: String,
}

/// Stream data from other replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildRequest {
    #[serde(default, rename = "sourceDC")]
    pub source_dc: Option<String>,
    #[serde(default)]
    pub keyspace: Option<String>,
    #[serde(default)]
    pub specific_tokens: Vec<TokenRange>,
}

impl OperationPayload for RebuildRequest {
    const TYPE_NAME: &'static str = "rebuild";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .optional("sourceDC", FieldKind::String)
            .optional("keyspace", FieldKind::Identifier)
            .optional("specificTokens", FieldKind::TokenRangeList)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !self.specific_tokens.is_empty() {
            if self.keyspace.is_none() {
                errors.push(FieldError::new(
                    "keyspace",
                    "specificTokens require a keyspace",
                ));
            }
            if self.source_dc.is_none() {
                errors.push(FieldError::new(
                    "sourceDC",
                    "specificTokens require a source datacenter",
                ));
            }
        }
        errors
    }
}

/// Import sstables from a directory into a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct ImportRequest {
    pub keyspace: String,
    pub table: String,
    pub source_dir: String,
    #[serde(default)]
    pub keep_level: bool,
    #[serde(default)]
    pub keep_repaired: bool,
    #[serde(default)]
    pub no_verify: bool,
    #[serde(default)]
    pub no_verify_tokens: bool,
    #[serde(default)]
    pub no_invalidate_caches: bool,
    #[serde(default)]
    pub extended_verify: bool,
}

impl OperationPayload for ImportRequest {
    const TYPE_NAME: &'static str = "import";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .required("table", FieldKind::Identifier)
            .required("sourceDir", FieldKind::String)
            .optional("keepLevel", FieldKind::Bool)
            .optional("keepRepaired", FieldKind::Bool)
            .optional("noVerify", FieldKind::Bool)
            .optional("noVerifyTokens", FieldKind::Bool)
            .optional("noInvalidateCaches", FieldKind::Bool)
            .optional("extendedVerify", FieldKind::Bool)
    }

    fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_absolute("sourceDir", Some(&self.source_dir), &mut errors);
        errors
    }
}

/// Remove all data of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncateRequest {
    pub keyspace: String,
    pub table: String,
}

impl OperationPayload for TruncateRequest {
    const TYPE_NAME: &'static str = "truncate";

    fn schema() -> RequestSchema {
        RequestSchema::new()
            .required("keyspace", FieldKind::Identifier)
            .required("table", FieldKind::Identifier)
    }
}

// ---------------------------------------------------------------------------
// Node lifecycle
// ---------------------------------------------------------------------------

/// Stream this node's data away and leave the ring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionRequest {
    /// Decommission even if it drops the replica count below the replication factor.
    #[serde(default)]
    pub force: bool,
}

impl OperationPayload for DecommissionRequest {
    const TYPE_NAME: &'static str = "decommission";

    fn schema() -> RequestSchema {
        RequestSchema::new().optional("force", FieldKind::Bool)
    }
}

/// Flush everything and stop accepting writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainRequest {}

impl OperationPayload for DrainRequest {
    const TYPE_NAME: &'static str = "drain";

    fn schema() -> RequestSchema {
        RequestSchema::new()
    }
}

const DEFAULT_RESTART_WAIT_SECONDS: u64 = 600;

fn default_restart_wait() -> u64 {
    DEFAULT_RESTART_WAIT_SECONDS
}

/// Drain, restart the node process and wait until it serves again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    #[serde(default = "default_restart_wait")]
    pub wait_timeout_seconds: u64,
}

impl Default for RestartRequest {
    fn default() -> Self {
        Self {
            wait_timeout_seconds: DEFAULT_RESTART_WAIT_SECONDS,
        }
    }
}

impl OperationPayload for RestartRequest {
    const TYPE_NAME: &'static str = "restart";

    fn schema() -> RequestSchema {
        RequestSchema::new().optional("waitTimeoutSeconds", FieldKind::UnsignedInt)
    }
}

/// Tables named by `keyspace`/`tables` that fail the identifier rules.
///
/// Schemas already enforce this on the wire; executors use it for names
/// discovered at runtime (e.g. from a manifest).
#[must_use]
pub fn invalid_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    names.into_iter().filter(|n| !is_identifier(n)).collect()
}
