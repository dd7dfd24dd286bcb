//! Table maintenance executors.
//!
//! cleanup, scrub and upgradesstables walk their tables one at a time so
//! progress is visible and cancellation takes effect between tables. The
//! remaining types are a single management call each.

use std::slice;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use nodekeeper_core::{FailureKind, OperationRequest, Progress};
use serde::Serialize;
use serde_json::{json, Value};

use super::ExecutorDeps;
use crate::service::executor::{
    typed_request, ExecutionContext, ExecutionError, Executor, FailureExt,
};
use crate::traits::NodeManagement;

/// Tables to process: the requested ones, or every table the node reports.
async fn resolve_tables(
    ctx: &ExecutionContext,
    management: &dyn NodeManagement,
    keyspace: &str,
    requested: &[String],
) -> Result<Vec<String>, ExecutionError> {
    if !requested.is_empty() {
        return Ok(requested.to_vec());
    }
    ctx.call_node("list tables", management.list_tables(keyspace))
        .await
}

fn table_progress(done: usize, total: usize, action: &str, keyspace: &str, table: Option<&str>) -> Progress {
    let message = match table {
        Some(table) => format!("{action} {keyspace}.{table}"),
        None => format!("{action} {keyspace} finished"),
    };
    Progress::new(done as u64, total as u64).with_message(message)
}

// ---------------------------------------------------------------------------
// Per-table executors
// ---------------------------------------------------------------------------

pub struct CleanupExecutor {
    management: Arc<dyn NodeManagement>,
}

impl CleanupExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for CleanupExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Cleanup);
        let ks = &request.keyspace;
        let tables = resolve_tables(ctx, self.management.as_ref(), ks, &request.tables).await?;

        for (done, table) in tables.iter().enumerate() {
            ctx.report(table_progress(done, tables.len(), "cleanup", ks, Some(table)));
            ctx.call_node(
                "cleanup",
                self.management.cleanup(ks, slice::from_ref(table), request.jobs),
            )
            .await?;
        }
        ctx.report(table_progress(tables.len(), tables.len(), "cleanup", ks, None));
        Ok(json!({ "keyspace": ks, "tablesProcessed": tables }))
    }
}

pub struct ScrubExecutor {
    management: Arc<dyn NodeManagement>,
}

impl ScrubExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for ScrubExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Scrub);
        let ks = &request.keyspace;
        let tables = resolve_tables(ctx, self.management.as_ref(), ks, &request.tables).await?;

        for (done, table) in tables.iter().enumerate() {
            ctx.report(table_progress(done, tables.len(), "scrub", ks, Some(table)));
            let single = nodekeeper_core::requests::ScrubRequest {
                tables: vec![table.clone()],
                ..request.clone()
            };
            ctx.call_node("scrub", self.management.scrub(&single)).await?;
        }
        ctx.report(table_progress(tables.len(), tables.len(), "scrub", ks, None));
        Ok(json!({ "keyspace": ks, "tablesProcessed": tables }))
    }
}

pub struct UpgradeSSTablesExecutor {
    management: Arc<dyn NodeManagement>,
}

impl UpgradeSSTablesExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for UpgradeSSTablesExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, UpgradeSSTables);
        let ks = &request.keyspace;
        let tables = resolve_tables(ctx, self.management.as_ref(), ks, &request.tables).await?;

        for (done, table) in tables.iter().enumerate() {
            ctx.report(table_progress(done, tables.len(), "upgradesstables", ks, Some(table)));
            let single = nodekeeper_core::requests::UpgradeSSTablesRequest {
                tables: vec![table.clone()],
                ..request.clone()
            };
            ctx.call_node("upgradesstables", self.management.upgrade_sstables(&single))
                .await?;
        }
        ctx.report(table_progress(tables.len(), tables.len(), "upgradesstables", ks, None));
        Ok(json!({ "keyspace": ks, "tablesProcessed": tables }))
    }
}

// ---------------------------------------------------------------------------
// Single-call executors
// ---------------------------------------------------------------------------

/// Request echoed back as an operation result.
fn echo<T: Serialize>(request: &T) -> Result<Value, ExecutionError> {
    serde_json::to_value(request)
        .context("encoding result")
        .or_fail(FailureKind::Internal)
}

/// Generates an executor that makes one management call and echoes its
/// request as the result.
macro_rules! single_call_executor {
    (
        $(#[$meta:meta])*
        $name:ident, $variant:ident, $action:literal,
        |$management:ident, $req:ident| $call:expr
    ) => {
        $(#[$meta])*
        pub struct $name {
            management: Arc<dyn NodeManagement>,
        }

        impl $name {
            #[must_use]
            pub fn new(deps: &ExecutorDeps) -> Self {
                Self {
                    management: Arc::clone(&deps.management),
                }
            }
        }

        #[async_trait]
        impl Executor for $name {
            async fn execute(
                &mut self,
                request: &OperationRequest,
                ctx: &ExecutionContext,
            ) -> Result<Value, ExecutionError> {
                let $req = typed_request!(request, $variant);
                let $management = self.management.as_ref();
                ctx.call_node($action, $call).await?;
                echo($req)
            }
        }
    };
}

single_call_executor!(
    /// Flushes memtables of one table set, one keyspace, or everything.
    FlushExecutor, Flush, "flush",
    |m, r| m.flush(r.keyspace.as_deref(), &r.tables)
);

single_call_executor!(
    /// Loads newly placed sstables of one table.
    RefreshExecutor, Refresh, "refresh",
    |m, r| m.refresh(&r.keyspace, &r.table)
);

single_call_executor!(
    /// Streams data from other replicas.
    RebuildExecutor, Rebuild, "rebuild",
    |m, r| m.rebuild(r)
);

single_call_executor!(
    /// Removes all data of one table.
    TruncateExecutor, Truncate, "truncate",
    |m, r| m.truncate(&r.keyspace, &r.table)
);

/// Imports sstables from a directory; any directory the node could not
/// import fails the operation.
pub struct ImportExecutor {
    management: Arc<dyn NodeManagement>,
}

impl ImportExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for ImportExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Import);
        let failed = ctx
            .call_node("import", self.management.import_sstables(request))
            .await?;
        if !failed.is_empty() {
            return Err(ExecutionError::failed(
                FailureKind::ManagementRpc,
                format!("import failed for: {}", failed.join(", ")),
            ));
        }
        Ok(json!({
            "keyspace": request.keyspace,
            "table": request.table,
            "sourceDir": request.source_dir,
        }))
    }
}
