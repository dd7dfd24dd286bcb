//! In-memory table of every known operation.
//!
//! The ledger is the single source of truth for status queries. Lifecycle
//! fields are changed only by the scheduler (through [`OperationLedger::update`]),
//! progress only by executors (through [`OperationLedger::set_progress`]).
//! Nothing is persisted: a restarted process starts empty.

use dashmap::DashMap;
use nodekeeper_core::{Operation, OperationId, OperationState, Progress};

/// Optional filters for [`OperationLedger::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    pub type_name: Option<String>,
    pub state: Option<OperationState>,
}

impl OperationFilter {
    #[must_use]
    pub fn matches(&self, op: &Operation) -> bool {
        self.type_name.as_deref().is_none_or(|t| t == op.type_name())
            && self.state.is_none_or(|s| s == op.state())
    }
}

/// Concurrent id -> operation store.
#[derive(Debug, Default)]
pub struct OperationLedger {
    operations: DashMap<OperationId, Operation>,
}

impl OperationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new operation. Returns `false` (and leaves the ledger
    /// unchanged) if the id is already present.
    pub fn insert(&self, op: Operation) -> bool {
        match self.operations.entry(op.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(op);
                true
            }
        }
    }

    #[must_use]
    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    /// Point-in-time snapshot of one operation.
    #[must_use]
    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.operations.get(id).map(|entry| entry.value().clone())
    }

    /// Applies `f` to the stored operation in place, holding its entry lock.
    pub fn update<R>(&self, id: &OperationId, f: impl FnOnce(&mut Operation) -> R) -> Option<R> {
        self.operations.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Replaces an operation's progress; ignored for unknown or terminal operations.
    pub fn set_progress(&self, id: &OperationId, progress: Progress) -> bool {
        self.update(id, |op| op.set_progress(progress))
            .unwrap_or(false)
    }

    /// Snapshots of all matching operations, oldest first.
    #[must_use]
    pub fn list(&self, filter: &OperationFilter) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .operations
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        ops.sort_by_key(|op| (op.created_at(), op.id()));
        ops
    }

    /// Removes terminal operations completed more than `retention_ms` before
    /// `now_ms` and returns them. Non-terminal operations are never removed.
    pub fn remove_expired(&self, now_ms: u64, retention_ms: u64) -> Vec<Operation> {
        let candidates: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|entry| entry.value().is_expired(now_ms, retention_ms))
            .map(|entry| *entry.key())
            .collect();

        candidates
            .into_iter()
            .filter_map(|id| {
                self.operations
                    .remove_if(&id, |_, op| op.is_expired(now_ms, retention_ms))
                    .map(|(_, op)| op)
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
