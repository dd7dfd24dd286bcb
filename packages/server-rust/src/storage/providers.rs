use std::collections::HashMap;
use std::sync::Arc;

use nodekeeper_core::RemoteLocation;

use super::local::LocalFileStorage;
use crate::traits::StorageTransfer;

/// Storage backends keyed by location protocol (`file`, `s3`, ...).
///
/// Built once at startup and shared read-only by the backup and restore
/// executors.
#[derive(Default, Clone)]
pub struct StorageProviders {
    by_protocol: HashMap<String, Arc<dyn StorageTransfer>>,
}

impl StorageProviders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Providers with only the local-filesystem `file` protocol.
    #[must_use]
    pub fn with_local() -> Self {
        Self::new().with("file", Arc::new(LocalFileStorage::new()))
    }

    /// Adds (or replaces) the provider for `protocol`.
    #[must_use]
    pub fn with(mut self, protocol: &str, provider: Arc<dyn StorageTransfer>) -> Self {
        self.by_protocol
            .insert(protocol.to_ascii_lowercase(), provider);
        self
    }

    #[must_use]
    pub fn for_location(&self, location: &RemoteLocation) -> Option<Arc<dyn StorageTransfer>> {
        self.by_protocol.get(&location.protocol).cloned()
    }

    /// Registered protocols, sorted.
    #[must_use]
    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.by_protocol.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }
}

impl std::fmt::Debug for StorageProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProviders")
            .field("protocols", &self.protocols())
            .finish()
    }
}
