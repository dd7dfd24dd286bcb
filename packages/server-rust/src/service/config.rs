/// Engine-level configuration for the operation scheduler.
///
/// Controls worker pool size, how long finished operations stay queryable,
/// and background sweep cadence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of operations executing at once.
    pub max_workers: usize,
    /// How long a terminal operation stays queryable, in milliseconds.
    pub retention_ms: u64,
    /// Interval between expiry sweeps in milliseconds.
    pub sweep_interval_ms: u64,
    /// Whether the `truncate` operation type is submittable.
    pub enable_truncate: bool,
    /// How long shutdown waits for running operations to stop, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retention_ms: 3_600_000,
            sweep_interval_ms: 60_000,
            enable_truncate: false,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.retention_ms, 3_600_000);
        assert_eq!(config.sweep_interval_ms, 60_000);
        assert!(!config.enable_truncate);
        assert_eq!(config.shutdown_grace_ms, 30_000);
    }
}
