//! Operation engine.
//!
//! The pipeline for a submitted operation:
//!
//! 1. **Registry** (`registry`): type name -> descriptor, schema validation, typed decode
//! 2. **Scheduler** (`scheduler`): queueing, worker-pool and exclusion-group admission, cancellation
//! 3. **Executors** (`executor`, `domain`): the node actions behind each type
//! 4. **Ledger** (`ledger`): the queryable record of every operation until it expires
//! 5. **Background workers** (`worker`): periodic expiry sweep

pub mod clock;
pub mod config;
pub mod domain;
pub mod executor;
pub mod ledger;
pub mod metrics;
pub mod operation;
pub mod registry;
pub mod scheduler;
pub mod worker;

// Re-export key types for convenient access.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use domain::{builtin_registry, ExecutorDeps, NodePaths};
pub use executor::{ExecutionContext, ExecutionError, Executor, ExecutorFactory};
pub use ledger::{OperationFilter, OperationLedger};
pub use operation::EngineError;
pub use registry::{OperationRegistry, OperationTypeDescriptor, RegistryBuilder};
pub use scheduler::{OperationTypeInfo, Scheduler};
pub use worker::{BackgroundRunnable, BackgroundWorker, ExpirySweeper};
