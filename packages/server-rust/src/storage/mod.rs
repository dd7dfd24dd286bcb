//! Remote storage backends for backup and restore.
//!
//! - [`LocalFileStorage`]: the `file` protocol; the bucket is a directory on
//!   the local filesystem.
//! - [`StorageProviders`]: protocol name -> [`StorageTransfer`] lookup used
//!   by the executors.

pub mod local;
pub mod providers;

pub use local::LocalFileStorage;
pub use providers::StorageProviders;
