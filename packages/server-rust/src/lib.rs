//! `nodekeeper` server: operation engine, built-in node-maintenance executors,
//! and the HTTP control surface in front of them.

pub mod management;
pub mod network;
pub mod service;
pub mod storage;
pub mod traits;

pub use traits::{NodeManagement, StorageTransfer};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
