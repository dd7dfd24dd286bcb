//! Management channel to the local database node.

pub mod http;

#[cfg(test)]
pub mod fake;

use std::path::PathBuf;
use std::time::Duration;

pub use http::HttpManagementClient;

/// Where and how to reach the node's management API.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Base URL, e.g. `https://127.0.0.1:8080/api/v0/ops`.
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Mutual TLS material; `None` means plain HTTP or server-verified TLS only.
    pub tls: Option<ManagementTls>,
    pub connect_timeout: Duration,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8080/api/v0/ops".to_string(),
            username: None,
            password: None,
            tls: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// PEM files for mutual TLS with the management API.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct ManagementTls {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_defaults() {
        let info = ConnectionInfo::default();
        assert!(info.address.starts_with("http://127.0.0.1"));
        assert!(info.username.is_none());
        assert!(info.tls.is_none());
        assert_eq!(info.connect_timeout, Duration::from_secs(10));
    }
}
