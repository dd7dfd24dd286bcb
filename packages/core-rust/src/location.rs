//! Remote backup location descriptors.
//!
//! A location has the form `protocol://bucket/cluster/datacenter/node`. The
//! bucket may itself contain slashes (for the `file` protocol it is a local
//! directory), so the last three path segments are always read as
//! cluster, datacenter and node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Parsed remote storage location of one node's backups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub protocol: String,
    pub bucket: String,
    pub cluster: String,
    pub datacenter: String,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("location '{0}' is missing a protocol (expected protocol://bucket/cluster/dc/node)")]
    MissingProtocol(String),
    #[error("location '{0}' must have the form protocol://bucket/cluster/dc/node")]
    MissingSegments(String),
}

impl RemoteLocation {
    /// Storage key of `relative` under this node's prefix.
    #[must_use]
    pub fn key(&self, relative: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.cluster,
            self.datacenter,
            self.node,
            relative.trim_start_matches('/')
        )
    }
}

impl FromStr for RemoteLocation {
    type Err = LocationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = raw
            .split_once("://")
            .filter(|(protocol, _)| !protocol.is_empty())
            .ok_or_else(|| LocationError::MissingProtocol(raw.to_string()))?;

        let mut segments = rest.trim_end_matches('/').rsplitn(4, '/');
        let mut next = || {
            segments
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| LocationError::MissingSegments(raw.to_string()))
        };
        let node = next()?;
        let datacenter = next()?;
        let cluster = next()?;
        let bucket = next()?;

        Ok(Self {
            protocol: protocol.to_ascii_lowercase(),
            bucket,
            cluster,
            datacenter,
            node,
        })
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}/{}",
            self.protocol, self.bucket, self.cluster, self.datacenter, self.node
        )
    }
}
