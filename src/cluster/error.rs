use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::{NodeIndex, ProtocolVersion};

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Harness preconditions that make the whole run pointless
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Setup failed: cannot prepare data directory {path}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be started at all
    #[error("Failed to launch etcd {version} node-{index} from {path}")]
    Launch {
        index: NodeIndex,
        version: ProtocolVersion,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process started but its status endpoint never answered
    #[error("etcd {version} node-{index} at {addr} never became live: {source}")]
    NeverLive {
        index: NodeIndex,
        version: ProtocolVersion,
        addr: SocketAddr,
        #[source]
        source: ProbeError,
    },

    #[error("Failed to stop {name}")]
    Kill {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no successful status response from {addr} within {deadline:?} (last: {last})")]
    Timeout {
        addr: SocketAddr,
        deadline: Duration,
        last: String,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: http::StatusCode },

    #[error("Failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Response from {url} has no root node")]
    MissingNode { url: String },

    #[error("Root node {key:?} returned by {url} is not a directory")]
    NotDirectory { url: String, key: Option<String> },
}
