//! Cluster orchestration across the three etcd bootstrap conventions.
//!
//! A node is identified by its ordinal index only: every address, name and data
//! directory is derived from it, so no registry of nodes is kept.

pub mod bootstrap;
pub mod error;
pub mod probe;
pub mod scheme;
pub mod supervisor;
pub mod verify;
pub mod version;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bootstrap::{Bootstrapper, Cluster};
pub use error::{ClusterError, ClusterResult};
pub use probe::LivenessProber;
pub use scheme::PortLayout;
pub use supervisor::Arena;
pub use verify::StateVerifier;
pub use version::ProtocolVersion;

pub type NodeIndex = usize;

pub fn node_name(index: NodeIndex) -> String {
    format!("node-{index}")
}

/// What to bring up: a version, a member count and arguments appended to every node.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    version: ProtocolVersion,
    size: usize,
    extra_args: Vec<String>,
}

impl ClusterSpec {
    pub fn new(
        version: ProtocolVersion,
        size: usize,
        extra_args: Vec<String>,
    ) -> ClusterResult<Self> {
        if size == 0 {
            return Err(ClusterError::Setup("cluster size must be at least 1".to_string()));
        }
        Ok(Self {
            version,
            size,
            extra_args,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }
}
