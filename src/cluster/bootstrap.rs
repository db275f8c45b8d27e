use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::error::{ClusterError, ClusterResult};
use super::probe::LivenessProber;
use super::scheme::VersionScheme;
use super::supervisor::{Arena, Supervisor};
use super::{node_name, ClusterSpec, NodeIndex, ProtocolVersion};
use crate::common::fs::create_private_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    Planning,
    Launching(NodeIndex),
    AwaitingLiveness(NodeIndex),
    Ready,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Idle => f.write_str("Idle"),
            BootstrapState::Planning => f.write_str("Planning"),
            BootstrapState::Launching(i) => write!(f, "Launching(node-{i})"),
            BootstrapState::AwaitingLiveness(i) => write!(f, "AwaitingLiveness(node-{i})"),
            BootstrapState::Ready => f.write_str("Ready"),
            BootstrapState::Failed => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub index: NodeIndex,
    pub name: String,
    pub client_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub args: Vec<String>,
}

/// A cluster whose members all answered their liveness probe.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub version: ProtocolVersion,
    pub nodes: Vec<NodeInfo>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn client_urls(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| format!("http://{}", n.client_addr))
            .collect()
    }
}

/// Brings up a cluster one node at a time, gating each launch on its liveness probe.
pub struct Bootstrapper {
    scheme: Box<dyn VersionScheme>,
    supervisor: Supervisor,
    prober: LivenessProber,
    data_root: PathBuf,
    state: BootstrapState,
}

impl Bootstrapper {
    pub fn new(
        scheme: Box<dyn VersionScheme>,
        executable: impl Into<PathBuf>,
        prober: LivenessProber,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        let supervisor = Supervisor::new(scheme.version(), executable);
        Self {
            scheme,
            supervisor,
            prober,
            data_root: data_root.into(),
            state: BootstrapState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn data_dir(&self, index: NodeIndex) -> PathBuf {
        self.data_root.join(node_name(index))
    }

    /// Launches every node of `spec` into `arena`. On failure the nodes launched so far stay
    /// in `arena`; tearing them down is up to the caller.
    pub async fn bootstrap(
        &mut self,
        arena: &mut Arena,
        spec: &ClusterSpec,
    ) -> ClusterResult<Cluster> {
        let result = self.run(arena, spec).await;
        match &result {
            Ok(cluster) => {
                self.transition(BootstrapState::Ready);
                info!(
                    "etcd {} cluster of {} node(s) is ready: {}",
                    cluster.version,
                    cluster.size(),
                    cluster.client_urls().join(", ")
                );
            }
            Err(e) => {
                self.transition(BootstrapState::Failed);
                error!("Bootstrap of etcd {} failed: {}", spec.version(), e);
            }
        }
        result
    }

    async fn run(&mut self, arena: &mut Arena, spec: &ClusterSpec) -> ClusterResult<Cluster> {
        self.transition(BootstrapState::Planning);
        let plan = self.plan(spec)?;

        for node in &plan {
            self.transition(BootstrapState::Launching(node.index));
            debug!(
                "Launching {} with client {} and peer {}",
                node.name, node.client_addr, node.peer_addr
            );
            self.supervisor
                .launch(arena, node.index, &node.data_dir, node.client_addr, &node.args)?;

            self.transition(BootstrapState::AwaitingLiveness(node.index));
            let elapsed = self
                .prober
                .wait_live(node.client_addr)
                .await
                .map_err(|source| ClusterError::NeverLive {
                    index: node.index,
                    version: spec.version(),
                    addr: node.client_addr,
                    source,
                })?;
            info!("{} is live at {} after {:?}", node.name, node.client_addr, elapsed);
        }

        Ok(Cluster {
            version: spec.version(),
            nodes: plan,
        })
    }

    fn plan(&self, spec: &ClusterSpec) -> ClusterResult<Vec<NodeInfo>> {
        if spec.version() != self.scheme.version() {
            return Err(ClusterError::Setup(format!(
                "cluster spec asks for etcd {} but the bootstrapper drives {}",
                spec.version(),
                self.scheme.version()
            )));
        }
        self.scheme.layout().check(spec.size())?;

        (0..spec.size())
            .map(|index| {
                let data_dir = self.data_dir(index);
                create_node_dir(&data_dir)?;
                Ok(NodeInfo {
                    index,
                    name: node_name(index),
                    client_addr: self.scheme.client_addr(index)?,
                    peer_addr: self.scheme.peer_addr(index)?,
                    args: self.scheme.launch_args(index, spec, &data_dir)?,
                    data_dir,
                })
            })
            .collect()
    }

    fn transition(&mut self, next: BootstrapState) {
        info!("Bootstrap {} -> {}", self.state, next);
        self.state = next;
    }
}

fn create_node_dir(path: &Path) -> ClusterResult<()> {
    create_private_dir(path).map_err(|source| ClusterError::DataDir {
        path: path.to_path_buf(),
        source,
    })
}
