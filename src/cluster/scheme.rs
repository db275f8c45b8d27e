use itertools::Itertools;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use super::error::{ClusterError, ClusterResult};
use super::{node_name, ClusterSpec, NodeIndex, ProtocolVersion};

const LEGACY_HEARTBEAT_TIMEOUT_MS: u64 = 50;
const LEGACY_ELECTION_TIMEOUT_MS: u64 = 1000;

/// Base ports and per-node stride of a cluster laid out on the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortLayout {
    pub client_base: u16,
    pub peer_base: u16,
    pub stride: u16,
}

impl PortLayout {
    pub fn client_addr(&self, index: NodeIndex) -> ClusterResult<SocketAddr> {
        self.port(self.client_base, index).map(loopback)
    }

    pub fn peer_addr(&self, index: NodeIndex) -> ClusterResult<SocketAddr> {
        self.port(self.peer_base, index).map(loopback)
    }

    fn port(&self, base: u16, index: NodeIndex) -> ClusterResult<u16> {
        index
            .checked_mul(self.stride as usize)
            .and_then(|offset| offset.checked_add(base as usize))
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| {
                ClusterError::Setup(format!(
                    "port of node-{index} (base {base}, stride {}) is outside the port range",
                    self.stride
                ))
            })
    }

    /// Checks that `cluster_size` nodes get distinct ports inside the u16 range.
    pub fn check(&self, cluster_size: usize) -> ClusterResult<()> {
        if self.stride == 0 {
            return Err(ClusterError::Setup(
                "port stride must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(cluster_size * 2);
        for index in 0..cluster_size {
            for addr in [self.client_addr(index)?, self.peer_addr(index)?] {
                if !seen.insert(addr.port()) {
                    return Err(ClusterError::Setup(format!(
                        "port {} is assigned twice",
                        addr.port()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Addressing and command line conventions of one etcd release.
pub trait VersionScheme: Send + Sync {
    fn version(&self) -> ProtocolVersion;

    fn layout(&self) -> PortLayout;

    fn client_addr(&self, index: NodeIndex) -> ClusterResult<SocketAddr> {
        self.layout().client_addr(index)
    }

    fn peer_addr(&self, index: NodeIndex) -> ClusterResult<SocketAddr> {
        self.layout().peer_addr(index)
    }

    /// Arguments that make `index` join a fresh cluster of `cluster_size` nodes.
    fn bootstrap_args(
        &self,
        index: NodeIndex,
        cluster_size: usize,
        data_dir: &Path,
    ) -> ClusterResult<Vec<String>>;

    /// Bootstrap arguments followed by the caller's extra arguments.
    fn launch_args(
        &self,
        index: NodeIndex,
        spec: &ClusterSpec,
        data_dir: &Path,
    ) -> ClusterResult<Vec<String>> {
        let mut args = self.bootstrap_args(index, spec.size(), data_dir)?;
        args.extend(spec.extra_args().iter().cloned());
        Ok(args)
    }
}

/// Flat peer list discovery used by v0.3 and v0.4.6.
pub struct LegacyScheme {
    version: ProtocolVersion,
    layout: PortLayout,
}

impl LegacyScheme {
    pub fn new(version: ProtocolVersion, layout: PortLayout) -> Self {
        Self { version, layout }
    }
}

impl VersionScheme for LegacyScheme {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn layout(&self) -> PortLayout {
        self.layout
    }

    fn bootstrap_args(
        &self,
        index: NodeIndex,
        cluster_size: usize,
        data_dir: &Path,
    ) -> ClusterResult<Vec<String>> {
        let mut args = vec![
            format!("-name={}", node_name(index)),
            format!("-addr={}", self.client_addr(index)?),
            format!("-peer-addr={}", self.peer_addr(index)?),
            format!("-data-dir={}", data_dir.display()),
            format!("-peer-heartbeat-timeout={LEGACY_HEARTBEAT_TIMEOUT_MS}"),
            format!("-peer-election-timeout={LEGACY_ELECTION_TIMEOUT_MS}"),
        ];

        // Node 0 seeds the cluster and is never handed a peer list.
        if index > 0 && cluster_size > 1 {
            let peers: Vec<SocketAddr> = (0..cluster_size)
                .filter(|&i| i != index)
                .map(|i| self.peer_addr(i))
                .collect::<ClusterResult<_>>()?;
            args.push(format!("-peers={}", peers.iter().join(",")));
        }

        Ok(args)
    }
}

/// Static membership descriptor used from v0.5 on.
pub struct MembershipScheme {
    layout: PortLayout,
}

impl MembershipScheme {
    pub fn new(layout: PortLayout) -> Self {
        Self { layout }
    }

    fn initial_cluster(&self, cluster_size: usize) -> ClusterResult<String> {
        let members: Vec<String> = (0..cluster_size)
            .map(|i| Ok(format!("{}=http://{}", node_name(i), self.peer_addr(i)?)))
            .collect::<ClusterResult<_>>()?;
        Ok(members.join(","))
    }
}

impl VersionScheme for MembershipScheme {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V5
    }

    fn layout(&self) -> PortLayout {
        self.layout
    }

    fn bootstrap_args(
        &self,
        index: NodeIndex,
        cluster_size: usize,
        data_dir: &Path,
    ) -> ClusterResult<Vec<String>> {
        let client = self.client_addr(index)?;
        let peer = self.peer_addr(index)?;
        Ok(vec![
            format!("-name={}", node_name(index)),
            format!("-advertise-client-urls=http://{client}"),
            format!("-listen-client-urls=http://{client}"),
            format!("-listen-peer-urls=http://{peer}"),
            format!("-initial-advertise-peer-urls=http://{peer}"),
            format!("-initial-cluster={}", self.initial_cluster(cluster_size)?),
            format!("-data-dir={}", data_dir.display()),
            "-initial-cluster-state=new".to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MAX_CLUSTER: usize = 7;

    fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let prefix = format!("{flag}=");
        args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    fn data_dir(index: NodeIndex) -> PathBuf {
        PathBuf::from("./data-dir").join(node_name(index))
    }

    #[test]
    fn test_addresses_are_distinct_within_a_cluster() {
        for version in ProtocolVersion::ALL {
            let scheme = version.scheme(None);
            for size in 1..=MAX_CLUSTER {
                let mut seen = HashSet::new();
                for index in 0..size {
                    assert!(seen.insert(scheme.client_addr(index).unwrap()), "{version} size {size}");
                    assert!(seen.insert(scheme.peer_addr(index).unwrap()), "{version} size {size}");
                }
                assert!(scheme.layout().check(size).is_ok());
            }
        }
    }

    #[test]
    fn test_default_addresses() {
        let legacy = ProtocolVersion::V3.scheme(None);
        assert_eq!(legacy.client_addr(2).unwrap().to_string(), "127.0.0.1:4003");
        assert_eq!(legacy.peer_addr(2).unwrap().to_string(), "127.0.0.1:7003");

        let newest = ProtocolVersion::V5.scheme(None);
        assert_eq!(newest.client_addr(1).unwrap().to_string(), "127.0.0.1:2389");
        assert_eq!(newest.peer_addr(1).unwrap().to_string(), "127.0.0.1:2390");
    }

    #[test]
    fn test_single_node_references_no_other_peer() {
        for version in [ProtocolVersion::V3, ProtocolVersion::V46] {
            let args = version.scheme(None).bootstrap_args(0, 1, &data_dir(0)).unwrap();
            assert!(arg_value(&args, "-peers").is_none());
        }

        let scheme = ProtocolVersion::V5.scheme(None);
        let args = scheme.bootstrap_args(0, 1, &data_dir(0)).unwrap();
        assert_eq!(
            arg_value(&args, "-initial-cluster"),
            Some("node-0=http://127.0.0.1:2380")
        );
    }

    #[test]
    fn test_legacy_peers_list_every_other_node() {
        for version in [ProtocolVersion::V3, ProtocolVersion::V46] {
            let scheme = version.scheme(None);
            for size in 2..=MAX_CLUSTER {
                let first = scheme.bootstrap_args(0, size, &data_dir(0)).unwrap();
                assert!(arg_value(&first, "-peers").is_none());

                for index in 1..size {
                    let args = scheme.bootstrap_args(index, size, &data_dir(index)).unwrap();
                    let peers: Vec<&str> = arg_value(&args, "-peers").unwrap().split(',').collect();
                    assert_eq!(peers.len(), size - 1);
                    let own = scheme.peer_addr(index).unwrap().to_string();
                    assert!(!peers.contains(&own.as_str()));
                    for other in (0..size).filter(|&i| i != index) {
                        assert!(peers.contains(&scheme.peer_addr(other).unwrap().to_string().as_str()));
                    }
                }
            }
        }
    }

    #[test]
    fn test_membership_descriptor_is_identical_on_every_node() {
        let scheme = ProtocolVersion::V5.scheme(None);
        for size in 1..=MAX_CLUSTER {
            let descriptors: Vec<String> = (0..size)
                .map(|index| {
                    let args = scheme.bootstrap_args(index, size, &data_dir(index)).unwrap();
                    arg_value(&args, "-initial-cluster").unwrap().to_string()
                })
                .collect();
            assert!(descriptors.iter().all(|d| d == &descriptors[0]));
            let entries: Vec<&str> = descriptors[0].split(',').collect();
            assert_eq!(entries.len(), size);
            for (index, entry) in entries.iter().enumerate() {
                assert_eq!(
                    *entry,
                    format!("node-{index}=http://{}", scheme.peer_addr(index).unwrap())
                );
            }
        }
    }

    #[test]
    fn test_legacy_args_layout() {
        let scheme = ProtocolVersion::V46.scheme(None);
        let args = scheme.bootstrap_args(1, 3, Path::new("data-dir/node-1")).unwrap();
        assert_eq!(
            args,
            vec![
                "-name=node-1",
                "-addr=127.0.0.1:4002",
                "-peer-addr=127.0.0.1:7002",
                "-data-dir=data-dir/node-1",
                "-peer-heartbeat-timeout=50",
                "-peer-election-timeout=1000",
                "-peers=127.0.0.1:7001,127.0.0.1:7003",
            ]
        );
    }

    #[test]
    fn test_membership_args_layout() {
        let scheme = ProtocolVersion::V5.scheme(None);
        let args = scheme.bootstrap_args(0, 2, Path::new("data-dir/node-0")).unwrap();
        assert_eq!(
            args,
            vec![
                "-name=node-0",
                "-advertise-client-urls=http://127.0.0.1:2379",
                "-listen-client-urls=http://127.0.0.1:2379",
                "-listen-peer-urls=http://127.0.0.1:2380",
                "-initial-advertise-peer-urls=http://127.0.0.1:2380",
                "-initial-cluster=node-0=http://127.0.0.1:2380,node-1=http://127.0.0.1:2390",
                "-data-dir=data-dir/node-0",
                "-initial-cluster-state=new",
            ]
        );
    }

    #[test]
    fn test_extra_args_come_last() {
        let spec = ClusterSpec::new(
            ProtocolVersion::V3,
            2,
            vec!["-snapshot=true".to_string(), "-name=override".to_string()],
        )
        .unwrap();
        let scheme = spec.version().scheme(None);
        let args = scheme.launch_args(1, &spec, &data_dir(1)).unwrap();
        let n = args.len();
        assert_eq!(args[n - 2], "-snapshot=true");
        assert_eq!(args[n - 1], "-name=override");
        assert_eq!(args[0], "-name=node-1");
    }

    #[test]
    fn test_layout_check_rejects_collisions() {
        let overlapping = PortLayout {
            client_base: 5000,
            peer_base: 5002,
            stride: 1,
        };
        assert!(overlapping.check(2).is_ok());
        assert!(overlapping.check(3).is_err());

        let zero = PortLayout {
            client_base: 5000,
            peer_base: 6000,
            stride: 0,
        };
        assert!(zero.check(1).is_err());

        let overflow = PortLayout {
            client_base: 65530,
            peer_base: 1000,
            stride: 10,
        };
        assert!(overflow.check(2).is_err());
    }

    #[test]
    fn test_out_of_range_port_is_a_setup_error() {
        let layout = PortLayout {
            client_base: 65530,
            peer_base: 1000,
            stride: 10,
        };
        assert_eq!(layout.client_addr(0).unwrap().port(), 65530);
        let err = layout.client_addr(1).unwrap_err();
        assert!(
            matches!(&err, ClusterError::Setup(msg) if msg.contains("node-1")),
            "{err}"
        );

        let scheme = ProtocolVersion::V5.scheme(Some(layout));
        assert!(scheme.bootstrap_args(0, 1, &data_dir(0)).is_ok());
        assert!(scheme.bootstrap_args(1, 2, &data_dir(1)).is_err());
    }
}
