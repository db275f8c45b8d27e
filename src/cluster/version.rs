use serde::Deserialize;
use serde::Deserializer;
use std::fmt;
use std::str::FromStr;

use super::scheme::{LegacyScheme, MembershipScheme, PortLayout, VersionScheme};

/// An etcd release with its own bootstrap contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3,
    V46,
    V5,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 3] = [
        ProtocolVersion::V3,
        ProtocolVersion::V46,
        ProtocolVersion::V5,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ProtocolVersion::V3 => "v0.3",
            ProtocolVersion::V46 => "v0.4.6",
            ProtocolVersion::V5 => "v0.5",
        }
    }

    /// Default listening ranges of the release.
    pub fn default_layout(self) -> PortLayout {
        match self {
            ProtocolVersion::V3 | ProtocolVersion::V46 => PortLayout {
                client_base: 4001,
                peer_base: 7001,
                stride: 1,
            },
            ProtocolVersion::V5 => PortLayout {
                client_base: 2379,
                peer_base: 2380,
                stride: 10,
            },
        }
    }

    pub fn scheme(self, layout: Option<PortLayout>) -> Box<dyn VersionScheme> {
        let layout = layout.unwrap_or_else(|| self.default_layout());
        match self {
            ProtocolVersion::V3 | ProtocolVersion::V46 => Box::new(LegacyScheme::new(self, layout)),
            ProtocolVersion::V5 => Box::new(MembershipScheme::new(layout)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "v0.3" => Ok(ProtocolVersion::V3),
            "v0.4.6" => Ok(ProtocolVersion::V46),
            "v0.5" => Ok(ProtocolVersion::V5),
            other => Err(format!(
                "Unsupported etcd version: {other} (expected one of v0.3, v0.4.6, v0.5)"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ProtocolVersion::from_str(&s).map_err(serde::de::Error::custom)
    }
}
