use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Deserializer;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::Level;

use crate::cluster::{PortLayout, ProtocolVersion};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    /// Directory holding one `<version>/` subdirectory per etcd release
    pub etcd_root: String,
    /// Scratch root recreated for every iteration
    pub data_dir: String,
    pub version: ProtocolVersion,
    pub cluster_size: usize,
    /// Appended verbatim to every node's command line
    pub extra_args: Vec<String>,
    pub provision_timeout_secs: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            etcd_root: "etcd".to_string(),
            data_dir: "data-dir".to_string(),
            version: ProtocolVersion::V5,
            cluster_size: 3,
            extra_args: Vec::new(),
            provision_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub deadline_ms: u64,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5000,
            interval_ms: 100,
            request_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub namespace: String,
    pub request_timeout_ms: u64,
    /// How long replicas may lag behind before the key count is judged
    pub settle_timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            namespace: "flood".to_string(),
            request_timeout_ms: 1000,
            settle_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub store_size: usize,
    pub concurrency: usize,
    pub heavy_readers: usize,
    pub light_readers: usize,
    pub watchers: usize,
    pub request_timeout_ms: u64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            store_size: 30_000,
            concurrency: 300,
            heavy_readers: 2,
            light_readers: 50,
            watchers: 0,
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub path: String,
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: "logs".to_string(),
            level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub basic: BasicConfig,
    /// Replaces the version's fixed port layout when present
    pub ports: Option<PortLayout>,
    pub probe: ProbeConfig,
    pub verify: VerifyConfig,
    pub flood: FloodConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Designates very low priority, often extremely verbose, information.
    Trace = 0,
    /// Designates lower priority information.
    Debug = 1,
    /// Designates useful information.
    Info = 2,
    /// Designates hazardous situations.
    Warn = 3,
    /// Designates very serious errors.
    Error = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level_str = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", level_str)
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        LogLevel::from_str(&s.to_lowercase()).map_err(serde::de::Error::custom)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl fmt::Display for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Harness Configuration:")?;
        writeln!(f, "  [Basic]")?;
        writeln!(f, "    etcd Root      : {}", self.basic.etcd_root)?;
        writeln!(f, "    Data Dir       : {}", self.basic.data_dir)?;
        writeln!(f, "    Version        : {}", self.basic.version)?;
        writeln!(f, "    Cluster Size   : {}", self.basic.cluster_size)?;
        if self.basic.extra_args.is_empty() {
            writeln!(f, "    Extra Args     : none")?;
        } else {
            writeln!(f, "    Extra Args     :")?;
            for arg in &self.basic.extra_args {
                writeln!(f, "      - {}", arg)?;
            }
        }
        writeln!(
            f,
            "    Provision Limit: {} s",
            self.basic.provision_timeout_secs
        )?;

        writeln!(f, "\n  [Ports]")?;
        match &self.ports {
            Some(layout) => writeln!(
                f,
                "    Client Base {}, Peer Base {}, Stride {}",
                layout.client_base, layout.peer_base, layout.stride
            )?,
            None => writeln!(f, "    Version default")?,
        }

        writeln!(f, "\n  [Probe]")?;
        writeln!(f, "    Deadline       : {} ms", self.probe.deadline_ms)?;
        writeln!(f, "    Interval       : {} ms", self.probe.interval_ms)?;
        writeln!(
            f,
            "    Request Timeout: {} ms",
            self.probe.request_timeout_ms
        )?;

        writeln!(f, "\n  [Verify]")?;
        writeln!(f, "    Namespace      : {}", self.verify.namespace)?;
        writeln!(
            f,
            "    Request Timeout: {} ms",
            self.verify.request_timeout_ms
        )?;
        writeln!(
            f,
            "    Settle Timeout : {} ms",
            self.verify.settle_timeout_ms
        )?;

        writeln!(f, "\n  [Flood]")?;
        writeln!(f, "    Store Size     : {}", self.flood.store_size)?;
        writeln!(f, "    Concurrency    : {}", self.flood.concurrency)?;
        writeln!(f, "    Heavy Readers  : {}", self.flood.heavy_readers)?;
        writeln!(f, "    Light Readers  : {}", self.flood.light_readers)?;
        writeln!(f, "    Watchers       : {}", self.flood.watchers)?;
        writeln!(
            f,
            "    Request Timeout: {} ms",
            self.flood.request_timeout_ms
        )?;

        writeln!(f, "\n  [Log]")?;
        writeln!(f, "    Path : {}", self.log.path)?;
        write!(f, "    Level: {}", self.log.level)
    }
}

/// Loads the harness configuration. An explicit `path` must exist; otherwise
/// `flood.toml` and `flood.json` are tried before falling back to defaults.
pub async fn read_config(path: Option<&String>) -> Result<HarnessConfig> {
    if let Some(provided_path) = path {
        let provided_path = Path::new(&provided_path);
        if provided_path.exists() {
            return read_config_from_file(provided_path).await;
        } else {
            return Err(anyhow!(
                "Provided configuration file {} does not exist",
                provided_path.display()
            ));
        }
    }

    let toml_path = Path::new("flood.toml");
    let json_path = Path::new("flood.json");

    if toml_path.exists() {
        read_config_from_file(toml_path).await
    } else if json_path.exists() {
        read_config_from_file(json_path).await
    } else {
        Ok(HarnessConfig::default())
    }
}

async fn read_config_from_file<P: AsRef<Path>>(path: P) -> Result<HarnessConfig> {
    let contents = tokio::fs::read_to_string(&path).await?;

    match path.as_ref().extension().and_then(|ext| ext.to_str()) {
        Some("toml") => {
            let config: HarnessConfig = toml::from_str(&contents)?;
            Ok(config)
        }
        Some("json") => {
            let config: HarnessConfig = serde_json::from_str(&contents)?;
            Ok(config)
        }
        _ => Err(anyhow!("Unsupported file format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.basic.version, ProtocolVersion::V5);
        assert_eq!(config.basic.cluster_size, 3);
        assert_eq!(config.flood.store_size, 30_000);
        assert_eq!(config.flood.concurrency, 300);
        assert_eq!(config.flood.heavy_readers, 2);
        assert_eq!(config.flood.light_readers, 50);
        assert_eq!(config.flood.watchers, 0);
        assert_eq!(config.probe.deadline_ms, 5000);
        assert_eq!(config.verify.namespace, "flood");
        assert!(config.ports.is_none());
    }

    #[tokio::test]
    async fn test_partial_toml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flood.toml");
        std::fs::write(
            &path,
            r#"
[basic]
version = "v0.3"
cluster_size = 5
extra_args = ["-snapshot=true"]

[ports]
client_base = 14001
peer_base = 17001
stride = 1

[log]
level = "DEBUG"
"#,
        )
        .unwrap();

        let config = read_config(Some(&path.to_string_lossy().into_owned()))
            .await
            .unwrap();
        assert_eq!(config.basic.version, ProtocolVersion::V3);
        assert_eq!(config.basic.cluster_size, 5);
        assert_eq!(config.basic.extra_args, vec!["-snapshot=true"]);
        assert_eq!(config.basic.etcd_root, "etcd");
        assert_eq!(
            config.ports,
            Some(PortLayout {
                client_base: 14001,
                peer_base: 17001,
                stride: 1
            })
        );
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.flood.store_size, 30_000);
    }

    #[tokio::test]
    async fn test_json_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flood.json");
        std::fs::write(
            &path,
            r#"{"flood": {"store_size": 10, "watchers": 4}, "verify": {"namespace": "bench"}}"#,
        )
        .unwrap();

        let config = read_config(Some(&path.to_string_lossy().into_owned()))
            .await
            .unwrap();
        assert_eq!(config.flood.store_size, 10);
        assert_eq!(config.flood.watchers, 4);
        assert_eq!(config.verify.namespace, "bench");
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flood.toml");
        std::fs::write(&path, "[basic]\nversion = \"v0.6\"\n").unwrap();

        let err = read_config(Some(&path.to_string_lossy().into_owned()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("v0.6"), "{err:#}");
    }

    #[tokio::test]
    async fn test_missing_explicit_path_is_an_error() {
        let missing = "/nonexistent/flood.toml".to_string();
        assert!(read_config(Some(&missing)).await.is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(Level::from(&LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_display_mentions_every_section() {
        let rendered = HarnessConfig::default().to_string();
        for section in ["[Basic]", "[Ports]", "[Probe]", "[Verify]", "[Flood]", "[Log]"] {
            assert!(rendered.contains(section), "missing {section}");
        }
    }
}
