use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cluster::supervisor::forward_output;
use crate::cluster::{ClusterError, ClusterResult, ProtocolVersion};
use crate::config::HarnessConfig;

const DOWNLOAD_SCRIPT: &str = "download.sh";
const EXECUTABLE: &str = "etcd";

/// Makes sure every etcd release has an executable under `<etcd_root>/<version>/etcd`.
#[derive(Debug, Clone)]
pub struct Provisioner {
    etcd_root: PathBuf,
    timeout: Duration,
    download: bool,
}

impl Provisioner {
    pub fn new(etcd_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            etcd_root: etcd_root.into(),
            timeout,
            download: true,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            &config.basic.etcd_root,
            Duration::from_secs(config.basic.provision_timeout_secs),
        )
    }

    /// Only checks for the executables, without running the download scripts.
    pub fn skip_download(mut self, skip: bool) -> Self {
        self.download = !skip;
        self
    }

    pub fn version_dir(&self, version: ProtocolVersion) -> ClusterResult<PathBuf> {
        std::path::absolute(self.etcd_root.join(version.tag())).map_err(|e| {
            ClusterError::Setup(format!(
                "cannot resolve the directory of etcd {}: {}",
                version, e
            ))
        })
    }

    /// Runs the release's download script, if any, and returns the executable path.
    pub async fn provision(&self, version: ProtocolVersion) -> ClusterResult<PathBuf> {
        let dir = self.version_dir(version)?;
        if self.download {
            self.download(version, &dir).await?;
        }
        let executable = dir.join(EXECUTABLE);
        check_executable(version, &executable)?;
        info!("etcd {} is available at {}", version, executable.display());
        Ok(executable)
    }

    pub async fn provision_all(&self) -> ClusterResult<Vec<(ProtocolVersion, PathBuf)>> {
        let mut binaries = Vec::with_capacity(ProtocolVersion::ALL.len());
        for version in ProtocolVersion::ALL {
            binaries.push((version, self.provision(version).await?));
        }
        Ok(binaries)
    }

    async fn download(&self, version: ProtocolVersion, dir: &Path) -> ClusterResult<()> {
        let script = dir.join(DOWNLOAD_SCRIPT);
        if !script.is_file() {
            debug!("No {} for etcd {}", script.display(), version);
            return Ok(());
        }

        info!("Provisioning etcd {} with {}", version, script.display());
        let mut child = Command::new(&script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClusterError::Setup(format!("failed to run {}: {}", script.display(), e))
            })?;

        let tag = format!("download {version}");
        if let Some(stdout) = child.stdout.take() {
            forward_output(tag.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(tag, stderr);
        }

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ClusterError::Setup(format!(
                    "failed to wait for {}: {}",
                    script.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(ClusterError::Setup(format!(
                    "{} did not finish within {:?}",
                    script.display(),
                    self.timeout
                )))
            }
        };

        if !status.success() {
            return Err(ClusterError::Setup(format!(
                "{} for etcd {} exited with {}",
                DOWNLOAD_SCRIPT, version, status
            )));
        }
        Ok(())
    }
}

fn check_executable(version: ProtocolVersion, path: &Path) -> ClusterResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ClusterError::Setup(format!(
            "etcd {} binary {} is missing: {}",
            version,
            path.display(),
            e
        ))
    })?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(ClusterError::Setup(format!(
            "etcd {} binary {} is not executable",
            version,
            path.display()
        )));
    }
    Ok(())
}
