use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::{node_name, NodeIndex, ProtocolVersion};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A launched store process owned by the current run.
pub struct NodeHandle {
    pub name: String,
    child: Child,
    exit: Option<ExitStatus>,
    output: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status once the process has been reaped.
    #[cfg(test)]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Forcibly stops the process and waits for it. Calling it again is a no-op.
    pub async fn kill(&mut self) -> ClusterResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        if let Err(e) = self.child.start_kill() {
            // The process may have exited between try_wait and start_kill.
            if e.kind() != ErrorKind::InvalidInput {
                return Err(ClusterError::Kill {
                    name: self.name.clone(),
                    source: e,
                });
            }
        }

        let status = self.child.wait().await.map_err(|e| ClusterError::Kill {
            name: self.name.clone(),
            source: e,
        })?;
        debug!("{} stopped with {}", self.name, status);
        self.exit = Some(status);

        // Grandchildren can keep the pipes open, so output draining is bounded.
        for task in self.output.drain(..) {
            if timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                debug!("{} output still open after exit", self.name);
            }
        }
        Ok(())
    }
}

/// Every process launched during one run. Append-only until teardown drains it.
#[derive(Default)]
pub struct Arena {
    handles: Vec<NodeHandle>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: NodeHandle) -> &mut NodeHandle {
        self.handles.push(handle);
        let last = self.handles.len() - 1;
        &mut self.handles[last]
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.iter()
    }

    #[cfg(test)]
    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut NodeHandle> {
        self.handles.iter_mut().find(|h| h.name == node_name(index))
    }

    /// Kills and reaps every registered process, whatever its state, and empties the arena.
    /// Returns how many handles were drained.
    pub async fn teardown(&mut self) -> usize {
        let handles: Vec<NodeHandle> = self.handles.drain(..).collect();
        let count = handles.len();
        for mut handle in handles {
            if let Err(e) = handle.kill().await {
                warn!("Teardown: {e}");
            }
        }
        if count > 0 {
            info!("Stopped {} etcd process(es)", count);
        }
        count
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        warn!(
            "Arena dropped with {} live handle(s), killing without waiting",
            self.handles.len()
        );
        for handle in &mut self.handles {
            let _ = handle.child.start_kill();
        }
    }
}

/// Starts store processes of one version from one executable.
pub struct Supervisor {
    version: ProtocolVersion,
    executable: PathBuf,
}

impl Supervisor {
    pub fn new(version: ProtocolVersion, executable: impl Into<PathBuf>) -> Self {
        Self {
            version,
            executable: executable.into(),
        }
    }

    /// Spawns node `index` and registers it in `arena`. Nothing is registered on failure.
    pub fn launch<'a>(
        &self,
        arena: &'a mut Arena,
        index: NodeIndex,
        data_dir: &Path,
        client_addr: SocketAddr,
        args: &[String],
    ) -> ClusterResult<&'a mut NodeHandle> {
        let name = node_name(index);
        info!(
            "Launching etcd {} [{}] on {} in {} with args:\n  {}",
            self.version,
            name,
            client_addr,
            data_dir.display(),
            args.join("\n  ")
        );

        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::Launch {
                index,
                version: self.version,
                path: self.executable.clone(),
                source: e,
            })?;

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(forward_output(name.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(forward_output(name.clone(), stderr));
        }

        Ok(arena.register(NodeHandle {
            name,
            child,
            exit: None,
            output,
        }))
    }
}

/// Logs every line of `reader` under the `etcd` target, prefixed with `[tag]`.
pub(crate) fn forward_output<R>(tag: String, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "etcd", "[{}] {}", tag, line),
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] output stream closed: {}", tag, e);
                    break;
                }
            }
        }
    })
}
