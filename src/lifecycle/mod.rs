//! Suite and iteration scoping for flood runs.
//!
//! A suite owns the scratch root and the provisioned binaries. Each iteration starts
//! from an empty scratch root and an empty arena, and is torn down on every exit path.


use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cluster::{Arena, ClusterError, ClusterResult, ProtocolVersion};
use crate::common::fs::{create_private_dir, remove_dir_if_exists, reset_dir};
use crate::flood::LoadGenerator;
use crate::provision::Provisioner;

/// State that lives for a single iteration.
pub struct Iteration {
    data_root: PathBuf,
    arena: Arena,
    flood: Option<Box<dyn LoadGenerator>>,
}

impl Iteration {
    /// Where node data directories go for this iteration.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn arena(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Starts `generator` and keeps it so teardown stops it, even if starting failed halfway.
    pub async fn start_flood(
        &mut self,
        generator: Box<dyn LoadGenerator>,
    ) -> anyhow::Result<()> {
        if self.flood.is_some() {
            anyhow::bail!("a load generator is already running in this iteration");
        }
        self.flood.insert(generator).start().await
    }

    /// Stops the load generator, if one was started. The cluster keeps running.
    pub async fn stop_flood(&mut self) {
        if let Some(mut flood) = self.flood.take() {
            flood.stop().await;
        }
    }

    /// Stops the load generator before killing every launched process.
    pub async fn teardown(&mut self) -> usize {
        self.stop_flood().await;
        self.arena.teardown().await
    }
}

pub struct Suite {
    scratch_root: PathBuf,
    binaries: BTreeMap<ProtocolVersion, PathBuf>,
}

impl Suite {
    /// Creates the scratch root and provisions every etcd release. Any failure is fatal.
    pub async fn setup(
        scratch_root: impl Into<PathBuf>,
        provisioner: &Provisioner,
    ) -> ClusterResult<Self> {
        let scratch_root = scratch_root.into();
        create_private_dir(&scratch_root).map_err(|source| ClusterError::DataDir {
            path: scratch_root.clone(),
            source,
        })?;
        let binaries = provisioner.provision_all().await?.into_iter().collect();
        info!("Suite ready, scratch root {}", scratch_root.display());
        Ok(Self {
            scratch_root,
            binaries,
        })
    }

    #[cfg(test)]
    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn binary(&self, version: ProtocolVersion) -> ClusterResult<&Path> {
        self.binaries
            .get(&version)
            .map(PathBuf::as_path)
            .ok_or_else(|| ClusterError::Setup(format!("etcd {version} was not provisioned")))
    }

    /// Wipes the scratch root and hands out a fresh iteration.
    pub fn begin_iteration(&self) -> ClusterResult<Iteration> {
        reset_dir(&self.scratch_root).map_err(|source| ClusterError::DataDir {
            path: self.scratch_root.clone(),
            source,
        })?;
        Ok(Iteration {
            data_root: self.scratch_root.clone(),
            arena: Arena::new(),
            flood: None,
        })
    }

    /// Runs `body` inside a fresh iteration and tears it down afterwards, whether the
    /// body returned normally, failed or panicked. A panic is resumed after teardown.
    pub async fn run_iteration<T, F>(&self, body: F) -> anyhow::Result<T>
    where
        F: for<'a> FnOnce(&'a mut Iteration) -> BoxFuture<'a, anyhow::Result<T>>,
    {
        let mut iteration = self.begin_iteration()?;
        let outcome = AssertUnwindSafe(body(&mut iteration)).catch_unwind().await;
        let stopped = iteration.teardown().await;
        info!("Iteration torn down, {} process(es) stopped", stopped);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Removes the scratch root.
    pub fn teardown(self) -> ClusterResult<()> {
        remove_dir_if_exists(&self.scratch_root).map_err(|source| {
            warn!("Failed to remove {}", self.scratch_root.display());
            ClusterError::DataDir {
                path: self.scratch_root.clone(),
                source,
            }
        })
    }
}
