use anyhow::{anyhow, bail, Result};
use backon::{ConstantBuilder, Retryable};
use clap::Parser;
use clap::ValueEnum;
use common::log::{init_tracing, log_app_config, log_build_information};
use futures::FutureExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::{env, sync::Arc, time::Duration};

use cluster::{
    Bootstrapper, Cluster, ClusterSpec, LivenessProber, ProtocolVersion, StateVerifier,
};
use config::{read_config, HarnessConfig};
use flood::HttpFlood;
use lifecycle::{Iteration, Suite};
use provision::Provisioner;
use tracing::{error, info, warn};

mod cluster;
mod common;
mod config;
mod flood;
mod lifecycle;
mod provision;

const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "etcd-flood",
    about = "Floods an etcd cluster and checks that it keeps every key",
    disable_version_flag = true
)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Flood)]
    mode: Mode,

    /// etcd release to test: v0.3, v0.4.6 or v0.5
    #[arg(long)]
    version: Option<ProtocolVersion>,

    /// Number of cluster members
    #[arg(long)]
    nodes: Option<usize>,

    /// Total number of keys to put in the store
    #[arg(long)]
    store_size: Option<usize>,

    /// Number of concurrent writers
    #[arg(long)]
    concurrency: Option<usize>,

    /// Readers fetching the whole namespace at once
    #[arg(long)]
    heavy_readers: Option<usize>,

    /// Readers fetching one key at a time
    #[arg(long)]
    light_readers: Option<usize>,

    #[arg(long)]
    watchers: Option<usize>,

    /// Use the binaries already under the etcd root without running download.sh
    #[arg(long)]
    skip_provision: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
enum Mode {
    Flood,
    Bootstrap,
    Provision,
}

impl Cli {
    fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(version) = self.version {
            config.basic.version = version;
        }
        if let Some(nodes) = self.nodes {
            config.basic.cluster_size = nodes;
        }
        if let Some(store_size) = self.store_size {
            config.flood.store_size = store_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.flood.concurrency = concurrency;
        }
        if let Some(heavy_readers) = self.heavy_readers {
            config.flood.heavy_readers = heavy_readers;
        }
        if let Some(light_readers) = self.light_readers {
            config.flood.light_readers = light_readers;
        }
        if let Some(watchers) = self.watchers {
            config.flood.watchers = watchers;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_config = env::var("FLOOD_CONFIG").ok();
    let config_path: Option<&String> = cli.config.as_ref().or(env_config.as_ref());

    let mut harness_config = read_config(config_path)
        .await
        .unwrap_or_else(|e| panic!("Failed to load config file: {}", e));
    cli.apply_overrides(&mut harness_config);
    let harness_config = Arc::new(harness_config);

    let _guards = init_tracing(
        &harness_config.log.path,
        (&harness_config.log.level).into(),
    );

    log_build_information();
    log_app_config(&harness_config);

    let provisioner =
        Provisioner::from_config(&harness_config).skip_download(cli.skip_provision);
    let result: Result<()> = match cli.mode {
        Mode::Provision => provisioner
            .provision_all()
            .await
            .map(|_| ())
            .map_err(Into::into),
        Mode::Bootstrap => run_suite(&provisioner, Arc::clone(&harness_config), false).await,
        Mode::Flood => run_suite(&provisioner, Arc::clone(&harness_config), true).await,
    };

    match result {
        Ok(()) => {
            info!("{:?} finished successfully", cli.mode);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:?} failed: {:#}", cli.mode, e);
            ExitCode::FAILURE
        }
    }
}

async fn run_suite(
    provisioner: &Provisioner,
    config: Arc<HarnessConfig>,
    with_flood: bool,
) -> Result<()> {
    let suite = Suite::setup(&config.basic.data_dir, provisioner).await?;
    let binary = suite.binary(config.basic.version)?.to_path_buf();

    let result = suite
        .run_iteration(|iteration| {
            async move {
                let cluster = bring_up(iteration, &config, binary).await?;
                if with_flood {
                    flood_and_verify(iteration, &config, &cluster).await
                } else {
                    info!("Cluster is up, press Ctrl+C to tear it down");
                    tokio::signal::ctrl_c().await?;
                    Ok(())
                }
            }
            .boxed()
        })
        .await;

    if let Err(e) = suite.teardown() {
        warn!("Suite teardown: {}", e);
    }
    result
}

async fn bring_up(
    iteration: &mut Iteration,
    config: &HarnessConfig,
    binary: PathBuf,
) -> Result<Cluster> {
    let version = config.basic.version;
    let spec = ClusterSpec::new(
        version,
        config.basic.cluster_size,
        config.basic.extra_args.clone(),
    )?;
    let mut bootstrapper = Bootstrapper::new(
        version.scheme(config.ports),
        binary,
        LivenessProber::from_config(&config.probe)?,
        iteration.data_root(),
    );
    Ok(bootstrapper.bootstrap(iteration.arena(), &spec).await?)
}

async fn flood_and_verify(
    iteration: &mut Iteration,
    config: &HarnessConfig,
    cluster: &Cluster,
) -> Result<()> {
    let store_size = config.flood.store_size;
    let generator = HttpFlood::new(
        cluster.client_urls(),
        &config.verify.namespace,
        &config.flood,
    )?;
    let stats = generator.stats();
    iteration.start_flood(Box::new(generator)).await?;

    tokio::select! {
        _ = stats.wait_settled() => {}
        _ = tokio::signal::ctrl_c() => bail!("interrupted while flooding: {}", stats),
    }
    iteration.stop_flood().await;
    if stats.write_failures() > 0 {
        bail!("{} of {} writes failed", stats.write_failures(), store_size);
    }

    let verifier = StateVerifier::from_config(&config.verify)?;
    let attempts = (config.verify.settle_timeout_ms / VERIFY_POLL_INTERVAL.as_millis() as u64)
        .max(1) as usize;
    let counts = (|| async {
        let counts = verifier.keys_on_cluster(cluster).await?;
        if counts.iter().all(|&count| count == store_size) {
            Ok(counts)
        } else {
            Err(anyhow!(
                "expected {} keys under /{} on every node, found {:?}",
                store_size,
                verifier.namespace(),
                counts
            ))
        }
    })
    .retry(
        ConstantBuilder::default()
            .with_delay(VERIFY_POLL_INTERVAL)
            .with_max_times(attempts),
    )
    .notify(|err: &anyhow::Error, _| info!("Waiting for replicas to settle: {:#}", err))
    .await?;

    info!(
        "etcd {} kept all {} keys on {} node(s): {:?}",
        cluster.version,
        store_size,
        cluster.size(),
        counts
    );
    Ok(())
}
