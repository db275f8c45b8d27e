use anyhow::{bail, Result};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use http::StatusCode;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LoadGenerator;
use crate::config::FloodConfig;

const WRITE_RETRIES: usize = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shared by every flood task.
#[derive(Debug, Default)]
pub struct FloodStats {
    target: usize,
    written: AtomicUsize,
    write_failures: AtomicUsize,
    reads: AtomicUsize,
    read_failures: AtomicUsize,
    watch_events: AtomicUsize,
}

impl FloodStats {
    fn new(target: usize) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> usize {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> usize {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn watch_events(&self) -> usize {
        self.watch_events.load(Ordering::Relaxed)
    }

    /// Every key has been written or given up on.
    pub fn is_settled(&self) -> bool {
        self.written() + self.write_failures() >= self.target
    }

    pub async fn wait_settled(&self) {
        while !self.is_settled() {
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }
}

impl fmt::Display for FloodStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "written {}/{} (failed {}), reads {} (failed {}), watch events {}",
            self.written(),
            self.target,
            self.write_failures(),
            self.reads(),
            self.read_failures(),
            self.watch_events()
        )
    }
}

struct FloodInner {
    client: reqwest::Client,
    watch_client: reqwest::Client,
    endpoints: Vec<String>,
    namespace: String,
    next_key: AtomicUsize,
    stats: Arc<FloodStats>,
}

impl FloodInner {
    fn endpoint(&self, n: usize) -> &str {
        &self.endpoints[n % self.endpoints.len()]
    }

    fn namespace_url(&self, n: usize) -> String {
        format!("{}/v2/keys/{}", self.endpoint(n), self.namespace)
    }

    async fn put(&self, key: usize) -> reqwest::Result<()> {
        let url = format!("{}/{}", self.namespace_url(key), key);
        let value = format!("flood-{key}");
        self.client
            .put(&url)
            .form(&[("value", value.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn write_key(&self, key: usize) {
        let outcome = (|| self.put(key))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(WRITE_RETRY_DELAY)
                    .with_max_times(WRITE_RETRIES),
            )
            .await;
        match outcome {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Writing key {} failed: {}", key, e);
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn read(&self, url: &str) {
        match self.client.get(url).send().await {
            // A key that was not written yet is still a served read.
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::NOT_FOUND =>
            {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
            }
            Ok(response) => {
                debug!("Read of {} answered {}", url, response.status());
                self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Read of {} failed: {}", url, e);
                self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn watch(&self, url: &str) {
        match self.watch_client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                self.stats.watch_events.fetch_add(1, Ordering::Relaxed);
            }
            Ok(response) => debug!("Watch on {} answered {}", url, response.status()),
            Err(e) => debug!("Watch on {} failed: {}", url, e),
        }
    }
}

/// Writes `store_size` keys under the namespace while readers and watchers hammer it.
pub struct HttpFlood {
    inner: Arc<FloodInner>,
    config: FloodConfig,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpFlood {
    pub fn new(endpoints: Vec<String>, namespace: &str, config: &FloodConfig) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("flood needs at least one endpoint");
        }
        if config.concurrency == 0 && config.store_size > 0 {
            bail!(
                "flood needs at least one writer to put {} keys",
                config.store_size
            );
        }
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_max_idle_per_host(config.concurrency)
            .build()?;
        // Watches block until the next change, so they get no request timeout.
        let watch_client = reqwest::Client::builder().no_proxy().build()?;

        Ok(Self {
            inner: Arc::new(FloodInner {
                client,
                watch_client,
                endpoints,
                namespace: namespace.to_string(),
                next_key: AtomicUsize::new(0),
                stats: Arc::new(FloodStats::new(config.store_size)),
            }),
            config: config.clone(),
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn stats(&self) -> Arc<FloodStats> {
        Arc::clone(&self.inner.stats)
    }

    fn spawn_writer(&self, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let store_size = self.config.store_size;
        tokio::spawn(async move {
            loop {
                let key = inner.next_key.fetch_add(1, Ordering::Relaxed);
                if key >= store_size {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.write_key(key) => {}
                }
            }
        })
    }

    fn spawn_heavy_reader(&self, n: usize, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let url = format!("{}?recursive=true", inner.namespace_url(n));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.read(&url) => {}
                }
            }
        })
    }

    fn spawn_light_reader(&self, n: usize, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let store_size = self.config.store_size.max(1);
        tokio::spawn(async move {
            let mut key = n;
            loop {
                let url = format!("{}/{}", inner.namespace_url(key), key % store_size);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.read(&url) => {}
                }
                key = key.wrapping_add(1);
            }
        })
    }

    fn spawn_watcher(&self, n: usize, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let url = format!("{}?wait=true&recursive=true", inner.namespace_url(n));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.watch(&url) => {}
                }
            }
        })
    }
}

#[async_trait]
impl LoadGenerator for HttpFlood {
    async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() || self.cancel_token.is_cancelled() {
            bail!("flood was already started");
        }

        let writers = self.config.concurrency.min(self.config.store_size);
        info!(
            "Flooding {} with {} keys: {} writer(s), {} heavy reader(s), {} light reader(s), {} watcher(s)",
            self.inner.endpoints.join(", "),
            self.config.store_size,
            writers,
            self.config.heavy_readers,
            self.config.light_readers,
            self.config.watchers
        );

        for _ in 0..writers {
            let task = self.spawn_writer(self.cancel_token.child_token());
            self.tasks.push(task);
        }
        for n in 0..self.config.heavy_readers {
            let task = self.spawn_heavy_reader(n, self.cancel_token.child_token());
            self.tasks.push(task);
        }
        for n in 0..self.config.light_readers {
            let task = self.spawn_light_reader(n, self.cancel_token.child_token());
            self.tasks.push(task);
        }
        for n in 0..self.config.watchers {
            let task = self.spawn_watcher(n, self.cancel_token.child_token());
            self.tasks.push(task);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.cancel_token.cancel();
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Flood task ended abnormally: {}", e);
            }
        }
        info!("Flood stopped: {}", self.inner.stats);
    }
}

impl Drop for HttpFlood {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
