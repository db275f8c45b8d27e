use backon::{ConstantBuilder, Retryable};
use http::StatusCode;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::ProbeError;
use crate::config::ProbeConfig;

/// Polls a node's status endpoint until it answers 200 or the deadline passes.
#[derive(Clone)]
pub struct LivenessProber {
    client: reqwest::Client,
    deadline: Duration,
    interval: Duration,
}

impl LivenessProber {
    pub fn new(
        deadline: Duration,
        interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            deadline,
            interval,
        })
    }

    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        Self::new(
            Duration::from_millis(config.deadline_ms),
            Duration::from_millis(config.interval_ms),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    /// Returns how long it took for `addr` to become live.
    pub async fn wait_live(&self, addr: SocketAddr) -> Result<Duration, ProbeError> {
        let url = format!("http://{addr}/v2/stats/self");
        let started = Instant::now();
        let mut last = String::from("no attempt completed");

        let attempt = || self.check(&url);
        let outcome = timeout(
            self.deadline,
            attempt
                .retry(
                    ConstantBuilder::default()
                        .with_delay(self.interval)
                        .with_max_times(usize::MAX),
                )
                .notify(|err: &String, _| {
                    trace!("{} not live yet: {}", addr, err);
                    last = err.clone();
                }),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                debug!("{} became live after {:?}", addr, elapsed);
                Ok(elapsed)
            }
            // Only reachable if the retry budget runs out before the deadline.
            Ok(Err(err)) => Err(ProbeError::Timeout {
                addr,
                deadline: self.deadline,
                last: err,
            }),
            Err(_) => Err(ProbeError::Timeout {
                addr,
                deadline: self.deadline,
                last,
            }),
        }
    }

    async fn check(&self, url: &str) -> Result<(), String> {
        match self.client.get(url).send().await {
            Ok(response) if response.status() == StatusCode::OK => Ok(()),
            Ok(response) => Err(format!("status {}", response.status())),
            Err(e) => Err(error_chain(&e)),
        }
    }
}

pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
