//! Concurrent traffic against a running cluster.

mod http;

pub use http::HttpFlood;

use async_trait::async_trait;

/// A source of load that runs in the background between `start` and `stop`.
#[async_trait]
pub trait LoadGenerator: Send {
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stops all traffic and waits for in-flight requests. Safe to call more than once.
    async fn stop(&mut self);
}
