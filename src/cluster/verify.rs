use http::StatusCode;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use super::bootstrap::Cluster;
use super::error::VerifyError;
use crate::config::VerifyConfig;

/// etcd's "Key not found" error code.
const ETCD_KEY_NOT_FOUND: u64 = 100;

#[derive(Debug, Deserialize)]
pub struct KeysResponse {
    pub node: Option<KeyNode>,
}

#[derive(Debug, Deserialize)]
pub struct KeyNode {
    pub key: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<KeyNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
}

/// Counts the entries stored under a key namespace.
#[derive(Clone)]
pub struct StateVerifier {
    client: reqwest::Client,
    namespace: String,
}

impl StateVerifier {
    pub fn new(
        namespace: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn from_config(config: &VerifyConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.namespace.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of direct children of the namespace directory on the node at `addr`.
    /// A namespace that was never written counts as empty.
    pub async fn keys_on_node(&self, addr: SocketAddr) -> Result<usize, VerifyError> {
        let url = format!("http://{addr}/v2/keys/{}?recursive=true", self.namespace);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VerifyError::Transport {
                url: url.clone(),
                source: e,
            })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| VerifyError::Transport {
            url: url.clone(),
            source: e,
        })?;

        if status == StatusCode::NOT_FOUND {
            if let Ok(err) = serde_json::from_slice::<EtcdErrorBody>(&body) {
                if err.error_code == ETCD_KEY_NOT_FOUND {
                    debug!("{} has no {} namespace yet", addr, self.namespace);
                    return Ok(0);
                }
            }
        }
        if status != StatusCode::OK {
            return Err(VerifyError::Status { url, status });
        }

        let decoded: KeysResponse =
            serde_json::from_slice(&body).map_err(|e| VerifyError::Decode {
                url: url.clone(),
                source: e,
            })?;
        let node = decoded.node.ok_or_else(|| VerifyError::MissingNode { url: url.clone() })?;
        if !node.dir {
            return Err(VerifyError::NotDirectory { url, key: node.key });
        }
        Ok(node.nodes.len())
    }

    /// Entry count reported by every node of `cluster`, in index order.
    pub async fn keys_on_cluster(&self, cluster: &Cluster) -> Result<Vec<usize>, VerifyError> {
        let mut counts = Vec::with_capacity(cluster.nodes.len());
        for node in &cluster.nodes {
            counts.push(self.keys_on_node(node.client_addr).await?);
        }
        Ok(counts)
    }
}
