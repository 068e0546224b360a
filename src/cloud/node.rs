//! Seams to the cluster: publishing the tunnel port into node status and
//! resolving which node hosts a pod.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Writes the kubelet endpoint port into a node's status record.
pub trait NodeStatusPublisher: Send + Sync {
    fn set_kubelet_endpoint_port(&self, node: &str, port: u16) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Records published ports in memory and logs them. Used when no cluster API
/// is wired in, and by tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingPublisher {
    ports: Arc<RwLock<HashMap<String, u16>>>,
}

impl RecordingPublisher {
    pub async fn port_of(&self, node: &str) -> Option<u16> {
        self.ports.read().await.get(node).copied()
    }
}

impl NodeStatusPublisher for RecordingPublisher {
    fn set_kubelet_endpoint_port(&self, node: &str, port: u16) -> BoxFuture<'_, Result<(), BoxError>> {
        let node = node.to_string();
        Box::pin(async move {
            info!(node = %node, port, "kubelet endpoint port published");
            self.ports.write().await.insert(node, port);
            Ok(())
        })
    }
}

/// Publish `port` for `node`, polling immediately and then every `interval`
/// until it succeeds or `timeout` elapses.
pub async fn publish_kubelet_port(
    publisher: &dyn NodeStatusPublisher,
    node: &str,
    port: u16,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let attempts = async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match publisher.set_kubelet_endpoint_port(node, port).await {
                Ok(()) => return,
                Err(e) => warn!(node = %node, "failed to publish kubelet endpoint port: {e}"),
            }
        }
    };
    tokio::time::timeout(timeout, attempts)
        .await
        .map_err(|_| TunnelError::NodeStatusPublishFailed {
            node: node.to_string(),
            reason: format!("timed out after {}s", timeout.as_secs()),
        })
}

/// Maps a pod to the node that hosts it.
pub trait PodNodeResolver: Send + Sync {
    fn node_name_for<'a>(&'a self, namespace: &'a str, pod: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Resolver backed by a fixed `namespace/pod -> node` table.
#[derive(Debug, Default, Clone)]
pub struct StaticPodNodeResolver {
    pods: HashMap<String, String>,
}

impl StaticPodNodeResolver {
    pub fn new(pods: HashMap<String, String>) -> Self {
        debug!(pods = pods.len(), "static pod table loaded");
        Self { pods }
    }
}

impl PodNodeResolver for StaticPodNodeResolver {
    fn node_name_for<'a>(&'a self, namespace: &'a str, pod: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.pods
                .get(&format!("{namespace}/{pod}"))
                .cloned()
                .ok_or_else(|| TunnelError::NotFound(format!("node for pod {namespace}/{pod}")))
        })
    }
}
