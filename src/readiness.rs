//! Node readiness watcher
//!
//! Two stages: the API must answer a liveness call, then the node listing
//! must show exactly the expected number of nodes, all `Ready=True`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lifecycle_common::{poll_until, run_with_retry, EnvOverlay, PollError, PollPolicy, RetryPolicy};
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, NodeHealthSnapshot};
use crate::error::Error;
use crate::Result;

/// Liveness is checked every 10 seconds for up to 20 minutes
pub const API_POLL_POLICY: PollPolicy =
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(20 * 60));

/// Node health is checked every 20 seconds for up to 20 minutes
pub const NODE_POLL_POLICY: PollPolicy =
    PollPolicy::new(Duration::from_secs(20), Duration::from_secs(20 * 60));

/// A single node listing is retried up to 5 times, 10 seconds apart
pub const NODE_LIST_RETRY: RetryPolicy =
    RetryPolicy::attempts(5).with_delay(Duration::from_secs(10));

/// Waits for the control plane and its nodes.
pub struct ReadinessWatcher {
    control_plane: Arc<dyn ControlPlane>,
    kubeconfig: PathBuf,
    api_policy: PollPolicy,
    node_policy: PollPolicy,
    list_retry: RetryPolicy,
}

impl ReadinessWatcher {
    /// Watcher using the standard policies
    pub fn new(control_plane: Arc<dyn ControlPlane>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            control_plane,
            kubeconfig: kubeconfig.into(),
            api_policy: API_POLL_POLICY,
            node_policy: NODE_POLL_POLICY,
            list_retry: NODE_LIST_RETRY,
        }
    }

    /// Wait for the API, then for the nodes
    pub async fn wait_until_ready(&self, expected_nodes: usize) -> Result<NodeHealthSnapshot> {
        self.wait_for_api().await?;
        self.wait_for_nodes(expected_nodes).await
    }

    /// Poll the liveness call until it succeeds
    pub async fn wait_for_api(&self) -> Result<()> {
        let control_plane = &self.control_plane;
        let kubeconfig = self.kubeconfig.as_path();

        let result = poll_until(&self.api_policy, "control plane API", || async move {
            match control_plane.cluster_info(kubeconfig).await {
                Ok(version) => Ok(Some(version)),
                Err(e) => {
                    debug!(error = %e, "Control plane not reachable yet");
                    Ok(None)
                }
            }
        })
        .await;

        match result {
            Ok(version) => {
                info!(version = %version, "Control plane API is reachable");
                Ok(())
            }
            Err(PollError::Exhausted { elapsed, .. }) => Err(Error::ApiNeverReady { waited: elapsed }),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll node health until exactly `expected` nodes are all Ready.
    ///
    /// A listing that still fails after its own retries counts as "not yet";
    /// the outer ceiling decides when to give up.
    pub async fn wait_for_nodes(&self, expected: usize) -> Result<NodeHealthSnapshot> {
        let last = Mutex::new(NodeHealthSnapshot::default());
        let last_ref = &last;

        let result = poll_until(&self.node_policy, "nodes to become ready", || async move {
            info!(expected, "Waiting for nodes to become ready");

            let snapshot = match self.snapshot().await {
                Some(snapshot) => snapshot,
                None => return Ok(None),
            };

            if snapshot.is_ready(expected) {
                info!(nodes = snapshot.observed(), "All nodes are Ready");
                return Ok(Some(snapshot));
            }

            info!(
                observed = snapshot.observed(),
                ready = snapshot.ready_count(),
                expected,
                not_ready = ?snapshot.not_ready(),
                "One or more nodes are not ready yet or missing"
            );
            *last_ref.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
            Ok(None)
        })
        .await;

        match result {
            Ok(snapshot) => Ok(snapshot),
            Err(PollError::Exhausted { .. }) => {
                let last = last.lock().unwrap_or_else(PoisonError::into_inner);
                Err(Error::NodesNotReady {
                    expected,
                    observed: last.observed(),
                    ready: last.ready_count(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot(&self) -> Option<NodeHealthSnapshot> {
        let kubeconfig = self.kubeconfig.as_path();
        let listing = run_with_retry(&self.list_retry, "list nodes", &EnvOverlay::new(), |_| {
            self.control_plane.list_nodes(kubeconfig)
        })
        .await;

        match listing {
            Ok(nodes) => Some(NodeHealthSnapshot::from_nodes(&nodes)),
            Err(e) => {
                warn!(error = %e, "Could not list nodes");
                None
            }
        }
    }
}
