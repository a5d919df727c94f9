//! Control-plane API adapter
//!
//! Read-only queries against the cluster under test, made with the
//! kubeconfig the installer writes into the build directory.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

/// Label carried by control-plane nodes
pub const MASTER_NODE_LABEL: &str = "node-role.kubernetes.io/master";

/// Label selecting the API server pods
pub const API_SERVER_POD_LABEL: &str = "k8s-app=kube-apiserver";

/// Namespace of the API server pods
pub const API_SERVER_NAMESPACE: &str = "kube-system";

const CONDITION_READY: &str = "Ready";
const STATUS_TRUE: &str = "True";
const EXTERNAL_IP: &str = "ExternalIP";

/// Errors from control-plane queries
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The kubeconfig could not be loaded
    #[error("failed to load kubeconfig {path}: {message}")]
    Kubeconfig {
        /// Kubeconfig path
        path: String,
        /// Loader error
        message: String,
    },

    /// The API call failed
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Ready state of one node as returned by a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHealth {
    /// Position in the listing
    pub index: usize,
    /// Node name
    pub name: String,
    /// Whether the node's Ready condition is True
    pub ready: bool,
}

/// Node health as of one listing; rebuilt on every poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeHealthSnapshot {
    /// Nodes in listing order
    pub nodes: Vec<NodeHealth>,
}

impl NodeHealthSnapshot {
    /// Build a snapshot from a node listing
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let nodes = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeHealth {
                index,
                name: node.metadata.name.clone().unwrap_or_default(),
                ready: is_node_ready(node),
            })
            .collect();
        Self { nodes }
    }

    /// Number of nodes returned
    pub fn observed(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes reporting Ready
    pub fn ready_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.ready).count()
    }

    /// Exactly `expected` nodes returned and every one of them Ready.
    ///
    /// Fewer nodes than expected is "not yet"; so is more, since the
    /// expected count comes from the cluster variables.
    pub fn is_ready(&self, expected: usize) -> bool {
        self.observed() == expected && self.nodes.iter().all(|n| n.ready)
    }

    /// Names of nodes not yet Ready
    pub fn not_ready(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| n.name.as_str())
            .collect()
    }
}

/// Whether a node carries `Ready=True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for read-only queries against the cluster's control API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Liveness call; returns the server version
    async fn cluster_info(&self, kubeconfig: &Path) -> Result<String, ApiError>;

    /// List every node in the cluster
    async fn list_nodes(&self, kubeconfig: &Path) -> Result<Vec<Node>, ApiError>;

    /// Control-plane node name to external IP
    async fn master_addresses(&self, kubeconfig: &Path)
        -> Result<BTreeMap<String, String>, ApiError>;

    /// API server pod name to the node it runs on
    async fn api_server_pods(&self, kubeconfig: &Path)
        -> Result<BTreeMap<String, String>, ApiError>;

    /// Keys of a secret's data
    async fn secret_keys(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ApiError>;
}

/// kube-rs implementation of [`ControlPlane`].
///
/// A client is built per call because the kubeconfig only exists once the
/// installer has rendered it, and its endpoint may change across updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeControlPlane;

impl KubeControlPlane {
    async fn client(&self, kubeconfig: &Path) -> Result<Client, ApiError> {
        let path = kubeconfig.display().to_string();
        let config = Kubeconfig::read_from(kubeconfig).map_err(|e| ApiError::Kubeconfig {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let config = Config::from_custom_kubeconfig(config, &KubeConfigOptions::default())
            .await
            .map_err(|e| ApiError::Kubeconfig {
                path,
                message: e.to_string(),
            })?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn cluster_info(&self, kubeconfig: &Path) -> Result<String, ApiError> {
        let client = self.client(kubeconfig).await?;
        let info = client.apiserver_version().await?;
        debug!(version = %info.git_version, "Control plane answered");
        Ok(info.git_version)
    }

    async fn list_nodes(&self, kubeconfig: &Path) -> Result<Vec<Node>, ApiError> {
        let nodes: Api<Node> = Api::all(self.client(kubeconfig).await?);
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn master_addresses(
        &self,
        kubeconfig: &Path,
    ) -> Result<BTreeMap<String, String>, ApiError> {
        let nodes: Api<Node> = Api::all(self.client(kubeconfig).await?);
        let list = nodes
            .list(&ListParams::default().labels(MASTER_NODE_LABEL))
            .await?;
        Ok(node_external_ips(&list.items))
    }

    async fn api_server_pods(
        &self,
        kubeconfig: &Path,
    ) -> Result<BTreeMap<String, String>, ApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client(kubeconfig).await?, API_SERVER_NAMESPACE);
        let list = pods
            .list(&ListParams::default().labels(API_SERVER_POD_LABEL))
            .await?;
        Ok(pod_node_names(&list.items))
    }

    async fn secret_keys(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ApiError> {
        let secrets: Api<Secret> = Api::namespaced(self.client(kubeconfig).await?, namespace);
        let secret = secrets.get(name).await?;
        Ok(secret.data.map(|d| d.into_keys().collect()).unwrap_or_default())
    }
}

/// Node name to its first external IP; nodes without one are skipped.
pub fn node_external_ips(nodes: &[Node]) -> BTreeMap<String, String> {
    nodes
        .iter()
        .filter_map(|node| {
            let name = node.metadata.name.clone()?;
            let ip = node
                .status
                .as_ref()?
                .addresses
                .as_ref()?
                .iter()
                .find(|a| a.type_ == EXTERNAL_IP)?
                .address
                .clone();
            Some((name, ip))
        })
        .collect()
}

/// Pod name to the node it is scheduled on; unscheduled pods are skipped.
pub fn pod_node_names(pods: &[Pod]) -> BTreeMap<String, String> {
    pods.iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.clone()?;
            let node = pod.spec.as_ref()?.node_name.clone()?;
            Some((name, node))
        })
        .collect()
}

/// Resolve each API server pod to the external IP of its node.
///
/// Pods on nodes without a known address map to `None`.
pub fn join_api_addresses(
    pods: &BTreeMap<String, String>,
    masters: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    pods.iter()
        .map(|(pod, node)| (pod.clone(), masters.get(node).cloned()))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeStatus, PodSpec};
    use kube::api::ObjectMeta;

    pub(crate) fn node(name: &str, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "MemoryPressure".to_string(),
                        status: "False".to_string(),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: "Ready".to_string(),
                        status: if ready { "True" } else { "False" }.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn master(name: &str, ip: &str) -> Node {
        let mut n = node(name, true);
        if let Some(status) = n.status.as_mut() {
            status.addresses = Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "192.168.0.10".to_string(),
                },
                NodeAddress {
                    type_: "ExternalIP".to_string(),
                    address: ip.to_string(),
                },
            ]);
        }
        n
    }

    fn api_pod(name: &str, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_reads_ready_condition() {
        let snapshot = NodeHealthSnapshot::from_nodes(&[node("a", true), node("b", false)]);
        assert_eq!(snapshot.observed(), 2);
        assert_eq!(snapshot.ready_count(), 1);
        assert_eq!(snapshot.not_ready(), vec!["b"]);
        assert_eq!(snapshot.nodes[1].index, 1);
    }

    #[test]
    fn node_without_status_is_not_ready() {
        let bare = Node::default();
        assert!(!is_node_ready(&bare));
    }

    #[test]
    fn two_of_three_nodes_is_not_ready() {
        let snapshot = NodeHealthSnapshot::from_nodes(&[node("a", true), node("b", true)]);
        assert!(!snapshot.is_ready(3));
    }

    #[test]
    fn one_unready_node_is_not_ready() {
        let snapshot =
            NodeHealthSnapshot::from_nodes(&[node("a", true), node("b", false), node("c", true)]);
        assert!(!snapshot.is_ready(3));
    }

    #[test]
    fn extra_nodes_are_not_ready() {
        let snapshot = NodeHealthSnapshot::from_nodes(&[
            node("a", true),
            node("b", true),
            node("c", true),
            node("d", true),
        ]);
        assert!(!snapshot.is_ready(3));
    }

    #[test]
    fn all_expected_nodes_ready() {
        let snapshot =
            NodeHealthSnapshot::from_nodes(&[node("a", true), node("b", true), node("c", true)]);
        assert!(snapshot.is_ready(3));
    }

    #[test]
    fn api_addresses_join_pods_to_master_ips() {
        let masters = node_external_ips(&[master("m0", "34.1.1.1"), master("m1", "34.1.1.2")]);
        let pods = pod_node_names(&[
            api_pod("kube-apiserver-abc", "m1"),
            api_pod("kube-apiserver-def", "m9"),
        ]);

        let joined = join_api_addresses(&pods, &masters);

        assert_eq!(
            joined.get("kube-apiserver-abc"),
            Some(&Some("34.1.1.2".to_string()))
        );
        assert_eq!(joined.get("kube-apiserver-def"), Some(&None));
    }

    #[test]
    fn nodes_without_external_ip_are_skipped() {
        let ips = node_external_ips(&[node("worker", true)]);
        assert!(ips.is_empty());
    }
}
