//! Desired-state provider backed by cluster membership.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, ListParams};
use kube::Client;
use log::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::types::{parse_subnet, DesiredPeerSet, Node};

/// Read-only view of cluster membership.
///
/// Implementations must be safe to share between the reconciliation loops.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Fetch a single node by name.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// List every node currently in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// Membership read from Kubernetes `Node` objects (`spec.podCIDR`).
#[derive(Clone)]
pub struct KubeMembership {
    client: Client,
}

impl KubeMembership {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster environment or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }
}

fn from_kube(node: &KubeNode) -> Node {
    Node {
        name: node.metadata.name.clone().unwrap_or_default(),
        subnet: node.spec.as_ref().and_then(|s| s.pod_cidr.clone()),
    }
}

#[async_trait]
impl MembershipSource for KubeMembership {
    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let node = api.get(name).await?;
        Ok(from_kube(&node))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(from_kube).collect())
    }
}

/// Parse the subnet a node carries.
pub fn node_subnet(node: &Node) -> Result<Ipv4Network> {
    let raw = node
        .subnet
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::MissingSubnet(node.name.clone()))?;
    parse_subnet(raw).map_err(|source| Error::InvalidSubnet {
        node: node.name.clone(),
        subnet: raw.to_string(),
        source,
    })
}

/// List the desired peer set.
///
/// Nodes without a usable subnet are logged and left out; the rest of the
/// set is still returned.
pub async fn list_desired_peers(source: &dyn MembershipSource) -> Result<DesiredPeerSet> {
    let nodes = source.list_nodes().await?;
    let mut peers = DesiredPeerSet::new();
    for node in &nodes {
        match node_subnet(node) {
            Ok(net) => {
                peers.insert(node.name.clone(), net);
            }
            Err(e) => warn!("Skipping node {}: {}", node.name, e),
        }
    }
    debug!("Desired peer set has {} of {} nodes", peers.len(), nodes.len());
    Ok(peers)
}

/// Fetch and parse the local node's subnet.
pub async fn local_subnet(source: &dyn MembershipSource, node_name: &str) -> Result<Ipv4Network> {
    let node = source.get_node(node_name).await?;
    node_subnet(&node)
}
