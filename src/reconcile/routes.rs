use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{PassSummary, Reconciler};
use crate::config::Config;
use crate::diff::plan_routes;
use crate::error::{Error, Result};
use crate::kernel::KernelNetwork;
use crate::membership::{list_desired_peers, MembershipSource};
use crate::types::Subsystem;

/// Keeps one route per remote peer subnet on the mesh interface.
///
/// Individual route changes are best effort: a failed add or delete is
/// logged and the rest of the pass still runs.
pub struct RouteReconciler {
    node_name: String,
    interface: String,
    membership: Arc<dyn MembershipSource>,
    kernel: Arc<dyn KernelNetwork>,
}

impl RouteReconciler {
    pub fn new(
        config: &Config,
        membership: Arc<dyn MembershipSource>,
        kernel: Arc<dyn KernelNetwork>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            interface: config.mesh_interface.clone(),
            membership,
            kernel,
        }
    }
}

#[async_trait]
impl Reconciler for RouteReconciler {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Routes
    }

    async fn reconcile(&self) -> Result<PassSummary> {
        let link = self.kernel.link_by_name(&self.interface).await?;
        let gateway = self
            .kernel
            .list_addresses(&link)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoLinkAddress(link.name.clone()))?;
        let observed = self.kernel.list_routes(&link).await?;
        let peers = list_desired_peers(self.membership.as_ref()).await?;

        let diff = plan_routes(&peers, &self.node_name, gateway, &link.name).diff(&observed);
        let mut summary = PassSummary::default();
        if diff.is_empty() {
            debug!("Route table on {} already converged", link.name);
            return Ok(summary);
        }

        // Removals first so a peer whose subnet changed frees its old route.
        for route in &diff.to_remove {
            let result = self.kernel.delete_route(route).await;
            match &result {
                Ok(()) => info!("Removed route {}", route),
                Err(e) => warn!("Failed to remove route {}: {}", route, e),
            }
            summary.record(&result);
        }
        for route in &diff.to_add {
            let result = self.kernel.add_route(route).await;
            match &result {
                Ok(()) => info!("Added route {}", route),
                Err(e) => warn!("Failed to add route {}: {}", route, e),
            }
            summary.record(&result);
        }
        Ok(summary)
    }
}
