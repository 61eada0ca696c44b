use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::{PassSummary, Reconciler};
use crate::config::Config;
use crate::diff::mesh_edit;
use crate::error::Result;
use crate::membership::{local_subnet, MembershipSource};
use crate::mesh::MeshControl;
use crate::types::Subsystem;

/// Keeps the mesh daemon advertising this node's subnet with route-all on.
///
/// This is an unconditional overwrite rather than a diff; resubmitting the
/// same values is a no-op on the daemon side.
pub struct MeshReconciler {
    node_name: String,
    membership: Arc<dyn MembershipSource>,
    mesh: Arc<dyn MeshControl>,
}

impl MeshReconciler {
    pub fn new(
        config: &Config,
        membership: Arc<dyn MembershipSource>,
        mesh: Arc<dyn MeshControl>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            membership,
            mesh,
        }
    }
}

#[async_trait]
impl Reconciler for MeshReconciler {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Mesh
    }

    async fn reconcile(&self) -> Result<PassSummary> {
        let subnet = local_subnet(self.membership.as_ref(), &self.node_name).await?;
        let current = self.mesh.get_prefs().await?;
        let edit = mesh_edit(&current, subnet);

        info!(
            "Updating mesh prefs: advertise {} ({})",
            subnet,
            edit.mask.fields().join(", ")
        );
        self.mesh.edit_prefs(&edit).await?;

        Ok(PassSummary {
            applied: 1,
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::membership::MockMembershipSource;
    use crate::mesh::MockMeshControl;
    use crate::types::{MeshPrefs, Node, PrefsMask};

    fn membership(subnet: &'static str) -> MockMembershipSource {
        let mut source = MockMembershipSource::new();
        source
            .expect_get_node()
            .withf(|name| name == "node-a")
            .returning(move |name| Ok(Node::new(name, Some(subnet))));
        source
    }

    #[tokio::test]
    async fn submits_masked_edit_for_local_subnet() {
        let mut mesh = MockMeshControl::new();
        mesh.expect_get_prefs().times(1).returning(|| {
            Ok(MeshPrefs {
                advertise_routes: Some(vec!["10.9.0.0/24".into()]),
                route_all: false,
                want_running: false,
                other: Default::default(),
            })
        });
        mesh.expect_edit_prefs()
            .withf(|edit| {
                edit.mask
                    == PrefsMask {
                        advertise_routes: true,
                        route_all: true,
                        want_running: true,
                    }
                    && edit.prefs.advertise_routes == Some(vec!["10.0.1.0/24".to_string()])
                    && edit.prefs.route_all
                    && !edit.prefs.want_running
            })
            .times(1)
            .returning(|edit| Ok(edit.prefs.clone()));

        let reconciler = MeshReconciler::new(
            &Config::for_node("node-a"),
            Arc::new(membership("10.0.1.0/24")),
            Arc::new(mesh),
        );
        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary.applied, 1);
    }

    #[tokio::test]
    async fn prefs_fetch_failure_abandons_pass() {
        let mut mesh = MockMeshControl::new();
        mesh.expect_get_prefs()
            .returning(|| Err(Error::Mesh("connection refused".into())));
        mesh.expect_edit_prefs().times(0);

        let reconciler = MeshReconciler::new(
            &Config::for_node("node-a"),
            Arc::new(membership("10.0.1.0/24")),
            Arc::new(mesh),
        );
        assert!(matches!(
            reconciler.reconcile().await,
            Err(Error::Mesh(_))
        ));
    }

    #[tokio::test]
    async fn invalid_local_subnet_abandons_pass() {
        let mut mesh = MockMeshControl::new();
        mesh.expect_get_prefs().times(0);
        mesh.expect_edit_prefs().times(0);

        let reconciler = MeshReconciler::new(
            &Config::for_node("node-a"),
            Arc::new(membership("not-a-cidr")),
            Arc::new(mesh),
        );
        assert!(matches!(
            reconciler.reconcile().await,
            Err(Error::InvalidSubnet { .. })
        ));
    }
}
