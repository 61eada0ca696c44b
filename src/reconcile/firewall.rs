use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{PassSummary, Reconciler};
use crate::config::Config;
use crate::diff::firewall_rules;
use crate::error::{Error, Result};
use crate::firewall::PacketFilter;
use crate::membership::{local_subnet, MembershipSource};
use crate::types::{FilterRule, RulePosition, Subsystem};

/// Ensures the pod bridge forward rules and the pod egress masquerade rule.
///
/// Rules are only ever added.  They refer to the bridge and the local
/// subnet, never to individual peers, so nothing goes stale when peers
/// leave.
pub struct FirewallReconciler {
    node_name: String,
    bridge: String,
    membership: Arc<dyn MembershipSource>,
    filter: Arc<dyn PacketFilter>,
}

impl FirewallReconciler {
    pub fn new(
        config: &Config,
        membership: Arc<dyn MembershipSource>,
        filter: Arc<dyn PacketFilter>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            bridge: config.bridge_interface.clone(),
            membership,
            filter,
        }
    }

    /// Returns whether the rule had to be added.
    async fn ensure(&self, rule: &FilterRule) -> Result<bool> {
        match rule.position {
            RulePosition::Insert(position) => {
                if self
                    .filter
                    .rule_exists(&rule.table, &rule.chain, &rule.args)
                    .await?
                {
                    return Ok(false);
                }
                self.filter
                    .insert_rule(&rule.table, &rule.chain, position, &rule.args)
                    .await?;
                Ok(true)
            }
            RulePosition::AppendIfAbsent => {
                self.filter
                    .append_rule_if_absent(&rule.table, &rule.chain, &rule.args)
                    .await
            }
        }
    }
}

#[async_trait]
impl Reconciler for FirewallReconciler {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Firewall
    }

    async fn reconcile(&self) -> Result<PassSummary> {
        let subnet = match local_subnet(self.membership.as_ref(), &self.node_name).await {
            Ok(subnet) => Some(subnet),
            Err(e @ (Error::MissingSubnet(_) | Error::InvalidSubnet { .. })) => {
                warn!("Skipping pod egress rule: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let mut summary = PassSummary::default();
        for rule in firewall_rules(&self.bridge, subnet) {
            match self.ensure(&rule).await {
                Ok(true) => {
                    info!(
                        "Added {}/{} rule {:?}",
                        rule.table,
                        rule.chain,
                        rule.comment()
                    );
                    summary.applied += 1;
                }
                Ok(false) => debug!("Rule {:?} already present", rule.comment()),
                Err(e) => {
                    warn!("Failed to ensure rule {:?}: {}", rule.comment(), e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
