//! Convergence appliers, one per subsystem.
//!
//! Each reconciler reads desired and observed state, asks the diff engine
//! what to change and applies it.  A returned error means the pass was
//! abandoned; failures of individual operations are counted in the
//! [`PassSummary`] instead.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Subsystem;

pub mod firewall;
pub mod mesh;
pub mod routes;

pub use firewall::FirewallReconciler;
pub use mesh::MeshReconciler;
pub use routes::RouteReconciler;

/// Outcome of a pass that ran to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Changes applied to the subsystem.
    pub applied: u64,
    /// Individual operations that failed; the pass carried on regardless.
    pub failed: u64,
}

impl PassSummary {
    pub(crate) fn record<T>(&mut self, result: &Result<T>) {
        if result.is_ok() {
            self.applied += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    /// Run one reconciliation pass.
    async fn reconcile(&self) -> Result<PassSummary>;
}
