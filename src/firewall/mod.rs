use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

pub mod iptables;
pub use iptables::Iptables;

/// IPv4 packet filter primitives.
///
/// Rules are identified by their exact argument list.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketFilter: Send + Sync {
    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> Result<bool>;

    /// Insert at a 1-based `position` in `chain`.
    async fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        args: &[String],
    ) -> Result<()>;

    /// Append to `chain` unless the rule is already there.  Returns whether
    /// a rule was appended.
    async fn append_rule_if_absent(&self, table: &str, chain: &str, args: &[String])
        -> Result<bool>;
}
