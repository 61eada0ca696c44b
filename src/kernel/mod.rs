use std::net::Ipv4Addr;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::types::Route;

pub mod iproute;
pub use iproute::IpRoute;

/// A network interface resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
}

/// IPv4 view of the kernel networking stack.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KernelNetwork: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Link>;

    /// IPv4 addresses assigned to `link`, in kernel order.
    async fn list_addresses(&self, link: &Link) -> Result<Vec<Ipv4Addr>>;

    /// IPv4 routes in the main table whose outbound interface is `link`.
    async fn list_routes(&self, link: &Link) -> Result<Vec<Route>>;

    async fn add_route(&self, route: &Route) -> Result<()>;

    async fn delete_route(&self, route: &Route) -> Result<()>;
}
