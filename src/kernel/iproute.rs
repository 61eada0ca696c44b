//! Kernel networking through the iproute2 `ip` utility.
//!
//! Reads use the JSON output mode (`ip -j`); writes are plain
//! `ip route add|del` invocations.  Only the IPv4 family is touched.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::{IpNetworkError, Ipv4Network};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{KernelNetwork, Link};
use crate::error::{Error, Result};
use crate::exec::{display_command, CommandRunner};
use crate::types::{parse_subnet, Route};

#[derive(Debug, Deserialize)]
struct LinkEntry {
    ifindex: u32,
    ifname: String,
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    family: String,
    local: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    dst: String,
    gateway: Option<String>,
}

pub struct IpRoute {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl IpRoute {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "ip".to_string(),
        }
    }

    async fn ip(&self, args: Vec<String>) -> Result<String> {
        let output = self
            .runner
            .run(&self.binary, &args)
            .await
            .map_err(|e| Error::Kernel(format!("{}: {}", display_command(&self.binary, &args), e)))?;

        if !output.success() {
            return Err(Error::Kernel(format!(
                "{} failed: {}",
                display_command(&self.binary, &args),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn route_change(&self, verb: &str, route: &Route) -> Result<()> {
        let mut args = strings(&["-4", "route", verb]);
        args.push(route.destination.to_string());
        if let Some(gw) = route.gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }
        args.push("dev".into());
        args.push(route.interface.clone());
        self.ip(args).await.map(|_| ())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn parse_json<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout).map_err(|e| Error::Kernel(format!("unexpected ip output: {}", e)))
}

/// Destinations as printed by `ip -j route`: `default`, a bare host
/// address, or a CIDR.
fn parse_destination(dst: &str) -> std::result::Result<Ipv4Network, IpNetworkError> {
    match dst {
        "default" => Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0),
        _ if !dst.contains('/') => {
            let host = dst
                .parse::<Ipv4Addr>()
                .map_err(|e| IpNetworkError::InvalidAddr(e.to_string()))?;
            Ipv4Network::new(host, 32)
        }
        _ => parse_subnet(dst),
    }
}

#[async_trait]
impl KernelNetwork for IpRoute {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let stdout = self
            .ip(strings(&["-j", "link", "show", "dev", name]))
            .await?;
        parse_json::<LinkEntry>(&stdout)?
            .into_iter()
            .find(|l| l.ifname == name)
            .map(|l| Link {
                name: l.ifname,
                index: l.ifindex,
            })
            .ok_or_else(|| Error::Kernel(format!("link {} not found", name)))
    }

    async fn list_addresses(&self, link: &Link) -> Result<Vec<Ipv4Addr>> {
        let stdout = self
            .ip(strings(&["-j", "-4", "addr", "show", "dev", &link.name]))
            .await?;
        let mut addrs = Vec::new();
        for entry in parse_json::<AddrEntry>(&stdout)? {
            for info in entry.addr_info {
                if info.family != "inet" {
                    continue;
                }
                match info.local.as_deref().map(str::parse::<Ipv4Addr>) {
                    Some(Ok(addr)) => addrs.push(addr),
                    Some(Err(e)) => warn!("Ignoring address on {}: {}", link.name, e),
                    None => {}
                }
            }
        }
        Ok(addrs)
    }

    async fn list_routes(&self, link: &Link) -> Result<Vec<Route>> {
        let stdout = self
            .ip(strings(&["-j", "-4", "route", "show", "dev", &link.name]))
            .await?;
        let mut routes = Vec::new();
        for entry in parse_json::<RouteEntry>(&stdout)? {
            let destination = match parse_destination(&entry.dst) {
                Ok(net) => net,
                Err(e) => {
                    warn!("Ignoring route {:?} on {}: {}", entry.dst, link.name, e);
                    continue;
                }
            };
            let gateway = match entry.gateway.as_deref().map(str::parse::<Ipv4Addr>) {
                Some(Ok(gw)) => Some(gw),
                Some(Err(e)) => {
                    warn!("Ignoring route {} on {}: bad gateway: {}", entry.dst, link.name, e);
                    continue;
                }
                None => None,
            };
            routes.push(Route {
                destination,
                gateway,
                interface: link.name.clone(),
            });
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        self.route_change("add", route).await
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        self.route_change("del", route).await
    }
}
