//! Data structures used throughout the sync daemon.
//!
//! Everything here is rebuilt on every reconciliation pass.  Nothing is
//! persisted by the daemon itself; the only durable state lives in the
//! kernel, the packet filter and the mesh daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::{IpNetworkError, Ipv4Network};
use serde::{Deserialize, Serialize};

/// A cluster member as reported by the membership source.
///
/// The subnet is kept as the raw string the source stores so that a
/// malformed allocation can be reported against the node that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub subnet: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, subnet: Option<&str>) -> Self {
        Self {
            name: name.into(),
            subnet: subnet.map(str::to_string),
        }
    }
}

/// Parses an IPv4 CIDR and clears any host bits, so `10.0.2.7/24` and
/// `10.0.2.0/24` compare equal.
pub fn parse_subnet(s: &str) -> Result<Ipv4Network, IpNetworkError> {
    let net: Ipv4Network = s.trim().parse()?;
    Ipv4Network::new(net.network(), net.prefix())
}

/// Node name → subnet, at most one subnet per node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredPeerSet {
    peers: BTreeMap<String, Ipv4Network>,
}

impl DesiredPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the subnet for `name`.
    pub fn insert(&mut self, name: impl Into<String>, subnet: Ipv4Network) {
        self.peers.insert(name.into(), subnet);
    }

    pub fn get(&self, name: &str) -> Option<Ipv4Network> {
        self.peers.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Ipv4Network)> {
        self.peers.iter().map(|(name, net)| (name.as_str(), *net))
    }

    /// Every peer except `local`. A node never routes to itself.
    pub fn remote_peers<'a>(
        &'a self,
        local: &'a str,
    ) -> impl Iterator<Item = (&'a str, Ipv4Network)> + 'a {
        self.iter().filter(move |(name, _)| *name != local)
    }
}

impl<S: Into<String>> FromIterator<(S, Ipv4Network)> for DesiredPeerSet {
    fn from_iter<I: IntoIterator<Item = (S, Ipv4Network)>>(iter: I) -> Self {
        let mut set = DesiredPeerSet::new();
        for (name, net) in iter {
            set.insert(name, net);
        }
        set
    }
}

/// A kernel route on the mesh interface.
///
/// Equality only looks at destination and gateway; the outbound interface
/// does not distinguish two routes.
#[derive(Debug, Clone, Eq)]
pub struct Route {
    pub destination: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    pub interface: String,
}

impl Route {
    pub fn via(destination: Ipv4Network, gateway: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: interface.into(),
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination && self.gateway == other.gateway
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {}", self.interface)
    }
}

/// Where a filter rule should be placed when it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    /// Insert at a 1-based index in the chain.
    Insert(u32),
    /// Append to the end of the chain unless an identical rule exists.
    AppendIfAbsent,
}

/// A packet-filter rule.
///
/// Identity is the exact argument list: two rules with the same arguments in
/// a different order are different rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
    pub position: RulePosition,
}

impl FilterRule {
    pub fn new(table: &str, chain: &str, args: &[&str], position: RulePosition) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            position,
        }
    }

    /// The `--comment` value, used to identify the rule in logs.
    pub fn comment(&self) -> &str {
        self.args
            .iter()
            .position(|a| a == "--comment")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Runtime preferences of the mesh daemon.
///
/// Only the fields the daemon sync touches are typed; everything else is
/// carried through untouched in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshPrefs {
    #[serde(rename = "AdvertiseRoutes", default)]
    pub advertise_routes: Option<Vec<String>>,
    #[serde(rename = "RouteAll", default)]
    pub route_all: bool,
    #[serde(rename = "WantRunning", default)]
    pub want_running: bool,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Which fields of a [`MaskedPrefsEdit`] the daemon should apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefsMask {
    #[serde(rename = "AdvertiseRoutesSet")]
    pub advertise_routes: bool,
    #[serde(rename = "RouteAllSet")]
    pub route_all: bool,
    #[serde(rename = "WantRunningSet")]
    pub want_running: bool,
}

impl PrefsMask {
    /// Names of the masked fields, in a fixed order.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.advertise_routes {
            fields.push("advertise-routes");
        }
        if self.route_all {
            fields.push("route-all");
        }
        if self.want_running {
            fields.push("want-running");
        }
        fields
    }
}

/// A partial edit: only the fields flagged in `mask` are applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedPrefsEdit {
    #[serde(flatten)]
    pub prefs: MeshPrefs,
    #[serde(flatten)]
    pub mask: PrefsMask,
}

/// The three independently reconciled subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    Mesh,
    Routes,
    Firewall,
}

impl Subsystem {
    pub const ALL: [Subsystem; 3] = [Subsystem::Mesh, Subsystem::Routes, Subsystem::Firewall];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Mesh => "mesh",
            Subsystem::Routes => "routes",
            Subsystem::Firewall => "firewall",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
