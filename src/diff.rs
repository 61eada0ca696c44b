//! Diff engine.
//!
//! Pure functions that turn desired and observed state into the changes each
//! subsystem needs.  Nothing in here touches a live subsystem, which keeps the
//! convergence rules testable in isolation.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::types::{
    DesiredPeerSet, FilterRule, MaskedPrefsEdit, MeshPrefs, PrefsMask, Route, RulePosition,
};

pub const FILTER_TABLE: &str = "filter";
pub const FORWARD_CHAIN: &str = "FORWARD";
pub const NAT_TABLE: &str = "nat";
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Changes needed to bring the kernel route table in line with membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub to_remove: Vec<Route>,
    pub to_add: Vec<Route>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Routes the kernel should hold on the mesh interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// One route per remote peer subnet.
    pub desired: Vec<Route>,
    /// A route to the local node's own subnet.  Never added, but tolerated
    /// if something else installed it.
    pub local: Option<Route>,
}

impl RoutePlan {
    /// Compute removals and additions by structural (destination, gateway)
    /// equality.  A route whose gateway changed shows up in both lists.
    pub fn diff(&self, observed: &[Route]) -> RouteDiff {
        let to_remove = observed
            .iter()
            .filter(|route| !self.desired.contains(route) && self.local.as_ref() != Some(*route))
            .cloned()
            .collect();
        let to_add = self
            .desired
            .iter()
            .filter(|route| !observed.contains(route))
            .cloned()
            .collect();
        RouteDiff { to_remove, to_add }
    }
}

/// Plan one route per remote peer subnet, all through `gateway` on
/// `interface`.
///
/// The local node never gets a route.  If two peers claim the same subnet
/// only the first one (by node name) produces a route.
pub fn plan_routes(
    peers: &DesiredPeerSet,
    local_node: &str,
    gateway: Ipv4Addr,
    interface: &str,
) -> RoutePlan {
    let mut desired: Vec<Route> = Vec::with_capacity(peers.len());
    for (_, subnet) in peers.remote_peers(local_node) {
        if desired.iter().any(|r| r.destination == subnet) {
            continue;
        }
        desired.push(Route::via(subnet, gateway, interface));
    }
    let local = peers
        .get(local_node)
        .filter(|subnet| !desired.iter().any(|r| r.destination == *subnet))
        .map(|subnet| Route::via(subnet, gateway, interface));
    RoutePlan { desired, local }
}

/// The rules every node needs, in the order they are ensured.
///
/// The masquerade rule depends on the local subnet and is left out when it
/// is unknown.
pub fn firewall_rules(bridge: &str, local_subnet: Option<Ipv4Network>) -> Vec<FilterRule> {
    let mut rules = vec![
        FilterRule::new(
            FILTER_TABLE,
            FORWARD_CHAIN,
            &[
                "-m",
                "comment",
                "--comment",
                "allow outbound traffic from pods",
                "-i",
                bridge,
                "-j",
                "ACCEPT",
            ],
            RulePosition::Insert(1),
        ),
        FilterRule::new(
            FILTER_TABLE,
            FORWARD_CHAIN,
            &[
                "-m",
                "comment",
                "--comment",
                "allow inbound traffic from pods",
                "-o",
                bridge,
                "-j",
                "ACCEPT",
            ],
            RulePosition::Insert(1),
        ),
    ];

    if let Some(subnet) = local_subnet {
        let source = subnet.to_string();
        rules.push(FilterRule::new(
            NAT_TABLE,
            POSTROUTING_CHAIN,
            &[
                "-m",
                "comment",
                "--comment",
                "pod egress",
                "-s",
                &source,
                "!",
                "-o",
                bridge,
                "-j",
                "MASQUERADE",
            ],
            RulePosition::AppendIfAbsent,
        ));
    }
    rules
}

/// Advertise `local_subnet` with route-all on.  Want-running is masked but
/// resubmitted as fetched, so a stopped daemon stays stopped.
pub fn mesh_edit(current: &MeshPrefs, local_subnet: Ipv4Network) -> MaskedPrefsEdit {
    let mut prefs = current.clone();
    prefs.advertise_routes = Some(vec![local_subnet.to_string()]);
    prefs.route_all = true;

    MaskedPrefsEdit {
        prefs,
        mask: PrefsMask {
            advertise_routes: true,
            route_all: true,
            want_running: true,
        },
    }
}
