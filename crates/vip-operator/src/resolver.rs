//! Selection of the endpoints hosted on this node

use crate::snapshot::EndpointSnapshot;
use std::net::IpAddr;

/// Addresses in `snapshot` whose hosting node is `node_name`, in snapshot order
pub fn resolve(snapshot: &EndpointSnapshot, node_name: &str) -> Vec<String> {
    snapshot
        .addresses
        .iter()
        .filter(|address| address.node_name.as_deref() == Some(node_name))
        .map(|address| address.ip.clone())
        .collect()
}

/// Pick the endpoint an election is bound to when several are local.
///
/// The lowest address wins: numeric order when every candidate is an IP,
/// plain string order otherwise.
pub fn select_endpoint(addresses: &[String]) -> Option<&String> {
    let parsed: Option<Vec<(IpAddr, &String)>> = addresses
        .iter()
        .map(|address| address.parse::<IpAddr>().ok().map(|ip| (ip, address)))
        .collect();

    match parsed {
        Some(ips) => ips.into_iter().min().map(|(_, address)| address),
        None => addresses.iter().min(),
    }
}
