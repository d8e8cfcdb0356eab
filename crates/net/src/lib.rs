//! Resolves the physical (underlay) IP address of the configured NIC.
//!
//! The physical IP doubles as the tunnel endpoint and as this host's
//! identity key in the KV (spec §3, Glossary), so this is on the critical
//! path of every boot.

use std::net::IpAddr;

use get_if_addrs::{get_if_addrs, IfAddr};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An empty NIC name is reserved for a future "first interface" lookup.
    /// Today it is a fatal configuration error (spec §4.2).
    #[error("no NIC configured; empty interface name is not yet supported")]
    EmptyInterfaceName,
    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),
    #[error("interface {0:?} has no address")]
    NoAddress(String),
    #[error("failed to enumerate network interfaces: {0}")]
    Enumerate(#[source] std::io::Error),
}

/// Returns the bare IP address (no mask) of the named NIC's primary address.
///
/// Prefers an IPv4 address, since overlay ranges in this tool are IPv4-only
/// (spec §2 Allocator).
#[tracing::instrument(level = "debug")]
pub fn resolve_physical_ip(iface: &str) -> Result<IpAddr, NetError> {
    if iface.is_empty() {
        return Err(NetError::EmptyInterfaceName);
    }

    let interfaces = get_if_addrs().map_err(NetError::Enumerate)?;

    let mut found = false;
    let mut candidate = None;
    for interface in interfaces.into_iter().filter(|i| i.name == iface) {
        found = true;
        match interface.addr {
            IfAddr::V4(v4) => return Ok(IpAddr::V4(v4.ip)),
            IfAddr::V6(v6) if candidate.is_none() => candidate = Some(IpAddr::V6(v6.ip)),
            IfAddr::V6(_) => {}
        }
    }

    match (found, candidate) {
        (_, Some(ip)) => Ok(ip),
        (true, None) => Err(NetError::NoAddress(iface.to_string())),
        (false, None) => Err(NetError::InterfaceNotFound(iface.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_interface_name_is_fatal() {
        assert!(matches!(resolve_physical_ip(""), Err(NetError::EmptyInterfaceName)));
    }

    #[test]
    fn unknown_interface_is_not_found() {
        let err = resolve_physical_ip("definitely-not-a-real-nic-0").unwrap_err();
        assert!(matches!(err, NetError::InterfaceNotFound(_)));
    }
}
