//! Shared types for the autowired overlay-network daemon.
//!
//! These are plain data: the KV layer and the tunnel driver each speak their own
//! wire format, but every other crate in this workspace passes these tagged
//! structs around instead of the map-of-maps the tool was originally built on.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// The four KV fields published under `nodes/<phys-ip>/…` for a single host.
///
/// Owned and written exclusively by the Allocator for the local host; read by
/// every host's Peer Watcher once folded into a [`DesiredPeer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub overlay_ip: Ipv4Addr,
    pub public_key: String,
    pub port: u16,
    pub allowed_ips: IpNet,
}

impl NodeRecord {
    /// Builds the record a host publishes for itself: `allowedips` is always
    /// the claimed address as a /32.
    pub fn new(overlay_ip: Ipv4Addr, public_key: impl Into<String>, port: u16) -> Self {
        Self {
            overlay_ip,
            public_key: public_key.into(),
            port,
            allowed_ips: IpNet::new(IpAddr::V4(overlay_ip), 32)
                .expect("/32 is always a valid prefix length for an IPv4 address"),
        }
    }
}

/// A remote host's record as seen by the Peer Watcher, keyed externally by
/// physical IP. `endpoint` duplicates the map key by design (see spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPeer {
    pub endpoint: IpAddr,
    pub public_key: String,
    pub port: u16,
    pub allowed_ips: IpNet,
}

impl DesiredPeer {
    pub fn from_node_record(endpoint: IpAddr, record: &NodeRecord) -> Self {
        Self {
            endpoint,
            public_key: record.public_key.clone(),
            port: record.port,
            allowed_ips: record.allowed_ips,
        }
    }
}

/// The Peer Applier's in-memory mirror of what is actually installed on the
/// local tunnel interface. Structurally identical to [`DesiredPeer`]; kept as
/// a distinct name so call sites read as "what we applied" vs. "what the KV
/// wants", per the re-architecture guidance against a map-of-maps.
pub type AppliedPeer = DesiredPeer;

/// A human-readable description of a single field change, used for logging
/// when the Peer Applier reconfigures an existing peer in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFieldChange {
    Endpoint { old: IpAddr, new: IpAddr },
    Port { old: u16, new: u16 },
    AllowedIps { old: IpNet, new: IpNet },
}

impl fmt::Display for PeerFieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint { old, new } => write!(f, "endpoint {old} -> {new}"),
            Self::Port { old, new } => write!(f, "port {old} -> {new}"),
            Self::AllowedIps { old, new } => write!(f, "allowed-ips {old} -> {new}"),
        }
    }
}

/// The full set of KV fields a daemon's own Node Record is split into, as a
/// flat `field -> value` map the way it arrives off the wire, before the Peer
/// Watcher folds it into a [`DesiredPeer`].
pub const FIELD_IP: &str = "ip";
pub const FIELD_PUBKEY: &str = "pubKey";
pub const FIELD_PORT: &str = "port";
pub const FIELD_ALLOWEDIPS: &str = "allowedips";
pub const FIELD_ENDPOINT: &str = "endpoint";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_record_allowed_ips_is_slash_32() {
        let record = NodeRecord::new(Ipv4Addr::new(192, 168, 200, 1), "pubkey", 51820);
        assert_eq!(record.allowed_ips.to_string(), "192.168.200.1/32");
    }

    #[test]
    fn desired_peer_carries_endpoint_separately_from_record() {
        let record = NodeRecord::new(Ipv4Addr::new(192, 168, 200, 2), "pubkey", 51820);
        let endpoint: IpAddr = "10.0.0.12".parse().unwrap();
        let peer = DesiredPeer::from_node_record(endpoint, &record);
        assert_eq!(peer.endpoint, endpoint);
        assert_eq!(peer.allowed_ips, record.allowed_ips);
    }
}
