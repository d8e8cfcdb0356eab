//! Peer Applier: diffs the in-memory Applied Peer Set against a freshly
//! received Desired Peer Set and issues add/remove/update calls on the
//! interface driver (spec §4.7).

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use autowired_primitives::{AppliedPeer, DesiredPeer, PeerFieldChange};
use autowired_tunnel::{InterfaceDriver, TunnelError};

pub struct PeerApplier {
    driver: Arc<dyn InterfaceDriver>,
    iface_name: String,
    self_phys_ip: IpAddr,
    peers: HashMap<IpAddr, AppliedPeer>,
}

impl PeerApplier {
    pub fn new(driver: Arc<dyn InterfaceDriver>, iface_name: String, self_phys_ip: IpAddr) -> Self {
        Self { driver, iface_name, self_phys_ip, peers: HashMap::new() }
    }

    pub fn applied_peers(&self) -> &HashMap<IpAddr, AppliedPeer> {
        &self.peers
    }

    /// Applies one Desired Peer Set, per spec §4.7. Every mutation to
    /// `peers` happens here and only here; the two watcher tasks never touch
    /// it (spec §5).
    #[tracing::instrument(level = "info", skip_all)]
    pub fn apply(&mut self, desired: &HashMap<IpAddr, DesiredPeer>) -> Result<(), TunnelError> {
        let existing: Vec<IpAddr> = self.peers.keys().copied().collect();

        for phys_ip in existing {
            let Some(wanted) = desired.get(&phys_ip) else {
                let applied = self.peers.remove(&phys_ip).expect("key came from this map");
                self.driver.remove_peer(&self.iface_name, &applied.public_key)?;
                tracing::info!(%phys_ip, "peer departed, removed");
                continue;
            };

            let applied = self.peers.get(&phys_ip).expect("key came from this map");
            if applied.public_key != wanted.public_key {
                // Key rotation: the stale peer must be torn down and a fresh
                // one installed from the desired record, never the old one
                // (the original tool's bug; fixed per SPEC_FULL.md §9/§4.7).
                self.driver.remove_peer(&self.iface_name, &applied.public_key)?;
                self.driver.set_peer(&self.iface_name, wanted)?;
                tracing::info!(%phys_ip, old_key = %applied.public_key, new_key = %wanted.public_key, "peer key rotated");
                self.peers.insert(phys_ip, wanted.clone());
                continue;
            }

            if let Some(change) = field_change(applied, wanted) {
                self.driver.set_peer(&self.iface_name, wanted)?;
                tracing::info!(%phys_ip, %change, "peer reconfigured");
                self.peers.insert(phys_ip, wanted.clone());
            }
        }

        for (phys_ip, wanted) in desired {
            if *phys_ip == self.self_phys_ip || self.peers.contains_key(phys_ip) {
                continue;
            }
            self.driver.set_peer(&self.iface_name, wanted)?;
            tracing::info!(%phys_ip, pubkey = %wanted.public_key, "peer added");
            self.peers.insert(*phys_ip, wanted.clone());
        }

        Ok(())
    }
}

fn field_change(applied: &AppliedPeer, wanted: &DesiredPeer) -> Option<PeerFieldChange> {
    if applied.endpoint != wanted.endpoint {
        return Some(PeerFieldChange::Endpoint { old: applied.endpoint, new: wanted.endpoint });
    }
    if applied.port != wanted.port {
        return Some(PeerFieldChange::Port { old: applied.port, new: wanted.port });
    }
    if applied.allowed_ips != wanted.allowed_ips {
        return Some(PeerFieldChange::AllowedIps { old: applied.allowed_ips, new: wanted.allowed_ips });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_primitives::NodeRecord;
    use autowired_tunnel::mock::MockDriver;
    use std::net::Ipv4Addr;

    fn peer(endpoint: &str, ip: Ipv4Addr, pubkey: &str, port: u16) -> DesiredPeer {
        let record = NodeRecord::new(ip, pubkey, port);
        DesiredPeer::from_node_record(endpoint.parse().unwrap(), &record)
    }

    #[test]
    fn adds_new_peer_and_skips_self() {
        let driver = Arc::new(MockDriver::new());
        let self_ip: IpAddr = "10.0.0.11".parse().unwrap();
        let mut applier = PeerApplier::new(driver.clone(), "wg0".to_string(), self_ip);

        let mut desired = HashMap::new();
        desired.insert(self_ip, peer("10.0.0.11", Ipv4Addr::new(192, 168, 200, 1), "pub-self", 51820));
        desired.insert(
            "10.0.0.12".parse().unwrap(),
            peer("10.0.0.12", Ipv4Addr::new(192, 168, 200, 2), "pub-b", 51820),
        );

        applier.apply(&desired).unwrap();

        assert_eq!(applier.applied_peers().len(), 1);
        assert!(!applier.applied_peers().contains_key(&self_ip));
        assert_eq!(driver.peers_of("wg0").len(), 1);
    }

    #[test]
    fn pubkey_rotation_installs_the_new_key_not_the_stale_one() {
        let driver = Arc::new(MockDriver::new());
        let self_ip: IpAddr = "10.0.0.11".parse().unwrap();
        let mut applier = PeerApplier::new(driver.clone(), "wg0".to_string(), self_ip);

        let peer_ip: IpAddr = "10.0.0.12".parse().unwrap();
        let mut desired = HashMap::new();
        desired.insert(peer_ip, peer("10.0.0.12", Ipv4Addr::new(192, 168, 200, 2), "pub-old", 51820));
        applier.apply(&desired).unwrap();

        desired.insert(peer_ip, peer("10.0.0.12", Ipv4Addr::new(192, 168, 200, 2), "pub-new", 51820));
        applier.apply(&desired).unwrap();

        let installed = driver.peers_of("wg0");
        assert_eq!(installed.len(), 1);
        assert!(installed.contains_key("pub-new"));
        assert!(!installed.contains_key("pub-old"));
        assert_eq!(applier.applied_peers()[&peer_ip].public_key, "pub-new");
    }

    #[test]
    fn removes_peer_that_left_the_desired_set() {
        let driver = Arc::new(MockDriver::new());
        let self_ip: IpAddr = "10.0.0.11".parse().unwrap();
        let mut applier = PeerApplier::new(driver.clone(), "wg0".to_string(), self_ip);

        let peer_ip: IpAddr = "10.0.0.12".parse().unwrap();
        let mut desired = HashMap::new();
        desired.insert(peer_ip, peer("10.0.0.12", Ipv4Addr::new(192, 168, 200, 2), "pub-b", 51820));
        applier.apply(&desired).unwrap();
        assert_eq!(driver.peers_of("wg0").len(), 1);

        desired.remove(&peer_ip);
        applier.apply(&desired).unwrap();
        assert!(driver.peers_of("wg0").is_empty());
        assert!(applier.applied_peers().is_empty());
    }
}
