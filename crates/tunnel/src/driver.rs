use std::net::Ipv4Addr;

use autowired_primitives::DesiredPeer;

use crate::TunnelError;

/// The fields of a WireGuard interface the Reconciler compares against the
/// desired state (spec §4.4, invariant I4: address/key/port must always
/// match the claimed record; never silently drift).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub listen_port: u16,
    pub private_key: String,
}

/// Abstract collaborator for everything this daemon does to a WireGuard
/// interface. A concrete implementation backs onto the kernel (or userspace)
/// WireGuard device via [`crate::WireguardDriver`]; tests substitute
/// [`crate::mock::MockDriver`] so the rest of the daemon never touches a real
/// network device.
pub trait InterfaceDriver: Send + Sync {
    /// Is the named interface currently up?
    fn is_up(&self, name: &str) -> Result<bool, TunnelError>;

    /// The interface's current address/key/port, or `None` if it does not
    /// exist (down, or never created).
    fn current_state(&self, name: &str) -> Result<Option<InterfaceState>, TunnelError>;

    /// Writes a static `wg-quick`-style config file for `name` to `path`,
    /// establishing the interface's bootstrap identity. Mode 0600: the file
    /// contains the private key.
    fn write_config(&self, path: &std::path::Path, name: &str, desired: &InterfaceState) -> Result<(), TunnelError>;

    /// Brings `name` up from the config file previously written by
    /// [`write_config`](Self::write_config), assigning its address and
    /// setting it administratively up.
    fn bring_up(&self, name: &str, config_path: &std::path::Path) -> Result<(), TunnelError>;

    /// Tears `name` down entirely. Used when the Reconciler finds the
    /// interface in a state it cannot patch in place (spec §4.4).
    fn bring_down(&self, name: &str) -> Result<(), TunnelError>;

    /// Installs or updates a peer on `name` (spec §4.7: add, or replace on
    /// any field change).
    fn set_peer(&self, name: &str, peer: &DesiredPeer) -> Result<(), TunnelError>;

    /// Removes a peer identified by its current public key.
    fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), TunnelError>;
}
