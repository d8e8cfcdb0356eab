//! Tunnel identity and interface/peer reconciliation (spec §4.1, §4.4, §4.7,
//! §6 "Tunnel driver (abstract)").
//!
//! This crate owns every interaction with the WireGuard device: generating
//! and storing this host's keypair, reconciling the interface's address and
//! listen port against the desired state, and installing/removing peers.
//! Everything above this crate talks to [`InterfaceDriver`], never to
//! `wireguard-control` directly.

mod driver;
mod keys;
mod wireguard;

#[cfg(feature = "test-utils")]
pub mod mock;

pub use driver::{InterfaceDriver, InterfaceState};
pub use keys::ensure_keys;
pub use wireguard::WireguardDriver;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to create key directory")]
    KeyDir { #[source] source: std::io::Error },
    #[error("failed to write private key")]
    KeyWrite { #[source] source: std::io::Error },
    #[error("failed to read private key")]
    KeyRead { #[source] source: std::io::Error },
    #[error("malformed private key at {path}")]
    MalformedKey { path: PathBuf },
    #[error("interface name {0:?} is not a valid WireGuard interface name")]
    InvalidInterfaceName(String),
    #[error("failed to query device {name:?}")]
    DeviceQuery { name: String, #[source] source: std::io::Error },
    #[error("failed to apply device update for {name:?}")]
    DeviceApply { name: String, #[source] source: std::io::Error },
    #[error("failed to write interface config for {name:?}")]
    ConfigWrite { name: String, #[source] source: std::io::Error },
    #[error("command {command:?} failed for interface {name:?}: {detail}")]
    Command { name: String, command: String, detail: String },
    #[error("public key {0:?} is not a valid WireGuard key")]
    InvalidPeerKey(String),
}
