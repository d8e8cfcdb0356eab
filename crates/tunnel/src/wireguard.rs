use std::{
    fs,
    net::Ipv4Addr,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{Command, Output},
    str::FromStr,
};

use autowired_primitives::DesiredPeer;
use get_if_addrs::{get_if_addrs, IfAddr};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::{InterfaceDriver, InterfaceState, TunnelError};

/// Drives a real kernel WireGuard device via `wireguard-control`, with the
/// two operations that crate deliberately leaves out — address assignment
/// and link state — shelled out to `ip`, mirroring what `wg-quick` itself
/// does under the hood.
pub struct WireguardDriver {
    backend: Backend,
}

impl Default for WireguardDriver {
    fn default() -> Self {
        Self { backend: Backend::Kernel }
    }
}

impl WireguardDriver {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn iface_name(&self, name: &str) -> Result<InterfaceName, TunnelError> {
        InterfaceName::from_str(name).map_err(|_| TunnelError::InvalidInterfaceName(name.to_string()))
    }

    fn run(&self, name: &str, mut command: Command) -> Result<Output, TunnelError> {
        let program = format!("{:?}", command.get_program());
        command.output().map_err(|source| TunnelError::Command {
            name: name.to_string(),
            command: program,
            detail: source.to_string(),
        })
    }

    fn assigned_address(&self, name: &str) -> Option<(Ipv4Addr, u8)> {
        let interfaces = get_if_addrs().ok()?;
        interfaces
            .into_iter()
            .find(|i| i.name == name)
            .and_then(|i| match i.addr {
                IfAddr::V4(v4) => {
                    let prefix_len = prefix_len_from_netmask(v4.netmask);
                    Some((v4.ip, prefix_len))
                }
                IfAddr::V6(_) => None,
            })
    }
}

fn prefix_len_from_netmask(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

impl InterfaceDriver for WireguardDriver {
    fn is_up(&self, name: &str) -> Result<bool, TunnelError> {
        Ok(self.current_state(name)?.is_some())
    }

    fn current_state(&self, name: &str) -> Result<Option<InterfaceState>, TunnelError> {
        let iface = self.iface_name(name)?;
        let device = match Device::get(&iface, self.backend) {
            Ok(device) => device,
            Err(_) => return Ok(None),
        };

        let Some((address, prefix_len)) = self.assigned_address(name) else {
            return Ok(None);
        };

        let private_key = device
            .private_key
            .map(|k| k.to_base64())
            .ok_or_else(|| TunnelError::DeviceQuery {
                name: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "device has no private key"),
            })?;

        Ok(Some(InterfaceState {
            address,
            prefix_len,
            listen_port: device.listen_port.unwrap_or_default(),
            private_key,
        }))
    }

    fn write_config(&self, path: &Path, _name: &str, desired: &InterfaceState) -> Result<(), TunnelError> {
        let contents = format!(
            "[Interface]\nPrivateKey = {}\nAddress = {}/{}\nListenPort = {}\n",
            desired.private_key, desired.address, desired.prefix_len, desired.listen_port
        );
        fs::write(path, contents).map_err(|source| TunnelError::ConfigWrite {
            name: _name.to_string(),
            source,
        })?;

        let mut perms = fs::metadata(path)
            .map_err(|source| TunnelError::ConfigWrite { name: _name.to_string(), source })?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).map_err(|source| TunnelError::ConfigWrite {
            name: _name.to_string(),
            source,
        })
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn bring_up(&self, name: &str, config_path: &Path) -> Result<(), TunnelError> {
        let iface = self.iface_name(name)?;
        let desired = parse_config(config_path, name)?;

        // `ip link add` fails benignly if the device already exists; ignored below.
        let mut add = Command::new("ip");
        add.args(["link", "add", name, "type", "wireguard"]);
        let _ = self.run(name, add)?;

        let private_key = Key::from_base64(&desired.private_key)
            .map_err(|_| TunnelError::InvalidPeerKey(desired.private_key.clone()))?;
        DeviceUpdate::new()
            .set_private_key(private_key)
            .set_listen_port(desired.listen_port)
            .apply(&iface, self.backend)
            .map_err(|source| TunnelError::DeviceApply { name: name.to_string(), source })?;

        let mut addr = Command::new("ip");
        addr.args(["address", "add", &format!("{}/{}", desired.address, desired.prefix_len), "dev", name]);
        let _ = self.run(name, addr)?;

        let mut up = Command::new("ip");
        up.args(["link", "set", name, "up"]);
        self.run(name, up)?;

        tracing::info!(%name, address = %desired.address, port = desired.listen_port, "interface up");
        Ok(())
    }

    fn bring_down(&self, name: &str) -> Result<(), TunnelError> {
        let mut del = Command::new("ip");
        del.args(["link", "delete", name]);
        self.run(name, del)?;
        tracing::info!(%name, "interface down");
        Ok(())
    }

    fn set_peer(&self, name: &str, peer: &DesiredPeer) -> Result<(), TunnelError> {
        let iface = self.iface_name(name)?;
        let key = Key::from_base64(&peer.public_key).map_err(|_| TunnelError::InvalidPeerKey(peer.public_key.clone()))?;

        let endpoint = std::net::SocketAddr::new(peer.endpoint, peer.port);
        let builder = PeerConfigBuilder::new(&key)
            .set_endpoint(endpoint)
            .add_allowed_ip(peer.allowed_ips.network(), peer.allowed_ips.prefix_len());

        DeviceUpdate::new()
            .add_peer(builder)
            .apply(&iface, self.backend)
            .map_err(|source| TunnelError::DeviceApply { name: name.to_string(), source })?;

        tracing::debug!(%name, pubkey = %peer.public_key, %endpoint, "peer installed");
        Ok(())
    }

    fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), TunnelError> {
        let iface = self.iface_name(name)?;
        let key = Key::from_base64(public_key).map_err(|_| TunnelError::InvalidPeerKey(public_key.to_string()))?;

        DeviceUpdate::new()
            .remove_peer_by_key(&key)
            .apply(&iface, self.backend)
            .map_err(|source| TunnelError::DeviceApply { name: name.to_string(), source })?;

        tracing::debug!(%name, pubkey = %public_key, "peer removed");
        Ok(())
    }
}

/// Parses the minimal `[Interface]` block [`WireguardDriver::write_config`]
/// writes. Deliberately not a general wg-quick parser: this daemon only ever
/// reads files it wrote itself.
fn parse_config(path: &Path, name: &str) -> Result<InterfaceState, TunnelError> {
    let contents = fs::read_to_string(path).map_err(|source| TunnelError::ConfigWrite {
        name: name.to_string(),
        source,
    })?;

    let mut private_key = None;
    let mut address = None;
    let mut prefix_len = None;
    let mut listen_port = None;

    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "PrivateKey" => private_key = Some(value.to_string()),
            "Address" => {
                if let Some((ip, len)) = value.split_once('/') {
                    address = Ipv4Addr::from_str(ip).ok();
                    prefix_len = len.parse().ok();
                }
            }
            "ListenPort" => listen_port = value.parse().ok(),
            _ => {}
        }
    }

    let io_err = |what: &str| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("config missing {what}"))
    };

    Ok(InterfaceState {
        address: address.ok_or_else(|| TunnelError::ConfigWrite { name: name.to_string(), source: io_err("Address") })?,
        prefix_len: prefix_len.ok_or_else(|| TunnelError::ConfigWrite { name: name.to_string(), source: io_err("Address prefix") })?,
        listen_port: listen_port.ok_or_else(|| TunnelError::ConfigWrite { name: name.to_string(), source: io_err("ListenPort") })?,
        private_key: private_key.ok_or_else(|| TunnelError::ConfigWrite { name: name.to_string(), source: io_err("PrivateKey") })?,
    })
}
