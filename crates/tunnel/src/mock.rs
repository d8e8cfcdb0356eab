//! In-memory [`InterfaceDriver`] for daemon-level integration tests
//! (spec §8, scenarios S1-S6 / properties P1-P5). No kernel device, no
//! subprocesses: peers and interface state live in a `Mutex`.

use std::{collections::HashMap, sync::Mutex};

use autowired_primitives::DesiredPeer;

use crate::{InterfaceDriver, InterfaceState, TunnelError};

#[derive(Default)]
pub struct MockDriver {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    interfaces: HashMap<String, InterfaceState>,
    peers: HashMap<String, HashMap<String, DesiredPeer>>,
    up: HashMap<String, bool>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: snapshot the peers currently installed on `name`.
    pub fn peers_of(&self, name: &str) -> HashMap<String, DesiredPeer> {
        self.inner.lock().unwrap().peers.get(name).cloned().unwrap_or_default()
    }
}

impl InterfaceDriver for MockDriver {
    fn is_up(&self, name: &str) -> Result<bool, TunnelError> {
        Ok(self.inner.lock().unwrap().up.get(name).copied().unwrap_or(false))
    }

    fn current_state(&self, name: &str) -> Result<Option<InterfaceState>, TunnelError> {
        let guard = self.inner.lock().unwrap();
        if !guard.up.get(name).copied().unwrap_or(false) {
            return Ok(None);
        }
        Ok(guard.interfaces.get(name).cloned())
    }

    fn write_config(&self, _path: &std::path::Path, name: &str, desired: &InterfaceState) -> Result<(), TunnelError> {
        self.inner.lock().unwrap().interfaces.insert(name.to_string(), desired.clone());
        Ok(())
    }

    fn bring_up(&self, name: &str, _config_path: &std::path::Path) -> Result<(), TunnelError> {
        self.inner.lock().unwrap().up.insert(name.to_string(), true);
        Ok(())
    }

    fn bring_down(&self, name: &str) -> Result<(), TunnelError> {
        let mut guard = self.inner.lock().unwrap();
        guard.up.insert(name.to_string(), false);
        guard.peers.remove(name);
        Ok(())
    }

    fn set_peer(&self, name: &str, peer: &DesiredPeer) -> Result<(), TunnelError> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(name.to_string())
            .or_default()
            .insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), TunnelError> {
        if let Some(peers) = self.inner.lock().unwrap().peers.get_mut(name) {
            peers.remove(public_key);
        }
        Ok(())
    }
}
