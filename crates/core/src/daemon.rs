//! The multiplexer: owns the Applied Peer Set, drives the Peer Applier and
//! Reaper off the two watcher channels, and is the only task that ever
//! mutates `peers` (spec §4.7, §4.8, §5).

use std::{collections::HashMap, net::IpAddr, path::PathBuf, sync::Arc};

use autowired_config::Config;
use autowired_consul::{ConsulError, KvStore};
use autowired_primitives::NodeRecord;
use autowired_tunnel::{InterfaceDriver, InterfaceState, TunnelError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    allocator::{Allocator, AllocatorError},
    node_watcher::NodeWatcher,
    peer_applier::PeerApplier,
    peer_watcher::PeerWatcher,
    reaper::Reaper,
    state::DaemonState,
};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("allocator error")]
    Allocator(#[from] AllocatorError),
    #[error("reconciler error")]
    Reconciler(#[from] crate::reconciler::ReconcilerError),
    #[error("tunnel driver error")]
    Driver(#[from] TunnelError),
    #[error("KV error")]
    Kv(#[from] ConsulError),
}

/// Everything the daemon needs once Identity & Address Resolution (spec
/// §4.1, §4.2) have already run. Those two steps live in `autowired-tunnel`
/// and `autowired-net` respectively and are performed by the binary before
/// constructing a `Daemon`.
pub struct Daemon {
    config: Config,
    kv: Arc<dyn KvStore>,
    driver: Arc<dyn InterfaceDriver>,
    physical_ip: IpAddr,
    private_key: String,
    public_key: String,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        driver: Arc<dyn InterfaceDriver>,
        physical_ip: IpAddr,
        private_key: String,
        public_key: String,
        cancel: CancellationToken,
    ) -> Self {
        Self { config, kv, driver, physical_ip, private_key, public_key, cancel }
    }

    fn driver_config_path(&self) -> PathBuf {
        self.config.config_dir.join(format!("{}.conf", self.config.iface_name))
    }

    /// Runs Boot through Watching once, then blocks in the watch loop until
    /// cancellation or a fatal error (spec §3 Lifecycle).
    pub async fn run(self) -> Result<(), CoreError> {
        tracing::info!(state = ?DaemonState::Keyed, "tunnel identity established");

        let allocator = Allocator::new(
            Arc::clone(&self.kv),
            self.config.kv_root(),
            self.config.range,
            self.config.listen_port,
            self.public_key.clone(),
            self.physical_ip,
        );

        tracing::info!(state = ?DaemonState::Addressed, "claiming overlay address");
        let record = allocator.ensure_claimed().await?;
        tracing::info!(state = ?DaemonState::Claimed, ip = %record.overlay_ip, "overlay address claimed");

        let reconciler = crate::reconciler::Reconciler::new(
            Arc::clone(&self.driver),
            self.config.iface_name.clone(),
            self.driver_config_path(),
        );
        let desired_iface = InterfaceState {
            address: record.overlay_ip,
            prefix_len: self.config.range.prefix_len(),
            listen_port: self.config.listen_port,
            private_key: self.private_key.clone(),
        };
        reconciler.reconcile(&desired_iface).await?;
        tracing::info!(state = ?DaemonState::Configured, "interface reconciled");

        self.watch(record).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(overlay_ip = %record.overlay_ip))]
    async fn watch(self, record: NodeRecord) -> Result<(), CoreError> {
        tracing::info!(state = ?DaemonState::Watching, "entering watch loop");

        // tokio's mpsc requires buffer >= 1; this is the closest stand-in
        // for the spec's capacity-0 rendezvous channel (spec §5).
        let (peer_tx, mut peer_rx) = mpsc::channel(1);
        let (node_tx, mut node_rx) = mpsc::channel(1);

        let node_watcher = NodeWatcher::new(Arc::clone(&self.kv), &self.config.kv_root());
        let reaper_status = node_watcher.spawn_lock_acquisition(self.cancel.clone());

        let peer_watcher = PeerWatcher::new(Arc::clone(&self.kv), &self.config.kv_root());
        let peer_task = tokio::spawn(peer_watcher.run(peer_tx, self.cancel.clone()));
        let node_task = tokio::spawn(node_watcher.run(node_tx, self.cancel.clone()));

        let mut applier = PeerApplier::new(Arc::clone(&self.driver), self.config.iface_name.clone(), self.physical_ip);
        let reaper = Reaper::new(Arc::clone(&self.kv), self.config.kv_root());
        let mut latest_catalog: HashMap<IpAddr, String> = HashMap::new();

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                maybe_desired = peer_rx.recv() => {
                    let Some(desired) = maybe_desired else { break Ok(()) };
                    if let Err(error) = applier.apply(&desired) {
                        break Err(CoreError::Driver(error));
                    }
                }
                maybe_catalog = node_rx.recv() => {
                    let Some(catalog) = maybe_catalog else { break Ok(()) };
                    latest_catalog = catalog;
                    if reaper_status.is_held() {
                        if let Err(error) = reaper.reap(applier.applied_peers(), &latest_catalog).await {
                            break Err(CoreError::Kv(error));
                        }
                    }
                }
            }
        };

        peer_task.abort();
        node_task.abort();
        result
    }
}
