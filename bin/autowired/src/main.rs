//! Process bootstrap for the autowired daemon: loads configuration,
//! establishes tunnel identity, resolves the physical endpoint, wires the
//! KV and interface driver collaborators, and runs the daemon until a
//! termination signal (spec §6 "Process bootstrap, config parsing, logging").

use std::sync::Arc;

use autowired_config::Config;
use autowired_consul::{HttpConsulClient, KvStore};
use autowired_core::Daemon;
use autowired_tunnel::{ensure_keys, InterfaceDriver, WireguardDriver};
use color_eyre::eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    autowired_tracing::init();

    let config = Config::from_env().wrap_err("loading configuration")?;
    tracing::info!(?config, "starting autowired");

    let (private_key, public_key) =
        ensure_keys(&config.key_dir()).wrap_err("establishing tunnel identity")?;

    let physical_ip =
        autowired_net::resolve_physical_ip(&config.nic).wrap_err("resolving physical IP")?;
    tracing::info!(%physical_ip, nic = %config.nic, "resolved physical endpoint");

    let kv: Arc<dyn KvStore> = Arc::new(HttpConsulClient::new(config.consul_addr.clone()));
    let driver: Arc<dyn InterfaceDriver> = Arc::new(WireguardDriver::default());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let daemon = Daemon::new(config, kv, driver, physical_ip, private_key, public_key, cancel);
    daemon.run().await.wrap_err("daemon exited with a fatal error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Propagates SIGINT/SIGTERM into the cancellation token threaded through
/// the watchers and multiplexer (spec §5: "a real, working cancellation
/// primitive", replacing the original's never-signaled `stopCh`).
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(%error, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("received SIGINT, shutting down");
                    cancel.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received Ctrl-C, shutting down");
        }

        cancel.cancel();
    });
}
