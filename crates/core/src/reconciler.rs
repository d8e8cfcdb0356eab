//! Interface Reconciler: drives the local tunnel interface toward the
//! declared state, rebuilding rather than patching in place (spec §4.4).

use std::{path::PathBuf, sync::Arc};

use autowired_tunnel::{InterfaceDriver, InterfaceState, TunnelError};

const MAX_RECONCILE_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("tunnel driver error")]
    Driver(#[from] TunnelError),
    #[error("interface did not converge to the desired state after {0} attempts")]
    NotConverged(u32),
}

pub struct Reconciler {
    driver: Arc<dyn InterfaceDriver>,
    iface_name: String,
    config_path: PathBuf,
}

impl Reconciler {
    pub fn new(driver: Arc<dyn InterfaceDriver>, iface_name: String, config_path: PathBuf) -> Self {
        Self { driver, iface_name, config_path }
    }

    /// Brings the interface to exactly `desired`, rebuilding from scratch on
    /// any mismatch rather than patching fields in place (spec §4.4 step 2,
    /// "Rationale").
    #[tracing::instrument(level = "info", skip(self, desired))]
    pub async fn reconcile(&self, desired: &InterfaceState) -> Result<(), ReconcilerError> {
        for attempt in 0..MAX_RECONCILE_ATTEMPTS {
            match self.driver.current_state(&self.iface_name)? {
                Some(actual) if &actual == desired => {
                    tracing::debug!(attempt, "interface already consistent");
                    return Ok(());
                }
                Some(actual) => {
                    tracing::warn!(?actual, ?desired, attempt, "interface state drifted, tearing down");
                    self.driver.bring_down(&self.iface_name)?;
                }
                None => {
                    self.driver.write_config(&self.config_path, &self.iface_name, desired)?;
                    self.driver.bring_up(&self.iface_name, &self.config_path)?;
                }
            }
        }

        Err(ReconcilerError::NotConverged(MAX_RECONCILE_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_tunnel::mock::MockDriver;
    use std::net::Ipv4Addr;

    fn desired() -> InterfaceState {
        InterfaceState {
            address: Ipv4Addr::new(192, 168, 200, 1),
            prefix_len: 24,
            listen_port: 51820,
            private_key: "priv".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn brings_up_a_fresh_interface() {
        let driver = Arc::new(MockDriver::new());
        let reconciler = Reconciler::new(driver.clone(), "wg0".to_string(), "/tmp/wg0.conf".into());

        reconciler.reconcile(&desired()).await.unwrap();
        assert!(driver.is_up("wg0").unwrap());
        assert_eq!(driver.current_state("wg0").unwrap(), Some(desired()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rebuilds_on_drift() {
        let driver = Arc::new(MockDriver::new());
        let reconciler = Reconciler::new(driver.clone(), "wg0".to_string(), "/tmp/wg0.conf".into());
        reconciler.reconcile(&desired()).await.unwrap();

        let mut drifted = desired();
        drifted.listen_port = 51821;
        driver.write_config(&PathBuf::from("/tmp/wg0.conf"), "wg0", &drifted).unwrap();
        driver.bring_up("wg0", &PathBuf::from("/tmp/wg0.conf")).unwrap();

        reconciler.reconcile(&desired()).await.unwrap();
        assert_eq!(driver.current_state("wg0").unwrap(), Some(desired()));
    }
}
